// Script content providers
//
// The VM never touches storage directly. `require` and `run_script` resolve
// relative names against each base path in order and ask the provider for a
// loadable unit.
//
// Cooked units may still be in flight when a script asks for them: the
// cooker writes then renames, and a reader can see a missing or short file
// in between. The filesystem provider polls through `wait_for` until the
// unit is complete or the load timeout runs out.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::compiled_unit::{has_universal_signature, CompiledScriptUnit};
use crate::error::ContentError;

pub trait ScriptContent: Send + Sync {
    /// Returns the full path of `relative` under `base` if it exists.
    fn resolve(&self, base: &Path, relative: &str) -> Option<PathBuf>;

    fn load(&self, path: &Path) -> Result<CompiledScriptUnit, ContentError>;
}

/// Reads scripts from the local filesystem.
///
/// Files beginning with the universal signature are parsed as compiled units.
/// Anything else is treated as source text when `allow_source` is set.
#[derive(Debug, Clone)]
pub struct FileSystemContent {
    allow_source: bool,
    load_timeout: Duration,
}

/// How long a load keeps polling a unit that is still being written.
pub const DEFAULT_LOAD_TIMEOUT: Duration = Duration::from_millis(250);

impl FileSystemContent {
    pub fn new(allow_source: bool) -> Self {
        Self {
            allow_source,
            load_timeout: DEFAULT_LOAD_TIMEOUT,
        }
    }

    pub fn with_load_timeout(mut self, timeout: Duration) -> Self {
        self.load_timeout = timeout;
        self
    }

    fn try_load(&self, path: &Path) -> Result<CompiledScriptUnit, ContentError> {
        let bytes = fs::read(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ContentError::NotFound(path.to_path_buf())
            } else {
                ContentError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;

        if has_universal_signature(&bytes) {
            return CompiledScriptUnit::from_universal(path, bytes).map_err(|source| {
                ContentError::Unit {
                    path: path.to_path_buf(),
                    source,
                }
            });
        }
        if !self.allow_source {
            return Err(ContentError::SourceNotAllowed(path.to_path_buf()));
        }
        Ok(CompiledScriptUnit::from_source(path, bytes))
    }
}

impl Default for FileSystemContent {
    fn default() -> Self {
        Self::new(false)
    }
}

/// Errors a concurrent writer can cause. Anything else is final.
fn is_transient(error: &ContentError) -> bool {
    match error {
        ContentError::Unit { .. } => true,
        ContentError::Io { source, .. } => source.kind() != std::io::ErrorKind::PermissionDenied,
        _ => false,
    }
}

impl ScriptContent for FileSystemContent {
    fn resolve(&self, base: &Path, relative: &str) -> Option<PathBuf> {
        let path = base.join(relative);
        path.is_file().then_some(path)
    }

    fn load(&self, path: &Path) -> Result<CompiledScriptUnit, ContentError> {
        let mut last = None;
        let loaded = wait_for(self.load_timeout, || match self.try_load(path) {
            Err(e) if is_transient(&e) => {
                last = Some(e);
                None
            }
            result => Some(result),
        });
        match (loaded, last) {
            (Some(result), _) => result,
            (None, Some(e)) => Err(e),
            (None, None) => Err(ContentError::NotFound(path.to_path_buf())),
        }
    }
}

/// In-memory provider keyed by relative path. Base paths act as prefixes.
#[derive(Debug, Clone, Default)]
pub struct MemoryContent {
    files: ahash::AHashMap<PathBuf, Vec<u8>>,
}

impl MemoryContent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<PathBuf>, source: impl Into<Vec<u8>>) -> &mut Self {
        self.files.insert(path.into(), source.into());
        self
    }
}

impl ScriptContent for MemoryContent {
    fn resolve(&self, base: &Path, relative: &str) -> Option<PathBuf> {
        let path = base.join(relative);
        self.files.contains_key(&path).then_some(path)
    }

    fn load(&self, path: &Path) -> Result<CompiledScriptUnit, ContentError> {
        let bytes = self
            .files
            .get(path)
            .ok_or_else(|| ContentError::NotFound(path.to_path_buf()))?;
        if has_universal_signature(bytes) {
            return CompiledScriptUnit::from_universal(path, bytes.as_slice()).map_err(|source| {
                ContentError::Unit {
                    path: path.to_path_buf(),
                    source,
                }
            });
        }
        Ok(CompiledScriptUnit::from_source(path, bytes.clone()))
    }
}

/// Polls `ready` until it returns a value, yielding the thread between polls.
///
/// Used when a provider completes loads asynchronously. Gives up after `timeout`.
pub fn wait_for<T>(timeout: Duration, mut ready: impl FnMut() -> Option<T>) -> Option<T> {
    let start = Instant::now();
    loop {
        if let Some(value) = ready() {
            return Some(value);
        }
        if start.elapsed() >= timeout {
            return None;
        }
        std::thread::yield_now();
    }
}
