// VM configuration
//
// Data fields deserialize from JSON (or any serde format); delegates and
// collaborators are attached in code with the `with_*` builders.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;

use crate::alloc::ScriptAllocator;
use crate::call::ErrorState;
use crate::content::ScriptContent;
use crate::vm::{DebuggerAttachment, VmHandleTable};

pub type ErrorHandler = Arc<dyn Fn(&ErrorState) + Send + Sync>;
pub type OutputHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Exposed to scripts as `g_bBuildConfigDebug` / `Developer` / `Ship`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum BuildConfig {
    Debug,
    Developer,
    Ship,
}

impl Default for BuildConfig {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            BuildConfig::Debug
        } else {
            BuildConfig::Ship
        }
    }
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct VmSettings {
    pub name: String,
    pub base_paths: Vec<PathBuf>,
    /// Relative path of the script project file. Reloading it always marks
    /// the VM out of date.
    pub project_path: Option<String>,
    pub target_incremental_gc_time_ms: f64,
    pub min_gc_step_size: u32,
    pub initial_gc_step_size: u32,
    pub max_gc_step_size: u32,
    pub enable_memory_profiling: bool,
    pub enable_debugger_hooks: bool,
    pub allow_source_fallback: bool,
    pub build_config: BuildConfig,

    #[serde(skip)]
    pub error_handler: Option<ErrorHandler>,
    #[serde(skip)]
    pub standard_output: Option<OutputHandler>,
    #[serde(skip)]
    pub custom_allocator: Option<Arc<dyn ScriptAllocator>>,
    #[serde(skip)]
    pub content: Option<Arc<dyn ScriptContent>>,
    #[serde(skip)]
    pub handles: Option<Arc<VmHandleTable>>,
    #[serde(skip)]
    pub debugger: Option<Arc<dyn DebuggerAttachment>>,
}

impl Default for VmSettings {
    fn default() -> Self {
        Self {
            name: "vm".to_string(),
            base_paths: vec![PathBuf::from(".")],
            project_path: None,
            target_incremental_gc_time_ms: 1.0,
            min_gc_step_size: 1,
            initial_gc_step_size: 8,
            max_gc_step_size: 64,
            enable_memory_profiling: false,
            enable_debugger_hooks: false,
            allow_source_fallback: true,
            build_config: BuildConfig::default(),
            error_handler: None,
            standard_output: None,
            custom_allocator: None,
            content: None,
            handles: None,
            debugger: None,
        }
    }
}

impl VmSettings {
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Plain source never loads in a `Ship` build, whatever the flag says.
    pub fn source_fallback_enabled(&self) -> bool {
        self.allow_source_fallback && self.build_config != BuildConfig::Ship
    }

    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_paths.push(path.into());
        self
    }

    pub fn with_error_handler(mut self, f: impl Fn(&ErrorState) + Send + Sync + 'static) -> Self {
        self.error_handler = Some(Arc::new(f));
        self
    }

    pub fn with_standard_output(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.standard_output = Some(Arc::new(f));
        self
    }

    pub fn with_allocator(mut self, allocator: Arc<dyn ScriptAllocator>) -> Self {
        self.custom_allocator = Some(allocator);
        self
    }

    pub fn with_content(mut self, content: Arc<dyn ScriptContent>) -> Self {
        self.content = Some(content);
        self
    }

    pub fn with_handles(mut self, handles: Arc<VmHandleTable>) -> Self {
        self.handles = Some(handles);
        self
    }

    pub fn with_debugger(mut self, debugger: Arc<dyn DebuggerAttachment>) -> Self {
        self.debugger = Some(debugger);
        self.enable_debugger_hooks = true;
        self
    }
}

impl fmt::Debug for VmSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmSettings")
            .field("name", &self.name)
            .field("base_paths", &self.base_paths)
            .field("project_path", &self.project_path)
            .field("target_incremental_gc_time_ms", &self.target_incremental_gc_time_ms)
            .field("min_gc_step_size", &self.min_gc_step_size)
            .field("initial_gc_step_size", &self.initial_gc_step_size)
            .field("max_gc_step_size", &self.max_gc_step_size)
            .field("enable_memory_profiling", &self.enable_memory_profiling)
            .field("enable_debugger_hooks", &self.enable_debugger_hooks)
            .field("allow_source_fallback", &self.allow_source_fallback)
            .field("build_config", &self.build_config)
            .field("has_error_handler", &self.error_handler.is_some())
            .field("has_standard_output", &self.standard_output.is_some())
            .field("has_custom_allocator", &self.custom_allocator.is_some())
            .field("has_debugger", &self.debugger.is_some())
            .finish_non_exhaustive()
    }
}
