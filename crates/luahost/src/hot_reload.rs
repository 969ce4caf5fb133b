// Hot-reload dependency tracking
//
// Handlers are called from the file-watch thread while the VM keeps running,
// so all state sits behind one short-lived lock. The out-of-date flag is sticky
// until the host rebuilds the VM or clears it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use ahash::AHashSet;
use parking_lot::Mutex;

#[derive(Debug, Default)]
struct DependencySets {
    scripts: AHashSet<PathBuf>,
    general: AHashSet<PathBuf>,
    data: AHashSet<PathBuf>,
    scripts_to_monitor: AHashSet<PathBuf>,
    data_to_monitor: AHashSet<PathBuf>,
}

#[derive(Debug, Default)]
pub struct HotLoadData {
    sets: Mutex<DependencySets>,
    project_path: Option<PathBuf>,
    out_of_date: AtomicBool,
}

impl HotLoadData {
    pub fn new(project_path: Option<PathBuf>) -> Self {
        Self {
            project_path,
            ..Self::default()
        }
    }

    pub fn record_script(&self, path: impl Into<PathBuf>) {
        self.sets.lock().scripts.insert(path.into());
    }

    pub fn add_general_dependency(&self, path: impl Into<PathBuf>) {
        self.sets.lock().general.insert(path.into());
    }

    pub fn add_data_dependency(&self, path: impl Into<PathBuf>) {
        self.sets.lock().data.insert(path.into());
    }

    pub fn is_script_loaded(&self, path: &Path) -> bool {
        self.sets.lock().scripts.contains(path)
    }

    /// A watched file changed on disk. Never consumes the event.
    pub fn on_file_change(&self, path: &Path) -> bool {
        let mut sets = self.sets.lock();
        if sets.scripts.contains(path) {
            sets.scripts_to_monitor.insert(path.to_path_buf());
        }
        if sets.data.contains(path) {
            sets.data_to_monitor.insert(path.to_path_buf());
        }
        false
    }

    pub fn on_is_file_loaded(&self, path: &Path) -> bool {
        self.is_script_loaded(path)
    }

    /// A changed file finished reloading. Marks the VM out of date once every
    /// monitored file has settled. Never consumes the event.
    pub fn on_file_load_complete(&self, path: &Path) -> bool {
        let mut sets = self.sets.lock();
        let is_project = self.project_path.as_deref() == Some(path);
        if is_project || sets.general.contains(path) {
            self.out_of_date.store(true, Ordering::Release);
            return false;
        }

        let was_script = sets.scripts_to_monitor.remove(path);
        let was_data = sets.data_to_monitor.remove(path);
        if (was_script || was_data)
            && sets.scripts_to_monitor.is_empty()
            && sets.data_to_monitor.is_empty()
        {
            self.out_of_date.store(true, Ordering::Release);
        }
        false
    }

    pub fn is_out_of_date(&self) -> bool {
        self.out_of_date.load(Ordering::Acquire)
    }

    pub fn clear_out_of_date(&self) {
        self.out_of_date.store(false, Ordering::Release);
    }
}
