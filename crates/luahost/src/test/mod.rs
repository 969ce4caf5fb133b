pub mod test_compiled_unit;
pub mod test_content;
pub mod test_marshal;
pub mod test_vm;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::content::MemoryContent;
use crate::settings::{BuildConfig, VmSettings};
use crate::vm::Vm;

/// Output lines and error reasons captured from a test VM.
#[derive(Default)]
pub struct Captured {
    pub output: Mutex<Vec<String>>,
    pub errors: Mutex<Vec<String>>,
}

/// A VM reading `scripts/*` from `files`, with output and errors captured.
pub fn test_vm(files: &[(&str, &str)]) -> (Vm, Arc<Captured>) {
    let mut content = MemoryContent::new();
    for (path, source) in files {
        content.insert(format!("scripts/{path}"), *source);
    }
    let captured = Arc::new(Captured::default());
    let out = Arc::clone(&captured);
    let err = Arc::clone(&captured);
    let settings = VmSettings {
        name: "test".to_string(),
        base_paths: vec!["scripts".into()],
        build_config: BuildConfig::Developer,
        ..Default::default()
    }
    .with_content(Arc::new(content))
    .with_standard_output(move |line| out.output.lock().push(line.to_string()))
    .with_error_handler(move |state| err.errors.lock().push(state.reason.clone()));
    let vm = Vm::new(settings).expect("vm");
    (vm, captured)
}
