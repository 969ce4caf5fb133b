// Function call boundaries between host and script

mod error_handler;
mod function_interface;
mod function_invoker;

pub use error_handler::{frame_function_name, ErrorFrame, ErrorState, MAX_ERROR_FRAMES};
pub use function_interface::FunctionInterface;
pub use function_invoker::{FunctionInvoker, InvokeTarget};

pub(crate) use error_handler::{create_traceback_handler, error_reason, protected_call};
pub(crate) use function_interface::{create_native, install_trampoline};
