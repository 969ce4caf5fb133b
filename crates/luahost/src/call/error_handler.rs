// Traceback capture for protected calls
//
// Every host-initiated call runs through `xpcall` with a native message
// handler. The handler runs while the failing frames are still on the VM
// stack, records them into an `ErrorState`, and returns the message with a
// rendered traceback appended.

use std::fmt::Write as _;
use std::sync::Arc;

use mlua::{Function, Lua, MultiValue, Value};
use parking_lot::Mutex;

pub const MAX_ERROR_FRAMES: usize = 32;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorFrame {
    pub function: String,
    pub file: String,
    pub line: i32,
}

/// A script error as delivered to the error delegate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorState {
    pub reason: String,
    pub traceback: String,
    pub frames: Vec<ErrorFrame>,
}

impl ErrorState {
    pub fn from_reason(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            traceback: reason.clone(),
            reason,
            frames: Vec::new(),
        }
    }

    /// Walks the live VM stack from the frame that raised the error outwards.
    pub(crate) fn capture(lua: &Lua, reason: String) -> Self {
        let mut frames = Vec::new();
        let mut level = 1;
        while frames.len() < MAX_ERROR_FRAMES {
            let Some(debug) = lua.inspect_stack(level) else {
                break;
            };
            let names = debug.names();
            let source = debug.source();
            frames.push(ErrorFrame {
                function: frame_function_name(
                    names.name.as_deref(),
                    names.name_what.as_deref(),
                    source.what,
                ),
                file: source.short_src.as_deref().unwrap_or("?").to_string(),
                line: debug.curr_line(),
            });
            level += 1;
        }

        let mut traceback = reason.clone();
        traceback.push_str("\nstack traceback:");
        for frame in &frames {
            let _ = write!(traceback, "\n\t{}:", frame.file);
            if frame.line > 0 {
                let _ = write!(traceback, "{}:", frame.line);
            }
            let _ = write!(traceback, " in {}", frame.function);
        }

        Self {
            reason,
            traceback,
            frames,
        }
    }
}

/// `namewhat.name`, then `name`, then `main.Invoke` for a main chunk, else
/// `anonymous.Invoke`.
pub fn frame_function_name(name: Option<&str>, name_what: Option<&str>, what: &str) -> String {
    match (name.filter(|s| !s.is_empty()), name_what.filter(|s| !s.is_empty())) {
        (Some(name), Some(what)) => format!("{what}.{name}"),
        (Some(name), None) => name.to_string(),
        (None, _) if what == "main" => "main.Invoke".to_string(),
        (None, _) => "anonymous.Invoke".to_string(),
    }
}

/// Human-readable reason for an error value raised inside the VM.
pub(crate) fn error_value_reason(value: &Value) -> String {
    match value {
        Value::String(s) => s.to_string_lossy().to_string(),
        Value::Error(e) => error_reason(e),
        Value::Nil => "nil".to_string(),
        other => format!("({} error object)", other.type_name()),
    }
}

pub(crate) fn error_reason(error: &mlua::Error) -> String {
    match error {
        mlua::Error::RuntimeError(msg) => msg.clone(),
        mlua::Error::SyntaxError { message, .. } => message.clone(),
        mlua::Error::CallbackError { cause, .. } => error_reason(cause),
        other => other.to_string(),
    }
}

pub(crate) fn create_traceback_handler(
    lua: &Lua,
    slot: Arc<Mutex<Option<ErrorState>>>,
) -> mlua::Result<Function> {
    lua.create_function(move |lua, value: Value| {
        let state = ErrorState::capture(lua, error_value_reason(&value));
        let message = state.traceback.clone();
        *slot.lock() = Some(state);
        Ok(message)
    })
}

/// Calls `callable` with `args` under `xpcall` + the traceback handler.
pub(crate) fn protected_call(
    xpcall: &Function,
    handler: &Function,
    slot: &Mutex<Option<ErrorState>>,
    callable: Value,
    args: Vec<Value>,
) -> Result<Vec<Value>, ErrorState> {
    let mut call_args = Vec::with_capacity(args.len() + 2);
    call_args.push(callable);
    call_args.push(Value::Function(handler.clone()));
    call_args.extend(args);

    let results = xpcall
        .call::<MultiValue>(MultiValue::from_vec(call_args))
        .map_err(|e| ErrorState::from_reason(error_reason(&e)))?;
    let mut results = results.into_vec();
    let ok = matches!(results.first(), Some(Value::Boolean(true)));
    if results.is_empty() {
        return Err(ErrorState::from_reason("protected call returned no status"));
    }
    results.remove(0);
    if ok {
        return Ok(results);
    }

    let captured = slot.lock().take();
    Err(captured.unwrap_or_else(|| {
        ErrorState::from_reason(results.first().map(error_value_reason).unwrap_or_default())
    }))
}
