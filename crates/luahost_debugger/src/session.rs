// Per-VM step state.
//
// `StepTracker` decides, for each line event, whether execution should
// suspend. It never touches the VM, so the break rules can be driven from
// synthetic depths and tokens.

use crate::protocol::{ServerTag, SuspendReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecuteState {
    #[default]
    Running,
    Break,
    StepInto,
    StepOver,
    StepOut,
}

impl ExecuteState {
    /// State requested by a server command. A server `Break` behaves as a
    /// step into the next line.
    pub fn from_server_tag(tag: ServerTag) -> Option<Self> {
        match tag {
            ServerTag::Break | ServerTag::StepInto => Some(Self::StepInto),
            ServerTag::Continue => Some(Self::Running),
            ServerTag::StepOut => Some(Self::StepOut),
            ServerTag::StepOver => Some(Self::StepOver),
            _ => None,
        }
    }
}

/// Packs a source location as `(line << 16) | file_id`.
pub fn pack_token(line: u16, file_id: u16) -> u32 {
    (u32::from(line) << 16) | u32::from(file_id)
}

pub fn token_line(token: u32) -> u16 {
    (token >> 16) as u16
}

pub fn token_file_id(token: u32) -> u16 {
    (token & 0xFFFF) as u16
}

/// Script name the server knows a chunk by: `@scripts/foo.lua` becomes
/// `scripts/foo`. Chunks not loaded from a file have no name.
pub fn file_name_from_source(source: &str) -> Option<&str> {
    let path = source.strip_prefix('@')?;
    let end = if path.len() >= 4 { path.len() - 4 } else { path.len() };
    path.get(..end)
}

#[derive(Debug, Clone, Default)]
pub struct StepTracker {
    state: ExecuteState,
    pending: ExecuteState,
    /// Depth and token recorded at the last break or state change.
    depth: Option<usize>,
    token: u32,
}

impl StepTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ExecuteState {
        self.state
    }

    pub fn recorded_depth(&self) -> Option<usize> {
        self.depth
    }

    pub fn recorded_token(&self) -> u32 {
        self.token
    }

    /// Called on every line event. Returns the reason to suspend, if any.
    pub fn on_line(&mut self, depth: usize, token: u32, armed: bool) -> Option<SuspendReason> {
        match self.state {
            ExecuteState::StepInto => Some(SuspendReason::Step),
            ExecuteState::StepOut => match self.depth {
                Some(recorded) if depth < recorded => Some(SuspendReason::Step),
                _ => None,
            },
            ExecuteState::StepOver => match self.depth {
                Some(recorded) if depth <= recorded && token != self.token => {
                    Some(SuspendReason::Step)
                }
                _ => None,
            },
            ExecuteState::Running | ExecuteState::Break => self.on_running_line(depth, token, armed),
        }
    }

    fn on_running_line(&mut self, depth: usize, token: u32, armed: bool) -> Option<SuspendReason> {
        let Some(recorded) = self.depth else {
            return armed.then_some(SuspendReason::Breakpoint);
        };
        if armed {
            // Same breakpoint again, from a call on that line or a deeper
            // recursive hit.
            if token == self.token && depth >= recorded {
                return None;
            }
            return Some(SuspendReason::Breakpoint);
        }
        // Left the recorded line; it may break again.
        if depth < recorded || (depth == recorded && token != self.token) {
            self.token = 0;
        }
        None
    }

    /// Entering a break: remember where it happened.
    pub fn enter_break(&mut self, depth: usize, token: u32) {
        self.state = ExecuteState::Break;
        self.pending = ExecuteState::Break;
        self.depth = Some(depth);
        self.token = token;
    }

    /// Queues a state change from the server. Applied by the break loop.
    pub fn request(&mut self, state: ExecuteState) {
        self.pending = state;
    }

    pub fn has_pending_change(&self) -> bool {
        self.pending != self.state
    }

    /// Applies a queued change and records the location it was issued at.
    pub fn apply_pending(&mut self, depth: usize, token: u32) -> bool {
        if self.pending == self.state {
            return false;
        }
        self.state = self.pending;
        self.depth = Some(depth);
        self.token = token;
        true
    }
}
