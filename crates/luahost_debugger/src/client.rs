// Debugger client: a receive thread and a send thread talking to the
// debugger server, and a line hook that suspends VM threads on breaks.
//
// The network threads never touch a VM. Requests that need one (frames,
// children, set-variable) are parked on the VM's session entry and the
// suspended VM thread services them from its break loop.

use std::io::{self, BufReader};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use luahost::{DebuggerAttachment, Handle, WeakVm};
use mlua::Lua;
use parking_lot::{Mutex, MutexGuard};

use crate::breakpoints::Breakpoints;
use crate::introspect::{self, DebugLib};
use crate::protocol::{
    self, ClientTag, Message, ProtocolResult, ServerTag, SuspendReason, VariableType,
    DEBUGGER_PORT,
};
use crate::session::{ExecuteState, StepTracker};
use crate::signal::Signal;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1000);
const RECONNECT_INTERVAL: Duration = Duration::from_millis(1000);
const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
struct SetVariableRequest {
    depth: u32,
    path: String,
    kind: VariableType,
    value: String,
}

#[derive(Debug)]
struct VmEntry {
    vm: Handle,
    tracker: StepTracker,
    pending_frame: Option<u32>,
    pending_children: Option<(u32, String)>,
    pending_set: Option<SetVariableRequest>,
}

impl VmEntry {
    fn new(vm: Handle) -> Self {
        Self {
            vm,
            tracker: StepTracker::new(),
            pending_frame: None,
            pending_children: None,
            pending_set: None,
        }
    }

    fn has_pending_request(&self) -> bool {
        self.pending_frame.is_some() || self.pending_children.is_some() || self.pending_set.is_some()
    }
}

#[derive(Debug, Default)]
struct Session {
    breakpoints: Breakpoints,
    vms: Vec<VmEntry>,
    active: Option<Handle>,
    handshake: bool,
    awaiting_sync: bool,
    pending_disconnect: bool,
}

impl Session {
    fn entry_mut(&mut self, vm: Handle) -> Option<&mut VmEntry> {
        self.vms.iter_mut().find(|e| e.vm == vm)
    }

    fn active_entry_mut(&mut self) -> Option<&mut VmEntry> {
        let active = self.active?;
        self.entry_mut(active)
    }

    fn activate(&mut self, vm: Handle) {
        if !self.vms.iter().any(|e| e.vm == vm) {
            self.vms.push(VmEntry::new(vm));
        }
        self.active = Some(vm);
    }

    /// Everything is renegotiated on the next connection.
    fn reset(&mut self) {
        self.breakpoints.clear();
        self.vms.clear();
        self.active = None;
        self.handshake = false;
        self.awaiting_sync = false;
        self.pending_disconnect = false;
    }
}

struct Shared {
    address: String,
    session: Mutex<Session>,
    break_signal: Signal,
    connect_signal: Signal,
    outgoing: Sender<Message>,
    incoming: Receiver<Message>,
    writer: Mutex<Option<TcpStream>>,
    can_send: AtomicBool,
    shutting_down: AtomicBool,
}

impl Shared {
    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    fn enqueue(&self, message: Message) {
        let _ = self.outgoing.send(message);
    }

    fn write(&self, message: &Message) -> bool {
        let mut writer = self.writer.lock();
        let Some(stream) = writer.as_mut() else {
            return false;
        };
        match protocol::write_frame(stream, message) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("debugger send failed: {e}");
                // Wakes the receive thread, which handles the disconnect.
                let _ = stream.shutdown(Shutdown::Both);
                *writer = None;
                false
            }
        }
    }

    fn on_connected(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(true)?;
        *self.writer.lock() = Some(stream.try_clone()?);
        self.can_send.store(true, Ordering::Release);
        log::info!("debugger connected to {}", self.address);
        Ok(())
    }

    fn on_disconnected(&self) {
        self.can_send.store(false, Ordering::Release);
        if let Some(stream) = self.writer.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        {
            let mut session = self.session.lock();
            session.pending_disconnect = true;
            session.awaiting_sync = false;
        }
        // Releases any break or sync in progress.
        self.break_signal.activate();
    }

    fn dispatch(&self, message: &Message) -> ProtocolResult<()> {
        let Some(tag) = message.server_tag() else {
            log::warn!("unknown debugger command {}", message.tag);
            return Ok(());
        };
        let mut reader = message.reader();
        let mut session = self.session.lock();
        match tag {
            ServerTag::Break
            | ServerTag::Continue
            | ServerTag::StepInto
            | ServerTag::StepOut
            | ServerTag::StepOver => {
                if let (Some(state), Some(entry)) =
                    (ExecuteState::from_server_tag(tag), session.active_entry_mut())
                {
                    entry.tracker.request(state);
                }
            }
            ServerTag::GetFrame => {
                let depth = reader.read_u32()?;
                if let Some(entry) = session.active_entry_mut() {
                    entry.pending_frame = Some(depth);
                }
            }
            ServerTag::GetChildren => {
                let depth = reader.read_u32()?;
                let path = reader.read_string()?;
                if let Some(entry) = session.active_entry_mut() {
                    entry.pending_children = Some((depth, path));
                }
            }
            ServerTag::SetVariable => {
                let depth = reader.read_u32()?;
                let path = reader.read_string()?;
                let kind = VariableType::from_i32(reader.read_i32()?).unwrap_or(VariableType::Nil);
                let value = reader.read_string()?;
                if let Some(entry) = session.active_entry_mut() {
                    entry.pending_set = Some(SetVariableRequest {
                        depth,
                        path,
                        kind,
                        value,
                    });
                }
            }
            ServerTag::SetBreakpoints => {
                session.breakpoints.apply(&mut reader)?;
                session.awaiting_sync = false;
                log::debug!("{} breakpoints armed", session.breakpoints.armed_count());
            }
            ServerTag::AddWatch | ServerTag::RemoveWatch => {
                log::warn!("unsupported debugger command {tag:?}");
                return Ok(());
            }
        }
        drop(session);
        self.break_signal.activate();
        Ok(())
    }
}

fn connect(address: &str) -> io::Result<TcpStream> {
    let mut last = io::Error::new(io::ErrorKind::NotFound, "no address resolved");
    for addr in address.to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
            Ok(stream) => return Ok(stream),
            Err(e) => last = e,
        }
    }
    Err(last)
}

fn receive_thread(shared: Arc<Shared>) {
    while !shared.is_shutting_down() {
        let stream = match connect(&shared.address) {
            Ok(stream) => stream,
            Err(e) => {
                log::trace!("debugger server not reachable at {}: {e}", shared.address);
                shared.connect_signal.wait_timeout(RECONNECT_INTERVAL);
                continue;
            }
        };
        if let Err(e) = shared.on_connected(&stream) {
            log::warn!("debugger connection setup failed: {e}");
            shared.connect_signal.wait_timeout(RECONNECT_INTERVAL);
            continue;
        }

        let mut reader = BufReader::new(stream);
        while !shared.is_shutting_down() {
            let message = match protocol::read_frame(&mut reader) {
                Ok(message) => message,
                Err(e) => {
                    if !shared.is_shutting_down() {
                        log::warn!("debugger connection lost: {e}");
                    }
                    break;
                }
            };
            if let Err(e) = shared.dispatch(&message) {
                log::warn!("malformed debugger command {}: {e}", message.tag);
            }
        }
        shared.on_disconnected();
    }
}

fn send_thread(shared: Arc<Shared>) {
    let mut last_send = Instant::now();
    while !shared.is_shutting_down() {
        match shared.incoming.recv_timeout(HEARTBEAT_INTERVAL) {
            Ok(message) => {
                // Dropped when no server is connected.
                if shared.write(&message) {
                    last_send = Instant::now();
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if shared.can_send.load(Ordering::Acquire)
            && last_send.elapsed() >= HEARTBEAT_INTERVAL
            && shared.write(&Message::client(ClientTag::Heartbeat))
        {
            last_send = Instant::now();
        }
    }
}

/// Connects to a debugger server in the background and suspends VMs that
/// hit breakpoints. Attach it through `VmSettings::with_debugger`.
pub struct DebuggerClient {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl DebuggerClient {
    /// Connects to `host` on the standard debugger port.
    pub fn connect(host: &str) -> io::Result<Self> {
        Self::connect_to(format!("{host}:{DEBUGGER_PORT}"))
    }

    /// Connects to a full `host:port` address, retrying until a server
    /// accepts.
    pub fn connect_to(address: impl Into<String>) -> io::Result<Self> {
        let (outgoing, incoming) = channel::unbounded();
        let shared = Arc::new(Shared {
            address: address.into(),
            session: Mutex::new(Session::default()),
            break_signal: Signal::new(),
            connect_signal: Signal::new(),
            outgoing,
            incoming,
            writer: Mutex::new(None),
            can_send: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
        });

        let receive = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("debugger-receive".to_string())
                .spawn(move || receive_thread(shared))?
        };
        let send = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("debugger-send".to_string())
                .spawn(move || send_thread(shared))?
        };
        Ok(Self {
            shared,
            threads: Mutex::new(vec![receive, send]),
        })
    }

    pub fn address(&self) -> &str {
        &self.shared.address
    }

    pub fn is_connected(&self) -> bool {
        self.shared.can_send.load(Ordering::Acquire)
    }

    /// Number of VMs that have stepped since the last handshake.
    pub fn tracked_vm_count(&self) -> usize {
        self.shared.session.lock().vms.len()
    }

    fn cleanup_disconnect(&self, session: &mut Session) {
        while self.shared.incoming.try_recv().is_ok() {}
        session.reset();
        log::info!("debugger session reset");
    }

    /// Sends the handshake and blocks until the server's breakpoints
    /// arrive.
    fn handshake(&self, session: &mut MutexGuard<'_, Session>) {
        session.handshake = true;
        session.awaiting_sync = true;
        self.shared.break_signal.reset();
        self.shared.enqueue(Message::version());
        self.shared.enqueue(Message::client(ClientTag::AskBreakpoints));
        self.shared.enqueue(Message::client(ClientTag::Sync));
        while session.awaiting_sync && !session.pending_disconnect && !self.shared.is_shutting_down() {
            MutexGuard::unlocked(session, || self.shared.break_signal.wait());
        }
    }

    /// Parks the VM thread until the server resumes it, servicing
    /// introspection requests in between.
    fn suspend(
        &self,
        session: &mut MutexGuard<'_, Session>,
        vm: Handle,
        lua: &Lua,
        reason: SuspendReason,
    ) {
        let lib = match DebugLib::load(lua) {
            Ok(lib) => lib,
            Err(e) => {
                log::warn!("cannot break, debug library unavailable: {e}");
                return;
            }
        };
        self.shared.break_signal.reset();
        self.shared
            .enqueue(introspect::break_at_message(lua, &session.breakpoints, reason));
        let depth = introspect::stack_depth(lua);
        let token = introspect::current_token(lua, &session.breakpoints);
        if let Some(entry) = session.entry_mut(vm) {
            entry.tracker.enter_break(depth, token);
        }

        loop {
            if session.pending_disconnect || self.shared.is_shutting_down() {
                return;
            }
            let Some(entry) = session.entry_mut(vm) else {
                return;
            };
            let frame = entry.pending_frame.take();
            let children = entry.pending_children.take();
            let set = entry.pending_set.take();
            entry.tracker.apply_pending(depth, token);
            let resumed = entry.tracker.state() != ExecuteState::Break;

            if let Some(depth) = frame {
                self.shared.enqueue(introspect::frame_message(&lib, depth));
            }
            if let Some((depth, path)) = children {
                self.shared
                    .enqueue(introspect::children_message(lua, &lib, depth, &path));
            }
            if let Some(request) = set {
                self.shared.enqueue(introspect::set_variable_message(
                    lua,
                    &lib,
                    request.depth,
                    &request.path,
                    request.kind,
                    &request.value,
                ));
            }

            let pending = session
                .entry_mut(vm)
                .is_some_and(|e| e.has_pending_request() || e.tracker.has_pending_change());
            if resumed && !pending {
                return;
            }
            if !pending {
                MutexGuard::unlocked(session, || self.shared.break_signal.wait());
            }
        }
    }
}

impl DebuggerAttachment for DebuggerClient {
    fn on_step(&self, vm: &WeakVm, lua: &Lua, debug: &mlua::Debug<'_>) -> mlua::Result<()> {
        let mut session = self.shared.session.lock();
        if session.pending_disconnect {
            self.cleanup_disconnect(&mut session);
            return Ok(());
        }
        if !self.is_connected() {
            return Ok(());
        }
        if !session.handshake {
            self.handshake(&mut session);
            if session.pending_disconnect {
                return Ok(());
            }
        }

        let handle = vm.handle();
        session.activate(handle);
        let source = debug.source();
        let (token, _) = session
            .breakpoints
            .token_for(source.source.as_deref(), debug.curr_line());
        let armed = session.breakpoints.is_armed(token);
        let depth = introspect::stack_depth(lua);

        let Some(entry) = session.entry_mut(handle) else {
            return Ok(());
        };
        // A pause or step requested while running takes effect here.
        if entry.tracker.state() != ExecuteState::Break && entry.tracker.has_pending_change() {
            entry.tracker.apply_pending(depth, token);
        }
        if let Some(reason) = entry.tracker.on_line(depth, token, armed) {
            self.suspend(&mut session, handle, lua, reason);
        }
        Ok(())
    }

    fn on_vm_destroy(&self, vm: &WeakVm) {
        let handle = vm.handle();
        let mut session = self.shared.session.lock();
        session.vms.retain(|e| e.vm != handle);
        if session.active == Some(handle) {
            session.active = None;
        }
    }
}

impl Drop for DebuggerClient {
    fn drop(&mut self) {
        self.shared.shutting_down.store(true, Ordering::Release);
        if let Some(stream) = self.shared.writer.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.shared.connect_signal.activate();
        self.shared.break_signal.activate();
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
    }
}
