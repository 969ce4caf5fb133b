// Allocation attribution for memory profiling
//
// Every block carries a trailing usize footer holding the id of the owner
// (function or chunk) that was current when the block was last sized. Frees
// debit the footer owner; reallocs debit the old owner and credit whichever
// owner is current at the time of the realloc.
//
// Two owners are tracked. The script owner is the Lua function running on
// the VM, kept current by the call and return hooks. The host owner is the
// innermost host scope (chunk, invoke or native function). A script owner
// wins; entering a host scope masks it until the scope drops.

use std::mem::size_of;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use ahash::AHashMap;
use parking_lot::Mutex;

use super::ScriptAllocator;

pub const ANONYMOUS_OWNER: &str = "<anonymous>";

const FOOTER: usize = size_of::<usize>();

const NO_OWNER: usize = usize::MAX;

/// Owner name for a script function: the chunk name for a main chunk,
/// otherwise `chunk:line` where the function is defined.
pub fn script_owner_name(source: &str, what: &str, line_defined: Option<usize>) -> String {
    let chunk = source
        .strip_prefix('@')
        .or_else(|| source.strip_prefix('='))
        .unwrap_or(source);
    match (what, line_defined) {
        ("main", _) | (_, None) => chunk.to_string(),
        (_, Some(line)) => format!("{chunk}:{line}"),
    }
}

struct Attribution {
    names: Vec<String>,
    ids: AHashMap<String, usize>,
    bytes: Vec<i64>,
}

impl Attribution {
    fn new() -> Self {
        let mut ids = AHashMap::new();
        ids.insert(ANONYMOUS_OWNER.to_string(), 0);
        Self {
            names: vec![ANONYMOUS_OWNER.to_string()],
            ids,
            bytes: vec![0],
        }
    }

    fn apply(&mut self, owner: usize, delta: i64) {
        // Footers from a corrupted block would index past the table; fold them
        // into the anonymous bucket instead.
        let owner = if owner < self.bytes.len() { owner } else { 0 };
        self.bytes[owner] += delta;
    }
}

pub struct ProfilingAllocator {
    inner: Arc<dyn ScriptAllocator>,
    current: AtomicUsize,
    script: AtomicUsize,
    state: Mutex<Attribution>,
}

impl ProfilingAllocator {
    pub fn new(inner: Arc<dyn ScriptAllocator>) -> Self {
        Self {
            inner,
            current: AtomicUsize::new(0),
            script: AtomicUsize::new(NO_OWNER),
            state: Mutex::new(Attribution::new()),
        }
    }

    /// Returns the stable id for `name`, creating it on first use.
    pub fn intern(&self, name: &str) -> usize {
        let mut state = self.state.lock();
        if let Some(id) = state.ids.get(name) {
            return *id;
        }
        let id = state.names.len();
        state.names.push(name.to_string());
        state.bytes.push(0);
        state.ids.insert(name.to_string(), id);
        id
    }

    pub fn current_owner(&self) -> usize {
        match self.script.load(Ordering::Relaxed) {
            NO_OWNER => self.current.load(Ordering::Relaxed),
            owner => owner,
        }
    }

    /// Sets the running script function, or clears it when control is back
    /// in host code.
    pub fn set_script_owner(&self, owner: Option<usize>) {
        self.script.store(owner.unwrap_or(NO_OWNER), Ordering::Relaxed);
    }

    /// Makes `owner` current until the returned scope is dropped.
    pub fn enter(&self, owner: usize) -> OwnerScope<'_> {
        let previous = self.current.swap(owner, Ordering::Relaxed);
        // A script owner left over from an unwound error must not outlive
        // the scope either.
        let previous_script = self.script.swap(NO_OWNER, Ordering::Relaxed);
        OwnerScope {
            allocator: self,
            previous,
            previous_script,
        }
    }

    pub fn enter_named(&self, name: &str) -> OwnerScope<'_> {
        let id = self.intern(name);
        self.enter(id)
    }

    /// Live byte totals per owner, largest first. Owners at or below zero are skipped.
    pub fn report(&self) -> Vec<(String, i64)> {
        let state = self.state.lock();
        let mut out: Vec<(String, i64)> = state
            .names
            .iter()
            .zip(state.bytes.iter())
            .filter(|(_, bytes)| **bytes > 0)
            .map(|(name, bytes)| (name.clone(), *bytes))
            .collect();
        out.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        out
    }

    pub fn bytes_for(&self, name: &str) -> i64 {
        let state = self.state.lock();
        state.ids.get(name).map(|id| state.bytes[*id]).unwrap_or(0)
    }
}

/// Restores the previous allocation owner on drop.
pub struct OwnerScope<'a> {
    allocator: &'a ProfilingAllocator,
    previous: usize,
    previous_script: usize,
}

impl Drop for OwnerScope<'_> {
    fn drop(&mut self) {
        self.allocator.current.store(self.previous, Ordering::Relaxed);
        self.allocator
            .script
            .store(self.previous_script, Ordering::Relaxed);
    }
}

unsafe fn read_footer(block: *mut u8, size: usize) -> usize {
    // SAFETY: every block has FOOTER bytes past its visible size.
    unsafe { ptr::read_unaligned(block.add(size) as *const usize) }
}

unsafe fn write_footer(block: *mut u8, size: usize, owner: usize) {
    // SAFETY: as above.
    unsafe { ptr::write_unaligned(block.add(size) as *mut usize, owner) }
}

impl ScriptAllocator for ProfilingAllocator {
    unsafe fn realloc(&self, ptr: *mut u8, old_size: usize, new_size: usize) -> *mut u8 {
        let old_owner = if ptr.is_null() {
            None
        } else {
            // SAFETY: `ptr` is one of our blocks of `old_size` visible bytes.
            Some(unsafe { read_footer(ptr, old_size) })
        };
        let old_total = if ptr.is_null() { 0 } else { old_size + FOOTER };

        if new_size == 0 {
            // SAFETY: forwarding the caller's contract with the footer included.
            unsafe { self.inner.realloc(ptr, old_total, 0) };
            if let Some(owner) = old_owner {
                self.state.lock().apply(owner, -(old_size as i64));
            }
            return ptr::null_mut();
        }

        // The owner is re-derived on every resize; the block may have migrated
        // to a different calling context since it was first allocated.
        let new_owner = self.current_owner();
        // SAFETY: as above.
        let p = unsafe { self.inner.realloc(ptr, old_total, new_size + FOOTER) };
        if p.is_null() {
            return p;
        }
        // SAFETY: `p` has `new_size + FOOTER` bytes.
        unsafe { write_footer(p, new_size, new_owner) };

        let mut state = self.state.lock();
        if let Some(owner) = old_owner {
            state.apply(owner, -(old_size as i64));
        }
        state.apply(new_owner, new_size as i64);
        p
    }
}
