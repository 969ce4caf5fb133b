//! Generation-tagged weak handle table.
//!
//! Maps an opaque `Handle` to a `Weak<T>`. Any thread may allocate, free or
//! resolve concurrently:
//! - resolve only takes the read side of a single slot's lock, never a table lock
//! - allocate/free take the free-list lock briefly plus the write side of one slot
//! - a slot's generation is bumped on free, so a stale handle never resolves,
//!   even after its slot has been recycled
//!
//! Slots live in fixed-size chunks that are published once and never moved.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{Mutex, RwLock};

const CHUNK_SIZE: usize = 1024;
const MAX_CHUNKS: usize = 1024;

/// Opaque handle: `(generation << 32) | index`. Zero is never issued.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Handle(u64);

impl Handle {
    pub const INVALID: Handle = Handle(0);

    fn new(index: u32, generation: u32) -> Self {
        Handle(((generation as u64) << 32) | index as u64)
    }

    pub fn index(self) -> u32 {
        self.0 as u32
    }

    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn is_valid(self) -> bool {
        self.generation() != 0
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}:{})", self.index(), self.generation())
    }
}

struct Slot<T> {
    generation: AtomicU32,
    value: RwLock<Option<Weak<T>>>,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            generation: AtomicU32::new(1),
            value: RwLock::new(None),
        }
    }
}

#[derive(Default)]
struct FreeList {
    free: Vec<u32>,
    next_unused: u32,
}

pub struct HandleTable<T> {
    chunks: Box<[OnceLock<Box<[Slot<T>]>>]>,
    free: Mutex<FreeList>,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        let chunks = (0..MAX_CHUNKS).map(|_| OnceLock::new()).collect();
        Self {
            chunks,
            free: Mutex::new(FreeList::default()),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn slot(&self, index: u32) -> Option<&Slot<T>> {
        let index = index as usize;
        let chunk = self.chunks.get(index / CHUNK_SIZE)?.get()?;
        chunk.get(index % CHUNK_SIZE)
    }

    fn slot_or_init(&self, index: u32) -> Option<&Slot<T>> {
        let index = index as usize;
        let chunk = self
            .chunks
            .get(index / CHUNK_SIZE)?
            .get_or_init(|| (0..CHUNK_SIZE).map(|_| Slot::new()).collect());
        chunk.get(index % CHUNK_SIZE)
    }

    /// Stores `value` and returns a handle for it, or `None` if every slot is in use.
    pub fn allocate(&self, value: Weak<T>) -> Option<Handle> {
        let index = {
            let mut free = self.free.lock();
            match free.free.pop() {
                Some(index) => index,
                None => {
                    if free.next_unused as usize >= CHUNK_SIZE * MAX_CHUNKS {
                        return None;
                    }
                    let index = free.next_unused;
                    free.next_unused += 1;
                    index
                }
            }
        };

        let slot = self.slot_or_init(index)?;
        let mut guard = slot.value.write();
        *guard = Some(value);
        Some(Handle::new(index, slot.generation.load(Ordering::Acquire)))
    }

    /// Releases `handle`. Freeing a stale or invalid handle is a no-op.
    pub fn free(&self, handle: Handle) {
        if !handle.is_valid() {
            return;
        }
        let Some(slot) = self.slot(handle.index()) else {
            return;
        };

        {
            let mut guard = slot.value.write();
            if slot.generation.load(Ordering::Acquire) != handle.generation() {
                return;
            }
            *guard = None;
            let mut next = handle.generation().wrapping_add(1);
            if next == 0 {
                next = 1;
            }
            slot.generation.store(next, Ordering::Release);
        }

        self.free.lock().free.push(handle.index());
    }

    /// Resolves `handle` to a live value. Returns `None` once the handle has been
    /// freed or the value has been dropped.
    pub fn resolve(&self, handle: Handle) -> Option<Arc<T>> {
        if !handle.is_valid() {
            return None;
        }
        let slot = self.slot(handle.index())?;
        let guard = slot.value.read();
        if slot.generation.load(Ordering::Acquire) != handle.generation() {
            return None;
        }
        guard.as_ref()?.upgrade()
    }
}
