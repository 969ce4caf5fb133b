//! VM memory allocation hook.
//!
//! The embedded VM routes every allocation through a single realloc-style
//! function. `ScriptAllocator` is the host-facing form of that contract; the
//! VM installs it with [`lua_alloc`] when the state is created.
//!
//! Allocation failure is never reported back to the VM as a null block: the
//! VM has no way to recover mid-operation, so failures go through
//! `std::alloc::handle_alloc_error`, exactly as the global allocator reports them.

mod profiling;

use std::alloc::Layout;
use std::ffi::c_void;
use std::ptr;
use std::sync::Arc;

pub use profiling::{script_owner_name, OwnerScope, ProfilingAllocator, ANONYMOUS_OWNER};

/// Alignment of every block handed to the VM.
pub const BLOCK_ALIGN: usize = 16;

/// Realloc-contract allocator used for all VM memory.
pub trait ScriptAllocator: Send + Sync {
    /// `new_size == 0` frees `ptr` and returns null. A null `ptr` allocates a new
    /// block. Otherwise the block is resized, preserving its contents.
    ///
    /// # Safety
    /// `ptr` must be null or a live block returned by this allocator whose
    /// current size is exactly `old_size`.
    unsafe fn realloc(&self, ptr: *mut u8, old_size: usize, new_size: usize) -> *mut u8;
}

/// Forwards to the process global allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

fn block_layout(size: usize) -> Layout {
    match Layout::from_size_align(size, BLOCK_ALIGN) {
        Ok(layout) => layout,
        Err(_) => std::alloc::handle_alloc_error(Layout::new::<u8>()),
    }
}

impl ScriptAllocator for SystemAllocator {
    unsafe fn realloc(&self, ptr: *mut u8, old_size: usize, new_size: usize) -> *mut u8 {
        if new_size == 0 {
            if !ptr.is_null() && old_size != 0 {
                // SAFETY: caller guarantees `ptr` came from us with `old_size` bytes.
                unsafe { std::alloc::dealloc(ptr, block_layout(old_size)) };
            }
            return ptr::null_mut();
        }

        let new_layout = block_layout(new_size);
        // SAFETY: layouts are non-zero sized; `ptr`/`old_size` per the caller contract.
        let p = unsafe {
            if ptr.is_null() || old_size == 0 {
                std::alloc::alloc(new_layout)
            } else {
                std::alloc::realloc(ptr, block_layout(old_size), new_size)
            }
        };
        if p.is_null() {
            std::alloc::handle_alloc_error(new_layout);
        }
        p
    }
}

/// Owned user-data block passed to the VM as the allocator `ud` pointer.
pub(crate) struct AllocatorHook {
    allocator: Arc<dyn ScriptAllocator>,
}

impl AllocatorHook {
    pub(crate) fn new(allocator: Arc<dyn ScriptAllocator>) -> Box<Self> {
        Box::new(Self { allocator })
    }

    pub(crate) fn as_ud(&self) -> *mut c_void {
        self as *const AllocatorHook as *mut c_void
    }
}

/// The VM's allocation entry point. `ud` is an `AllocatorHook`.
///
/// When `ptr` is null the VM passes an object-type tag in `osize`, not a size,
/// so it is treated as zero.
pub(crate) unsafe extern "C-unwind" fn lua_alloc(
    ud: *mut c_void,
    ptr: *mut c_void,
    osize: usize,
    nsize: usize,
) -> *mut c_void {
    // SAFETY: `ud` is the boxed hook owned by the VM core, alive until after lua_close.
    let hook = unsafe { &*(ud as *const AllocatorHook) };
    let old_size = if ptr.is_null() { 0 } else { osize };
    // SAFETY: the VM only hands back blocks it received from this function.
    unsafe { hook.allocator.realloc(ptr as *mut u8, old_size, nsize) as *mut c_void }
}
