//! # Allocator Hook
//!
//! The Rust-native stand-in for the original's libc interposition (§2.1,
//! §9): a `#[global_allocator]` wrapper that forwards every allocation to
//! the system allocator and reports it to the resource tracker (C4). This
//! is installed once for the whole binary — every `Box`, `Vec`, `String`
//! and raw `alloc()` call in the process is observed without needing
//! `dlsym`/`LD_PRELOAD` tricks.
//!
//! Mapping accounting (the original's `mmap`/`mremap`/`munmap` hooks)
//! cannot be made transparent the same way, so it is exposed as the
//! explicit wrapper functions in this module that test bodies call in
//! place of the raw syscalls.

use crate::tracker;
use std::alloc::{GlobalAlloc, Layout, System};

/// Global allocator that reports every successful allocation, deallocation
/// and reallocation to the resource tracker.
pub struct TrackingAllocator;

unsafe impl GlobalAlloc for TrackingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc(layout);
        if !ptr.is_null() {
            tracker::track_alloc(ptr as usize, layout.size());
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc_zeroed(layout);
        if !ptr.is_null() {
            tracker::track_alloc(ptr as usize, layout.size());
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // A fatal "no valid memory block" would abort process-wide here
        // since std itself frees through this allocator before the tracker
        // is ever armed (tracking is off until a sandboxed test begins).
        let _ = tracker::track_dealloc(ptr as usize);
        let _ = layout;
        System.dealloc(ptr, layout)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = System.realloc(ptr, layout, new_size);
        if !new_ptr.is_null() {
            tracker::track_realloc(ptr as usize, new_ptr as usize, new_size);
        }
        new_ptr
    }
}

/// Map `len` bytes of anonymous memory, reporting the mapping to the
/// tracker. Test bodies call this instead of the raw `mmap` syscall so
/// mapping accounting still works without transparent interposition.
pub fn mmap_anonymous(len: usize) -> anyhow::Result<*mut libc::c_void> {
    use nix::sys::mman::{mmap_anonymous as nix_mmap, MapFlags, ProtFlags};
    use std::num::NonZeroUsize;

    let len_nz = NonZeroUsize::new(len).ok_or_else(|| anyhow::anyhow!("mmap of zero length"))?;
    let ptr = unsafe {
        nix_mmap(
            None,
            len_nz,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
        )?
    };
    tracker::track_mmap(ptr.as_ptr() as usize, len);
    Ok(ptr.as_ptr())
}

/// Unmap a region previously obtained from [`mmap_anonymous`], reporting
/// the (possibly partial) unmap to the tracker.
///
/// # Safety
/// `addr` and `len` must describe a range previously mapped by this
/// process and not already unmapped.
pub unsafe fn munmap(addr: *mut libc::c_void, len: usize) -> anyhow::Result<()> {
    use nix::sys::mman::munmap as nix_munmap;
    use std::ptr::NonNull;

    let nn = NonNull::new(addr).ok_or_else(|| anyhow::anyhow!("munmap of null pointer"))?;
    nix_munmap(nn, len)?;
    tracker::track_munmap(addr as usize, len).map_err(|e| anyhow::anyhow!(e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::{clear, set_tracking, SnapshotSeries};

    #[test]
    fn mmap_then_full_munmap_nets_to_zero() {
        clear();
        set_tracking(true);
        let mut series = SnapshotSeries::new();
        let ptr = mmap_anonymous(4096).unwrap();
        unsafe { munmap(ptr, 4096).unwrap() };
        let snap = series.snapshot();
        assert_eq!(snap.leaked_bytes(), 0);
        set_tracking(false);
        clear();
    }

    #[test]
    fn partial_munmap_leaves_two_pages_tracked() {
        clear();
        set_tracking(true);
        let mut series = SnapshotSeries::new();
        let ptr = mmap_anonymous(3 * 4096).unwrap();
        let mid = (ptr as usize + 4096) as *mut libc::c_void;
        unsafe { munmap(mid, 4096).unwrap() };
        let snap = series.snapshot();
        assert_eq!(snap.leaked_bytes(), 2 * 4096);
        set_tracking(false);
        clear();
    }
}
