//! Block allocators backing an [`Arena`](super::Arena).

use std::alloc::Layout;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Source of the large blocks an arena carves allocations from.
///
/// An allocator is shared by every block of one arena and may be dropped
/// from whichever thread releases the last handle of a fused group, hence
/// the `Send + Sync` bound.
pub trait BlockAlloc: Send + Sync {
    /// Allocates a block, returning `None` when memory is exhausted.
    fn alloc(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Returns a block to the allocator.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`BlockAlloc::alloc`] on this
    /// allocator with the same `layout`, and must not be used afterwards.
    unsafe fn dealloc(&self, ptr: NonNull<u8>, layout: Layout);

    /// Whether arenas using this allocator may be fused with others.
    ///
    /// Fusing hands block ownership to whichever member is released last,
    /// possibly on another thread.
    fn allows_fuse(&self) -> bool {
        true
    }
}

/// The process allocator (`std::alloc`).
#[derive(Debug, Default, Clone, Copy)]
pub struct HostAlloc;

impl BlockAlloc for HostAlloc {
    fn alloc(&self, layout: Layout) -> Option<NonNull<u8>> {
        if layout.size() == 0 {
            return None;
        }
        // SAFETY: layout has a non-zero size.
        NonNull::new(unsafe { std::alloc::alloc(layout) })
    }

    unsafe fn dealloc(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: forwarded caller contract.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) }
    }
}

/// Host allocator with a hard cap on outstanding bytes.
///
/// Useful for bounding the memory a single decode may consume and for
/// exercising out-of-memory paths.
pub struct LimitedAlloc {
    limit: usize,
    used: AtomicUsize,
    fusable: bool,
}

impl LimitedAlloc {
    /// Creates an allocator that refuses to hand out more than `limit` bytes.
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            used: AtomicUsize::new(0),
            fusable: true,
        }
    }

    /// Set whether arenas on this allocator may be fused
    pub fn fusable(mut self, fusable: bool) -> Self {
        self.fusable = fusable;
        self
    }

    /// Bytes currently handed out
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for LimitedAlloc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LimitedAlloc")
            .field("limit", &self.limit)
            .field("used", &self.used())
            .field("fusable", &self.fusable)
            .finish()
    }
}

impl BlockAlloc for LimitedAlloc {
    fn alloc(&self, layout: Layout) -> Option<NonNull<u8>> {
        let size = layout.size();
        let mut used = self.used.load(Ordering::Relaxed);
        loop {
            let next = used.checked_add(size).filter(|&n| n <= self.limit)?;
            match self
                .used
                .compare_exchange_weak(used, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => used = actual,
            }
        }
        let block = HostAlloc.alloc(layout);
        if block.is_none() {
            self.used.fetch_sub(size, Ordering::Relaxed);
        }
        block
    }

    unsafe fn dealloc(&self, ptr: NonNull<u8>, layout: Layout) {
        self.used.fetch_sub(layout.size(), Ordering::Relaxed);
        // SAFETY: blocks come from HostAlloc with the same layout.
        unsafe { HostAlloc.dealloc(ptr, layout) }
    }

    fn allows_fuse(&self) -> bool {
        self.fusable
    }
}
