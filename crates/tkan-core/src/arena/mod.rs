//! Bump-pointer arena with fusable lifetimes.
//!
//! An [`Arena`] hands out memory from a chain of blocks by bumping a cursor;
//! nothing is freed individually. Everything goes away at once when the
//! last handle of the arena's group is dropped, after the registered
//! cleanup callbacks have run.
//!
//! Two arenas can be [fused](Arena::fuse) so that memory allocated from
//! either stays valid until both are gone. This is what allows a message
//! decoded into one arena to be attached to a tree living in another.
//!
//! ## Example
//!
//! ```
//! use tkan_core::Arena;
//!
//! let a = Arena::new();
//! let b = Arena::new();
//! b.alloc_bytes(b"payload")?;
//! a.fuse(&b)?;
//! drop(b);
//! // b's blocks now belong to the group and live on with `a`.
//! assert!(a.space_allocated() > 0);
//! # Ok::<(), tkan_core::Error>(())
//! ```

mod alloc;
mod cleanup;
mod fuse;

use std::alloc::Layout;
use std::cell::Cell;
use std::fmt;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::error::{Error, Result};

pub use alloc::{BlockAlloc, HostAlloc, LimitedAlloc};
pub(crate) use fuse::ArenaNode;
use fuse::BlockHeader;

/// Alignment of every block the arena requests.
pub(crate) const BLOCK_ALIGN: usize = 16;

const HEADER_SIZE: usize = (mem::size_of::<BlockHeader>() + BLOCK_ALIGN - 1) & !(BLOCK_ALIGN - 1);

/// Block sizing for an [`Arena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaConfig {
    /// Size of the first block (default: 256 bytes)
    pub initial_block_size: usize,
    /// Cap for the geometric block growth (default: 32 KiB)
    pub max_block_size: usize,
    /// Multiplier applied to the block size after each new block (default: 2)
    pub growth_factor: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            initial_block_size: 256,
            max_block_size: 32 * 1024,
            growth_factor: 2,
        }
    }
}

impl ArenaConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the size of the first block
    pub fn initial_block_size(mut self, size: usize) -> Self {
        self.initial_block_size = size.max(HEADER_SIZE + BLOCK_ALIGN);
        self
    }

    /// Set the largest block produced by growth
    pub fn max_block_size(mut self, size: usize) -> Self {
        self.max_block_size = size;
        self
    }

    /// Set the growth multiplier
    pub fn growth_factor(mut self, factor: usize) -> Self {
        self.growth_factor = factor.max(1);
        self
    }
}

/// A single-writer bump allocator.
///
/// The handle is `Send` but not `Sync`: one thread allocates at a time.
/// [`Arena::fuse`] is the only operation that touches another arena's
/// state, and it does so with atomic compare-and-swap on the group root.
pub struct Arena {
    cursor: Cell<*mut u8>,
    end: Cell<*mut u8>,
    next_block_size: Cell<usize>,
    node: NonNull<ArenaNode>,
    config: ArenaConfig,
}

// SAFETY: all state shared with other handles lives in atomics on the node;
// the Cell fields are only touched through &self on the owning thread.
unsafe impl Send for Arena {}

impl Arena {
    /// Creates an arena with default block sizing on the host allocator.
    ///
    /// The first block is allocated on first use.
    pub fn new() -> Self {
        Self::with_config(ArenaConfig::default())
    }

    /// Creates an arena with the given block sizing on the host allocator.
    pub fn with_config(config: ArenaConfig) -> Self {
        Self::with_allocator(Arc::new(HostAlloc), config)
    }

    /// Creates an arena whose blocks come from `alloc`.
    pub fn with_allocator(alloc: Arc<dyn BlockAlloc>, config: ArenaConfig) -> Self {
        let fusable = alloc.allows_fuse();
        Self {
            cursor: Cell::new(ptr::null_mut()),
            end: Cell::new(ptr::null_mut()),
            next_block_size: Cell::new(config.initial_block_size),
            node: ArenaNode::create(alloc, fusable),
            config,
        }
    }

    /// Creates an arena that starts out allocating from `block`.
    ///
    /// The block is never returned to any allocator. Such an arena cannot
    /// be fused, since the group could outlive the caller's block.
    pub fn with_initial_block(block: &'static mut [u8], config: ArenaConfig) -> Self {
        let arena = Self {
            cursor: Cell::new(ptr::null_mut()),
            end: Cell::new(ptr::null_mut()),
            next_block_size: Cell::new(config.initial_block_size),
            node: ArenaNode::create(Arc::new(HostAlloc), false),
            config,
        };
        let range = block.as_mut_ptr_range();
        arena.cursor.set(range.start);
        arena.end.set(range.end);
        arena
    }

    pub(crate) fn node(&self) -> &ArenaNode {
        // SAFETY: the node lives at least as long as this handle.
        unsafe { self.node.as_ref() }
    }

    pub(crate) fn node_ptr(&self) -> NonNull<ArenaNode> {
        self.node
    }

    /// Block sizing this arena was created with
    pub fn config(&self) -> &ArenaConfig {
        &self.config
    }

    /// Allocates `size` bytes aligned to `align` (a power of two).
    ///
    /// The returned memory is uninitialized and stays valid until the
    /// arena's group is destroyed.
    #[inline]
    pub fn allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>> {
        debug_assert!(align.is_power_of_two());
        match self.bump(size, align) {
            Some(p) => Ok(p),
            None => self.allocate_slow(size, align),
        }
    }

    /// Like [`Arena::allocate`] but zero-filled.
    pub fn allocate_zeroed(&self, size: usize, align: usize) -> Result<NonNull<u8>> {
        let p = self.allocate(size, align)?;
        // SAFETY: p is valid for `size` bytes.
        unsafe { ptr::write_bytes(p.as_ptr(), 0, size) };
        Ok(p)
    }

    /// Copies `data` into the arena.
    pub fn alloc_bytes(&self, data: &[u8]) -> Result<&[u8]> {
        if data.is_empty() {
            return Ok(&[]);
        }
        let p = self.allocate(data.len(), 1)?;
        // SAFETY: p is a fresh region of data.len() bytes; the region is
        // never written again and lives as long as the arena.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), p.as_ptr(), data.len());
            Ok(std::slice::from_raw_parts(p.as_ptr(), data.len()))
        }
    }

    /// Grows or shrinks an allocation, in place when it is the most recent one.
    ///
    /// # Safety
    ///
    /// `ptr` must come from this arena's group with a size of `old_size`
    /// and alignment `align`.
    pub(crate) unsafe fn realloc(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
        align: usize,
    ) -> Result<NonNull<u8>> {
        let top = ptr.as_ptr().wrapping_add(old_size);
        if top == self.cursor.get() {
            let room = self.end.get() as usize - ptr.as_ptr() as usize;
            if new_size <= room {
                self.cursor.set(ptr.as_ptr().wrapping_add(new_size));
                return Ok(ptr);
            }
        }
        if new_size <= old_size {
            return Ok(ptr);
        }
        let fresh = self.allocate(new_size, align)?;
        // SAFETY: both regions are valid and distinct.
        unsafe { ptr::copy_nonoverlapping(ptr.as_ptr(), fresh.as_ptr(), old_size) };
        Ok(fresh)
    }

    #[inline]
    fn bump(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let cursor = self.cursor.get();
        if cursor.is_null() {
            return None;
        }
        let addr = cursor as usize;
        let aligned = addr.checked_add(align - 1)? & !(align - 1);
        let end = self.end.get() as usize;
        if aligned > end || end - aligned < size {
            return None;
        }
        let start = cursor.wrapping_add(aligned - addr);
        self.cursor.set(start.wrapping_add(size));
        NonNull::new(start)
    }

    #[cold]
    fn allocate_slow(&self, size: usize, align: usize) -> Result<NonNull<u8>> {
        let needed = size
            .checked_add(align)
            .and_then(|n| n.checked_add(HEADER_SIZE))
            .ok_or_else(|| Error::out_of_memory(size))?;
        let scheduled = self.next_block_size.get();
        let block_size = scheduled.max(needed);
        let layout =
            Layout::from_size_align(block_size, BLOCK_ALIGN).map_err(|_| Error::out_of_memory(size))?;

        let node = self.node();
        let block = node.alloc.alloc(layout).ok_or_else(|| Error::out_of_memory(size))?;
        let header = block.as_ptr().cast::<BlockHeader>();
        // SAFETY: the block is at least HEADER_SIZE bytes and BLOCK_ALIGN aligned.
        unsafe {
            header.write(BlockHeader {
                next: node.blocks.load(Ordering::Relaxed),
                size: block_size,
            })
        };
        node.blocks.store(header, Ordering::Relaxed);
        node.space_allocated.fetch_add(block_size, Ordering::Relaxed);
        trace!("Allocated arena block of {} bytes", block_size);

        let grown = scheduled
            .saturating_mul(self.config.growth_factor)
            .min(self.config.max_block_size)
            .max(scheduled.min(self.config.max_block_size));
        self.next_block_size.set(grown);

        self.cursor.set(block.as_ptr().wrapping_add(HEADER_SIZE));
        self.end.set(block.as_ptr().wrapping_add(block_size));
        self.bump(size, align).ok_or_else(|| Error::out_of_memory(size))
    }

    /// Makes `self` and `other` share one lifetime.
    ///
    /// Afterwards memory from either arena stays valid until every handle in
    /// the combined group has been dropped. Fusing arenas that already share
    /// a group is a no-op. Refused for arenas created with an initial block
    /// or whose allocator disallows fusing.
    pub fn fuse(&self, other: &Arena) -> Result<()> {
        if self.node == other.node {
            return Ok(());
        }
        if !self.node().fusable || !other.node().fusable {
            return Err(Error::FuseRefused {
                reason: "arena owns an initial block or a non-fusable allocator",
            });
        }
        // SAFETY: both handles are alive for the duration of the call.
        unsafe { fuse::fuse(self.node, other.node) };
        debug!("Fused arenas; group now holds {} handles", self.ref_count());
        Ok(())
    }

    /// Returns true if `self` and `other` belong to the same group.
    pub fn is_fused(&self, other: &Arena) -> bool {
        // SAFETY: both handles are alive.
        unsafe { fuse::is_fused(self.node, other.node) }
    }

    pub(crate) fn is_fused_with_node(&self, node: NonNull<ArenaNode>) -> bool {
        // SAFETY: callers pass nodes recorded in live messages, whose group
        // is kept alive by a borrowed handle.
        unsafe { fuse::is_fused(self.node, node) }
    }

    /// Number of live handles in this arena's group.
    pub fn ref_count(&self) -> usize {
        // SAFETY: self is alive.
        unsafe { fuse::ref_count(self.node) }
    }

    /// Total bytes of blocks held by this arena's whole group.
    pub fn space_allocated(&self) -> usize {
        let mut total = 0;
        // SAFETY: self is alive.
        unsafe {
            fuse::for_each_member(self.node, |n| {
                total += n.space_allocated.load(Ordering::Relaxed)
            })
        };
        total
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // SAFETY: each handle releases its node exactly once.
        unsafe { fuse::release(self.node) }
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("space_allocated", &self.space_allocated())
            .field("ref_count", &self.ref_count())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter_cleanup(arena: &Arena, hits: &Arc<AtomicUsize>) {
        let hits = Arc::clone(hits);
        arena
            .register_cleanup(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }

    #[test]
    fn test_allocations_are_aligned_and_disjoint() {
        let arena = Arena::new();
        let mut seen = Vec::new();
        for align in [1usize, 2, 4, 8, 16, 32] {
            let p = arena.allocate(24, align).unwrap();
            assert_eq!(p.as_ptr() as usize % align, 0);
            seen.push(p.as_ptr() as usize);
        }
        seen.sort_unstable();
        for pair in seen.windows(2) {
            assert!(pair[1] - pair[0] >= 24);
        }
    }

    #[test]
    fn test_block_growth_is_capped() {
        let config = ArenaConfig::new().initial_block_size(256).max_block_size(1024);
        let arena = Arena::with_config(config);
        for _ in 0..64 {
            arena.allocate(100, 8).unwrap();
        }
        assert_eq!(arena.next_block_size.get(), 1024);
        // 6400 bytes of payload fit in 256 + 512 + 1024 * n
        assert!(arena.space_allocated() < 6400 + 3 * 1024);
    }

    #[test]
    fn test_large_allocation_gets_own_block() {
        let arena = Arena::new();
        let p = arena.allocate(100_000, 8).unwrap();
        // SAFETY: p is a fresh region of 100_000 bytes.
        unsafe { ptr::write_bytes(p.as_ptr(), 0xAB, 100_000) };
        assert!(arena.space_allocated() >= 100_000);
    }

    #[test]
    fn test_alloc_bytes_copies() {
        let arena = Arena::new();
        let copy = arena.alloc_bytes(b"hello").unwrap();
        assert_eq!(copy, b"hello");
        assert!(arena.alloc_bytes(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_realloc_in_place_when_last() {
        let arena = Arena::new();
        let p = arena.allocate(8, 8).unwrap();
        // SAFETY: every pointer is a live allocation of this arena with the sizes passed.
        unsafe {
            p.as_ptr().write(7);
            let q = arena.realloc(p, 8, 16, 8).unwrap();
            assert_eq!(p, q);
            let other = arena.allocate(8, 8).unwrap();
            let r = arena.realloc(p, 16, 64, 8).unwrap();
            assert_ne!(r, p);
            assert_ne!(r, other);
            assert_eq!(*r.as_ptr(), 7);
        }
    }

    #[test]
    fn test_out_of_memory() {
        let alloc = Arc::new(LimitedAlloc::new(512));
        let arena = Arena::with_allocator(alloc.clone(), ArenaConfig::default());
        assert!(arena.allocate(64, 8).is_ok());
        let err = arena.allocate(4096, 8).unwrap_err();
        assert!(matches!(err, Error::OutOfMemory { requested: 4096 }));
        drop(arena);
        assert_eq!(alloc.used(), 0);
    }

    #[test]
    fn test_initial_block_is_not_fusable() {
        let block: &'static mut [u8] = Box::leak(vec![0u8; 512].into_boxed_slice());
        let start = block.as_ptr() as usize;
        let a = Arena::with_initial_block(block, ArenaConfig::default());
        let p = a.allocate(16, 8).unwrap();
        assert!((p.as_ptr() as usize) >= start && (p.as_ptr() as usize) < start + 512);
        assert_eq!(a.space_allocated(), 0);

        let b = Arena::new();
        assert!(matches!(a.fuse(&b), Err(Error::FuseRefused { .. })));
        assert!(!a.is_fused(&b));
    }

    #[test]
    fn test_fuse_refused_by_allocator() {
        let a = Arena::with_allocator(
            Arc::new(LimitedAlloc::new(4096).fusable(false)),
            ArenaConfig::default(),
        );
        let b = Arena::new();
        assert!(b.fuse(&a).is_err());
    }

    #[test]
    fn test_fuse_runs_all_cleanups_once_either_order() {
        for drop_a_first in [true, false] {
            let hits = Arc::new(AtomicUsize::new(0));
            let a = Arena::new();
            let b = Arena::new();
            counter_cleanup(&a, &hits);
            counter_cleanup(&b, &hits);
            counter_cleanup(&b, &hits);

            a.fuse(&b).unwrap();
            assert!(a.is_fused(&b));
            assert_eq!(a.ref_count(), 2);

            if drop_a_first {
                drop(a);
                assert_eq!(hits.load(Ordering::SeqCst), 0);
                drop(b);
            } else {
                drop(b);
                assert_eq!(hits.load(Ordering::SeqCst), 0);
                drop(a);
            }
            assert_eq!(hits.load(Ordering::SeqCst), 3);
        }
    }

    #[test]
    fn test_fuse_is_idempotent_and_transitive() {
        let a = Arena::new();
        let b = Arena::new();
        let c = Arena::new();
        a.fuse(&b).unwrap();
        a.fuse(&b).unwrap();
        b.fuse(&c).unwrap();
        assert!(a.is_fused(&c));
        assert_eq!(c.ref_count(), 3);
        a.allocate(1000, 8).unwrap();
        c.allocate(1000, 8).unwrap();
        assert!(b.space_allocated() >= 2000);
    }

    #[test]
    fn test_fuse_across_threads() {
        let hits = Arc::new(AtomicUsize::new(0));
        let root = Arena::new();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let hits = Arc::clone(&hits);
                let arena = Arena::new();
                counter_cleanup(&arena, &hits);
                std::thread::spawn(move || {
                    arena.allocate(64, 8).unwrap();
                    arena
                })
            })
            .collect();
        let arenas: Vec<Arena> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for arena in &arenas {
            root.fuse(arena).unwrap();
        }
        assert_eq!(root.ref_count(), 5);
        let threads: Vec<_> = arenas
            .into_iter()
            .map(|arena| std::thread::spawn(move || drop(arena)))
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        drop(root);
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }
}
