//! Cleanup callbacks registered on an arena.
//!
//! Callbacks are kept in fixed-size chunks that are themselves allocated
//! from the arena, so registering one costs a pointer bump at most.

use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::Ordering;

use tracing::trace;

use super::fuse::ArenaNode;
use super::Arena;
use crate::error::Result;

const CHUNK_ENTRIES: usize = 16;

#[derive(Clone, Copy)]
pub(crate) struct CleanupEntry {
    data: NonNull<u8>,
    run: unsafe fn(NonNull<u8>),
}

pub(crate) struct CleanupChunk {
    prev: *mut CleanupChunk,
    len: usize,
    entries: [Option<CleanupEntry>; CHUNK_ENTRIES],
}

/// Moves the stored closure out and calls it.
///
/// # Safety
///
/// `data` must point to an initialized `F` that is never read again.
unsafe fn call_boxed<F: FnOnce()>(data: NonNull<u8>) {
    // SAFETY: forwarded caller contract.
    let f = unsafe { ptr::read(data.cast::<F>().as_ptr()) };
    f();
}

impl Arena {
    /// Registers `f` to run when the arena (or its fused group) is destroyed.
    ///
    /// Callbacks run exactly once, newest first. The closure itself is stored
    /// in arena memory.
    pub fn register_cleanup<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let slot = self
            .allocate(mem::size_of::<F>().max(1), mem::align_of::<F>())?
            .cast::<F>();
        // SAFETY: slot is fresh, sized and aligned for F.
        unsafe { slot.as_ptr().write(f) };

        let entry = CleanupEntry {
            data: slot.cast(),
            run: call_boxed::<F>,
        };
        if let Err(e) = self.push_cleanup(entry) {
            // SAFETY: the closure was written above and is not registered.
            unsafe { drop(ptr::read(slot.as_ptr())) };
            return Err(e);
        }
        Ok(())
    }

    fn push_cleanup(&self, entry: CleanupEntry) -> Result<()> {
        let node = self.node();
        let mut head = node.cleanups.load(Ordering::Relaxed);
        // SAFETY: chunks are live arena allocations owned by this handle.
        if head.is_null() || unsafe { (*head).len } == CHUNK_ENTRIES {
            let chunk = self
                .allocate(mem::size_of::<CleanupChunk>(), mem::align_of::<CleanupChunk>())?
                .cast::<CleanupChunk>();
            // SAFETY: fresh allocation of the right size and alignment.
            unsafe {
                chunk.as_ptr().write(CleanupChunk {
                    prev: head,
                    len: 0,
                    entries: [None; CHUNK_ENTRIES],
                })
            };
            head = chunk.as_ptr();
            node.cleanups.store(head, Ordering::Relaxed);
        }
        // SAFETY: head is a live chunk with room for one more entry.
        unsafe {
            let chunk = &mut *head;
            chunk.entries[chunk.len] = Some(entry);
            chunk.len += 1;
        }
        Ok(())
    }
}

/// Runs and forgets every callback registered on `node`, newest first.
///
/// # Safety
///
/// The node's blocks must still be allocated and no handle may be using it.
pub(crate) unsafe fn run_all(node: &ArenaNode) {
    let mut chunk = node.cleanups.swap(ptr::null_mut(), Ordering::Acquire);
    let mut ran = 0usize;
    while !chunk.is_null() {
        // SAFETY: forwarded caller contract.
        let c = unsafe { &mut *chunk };
        for slot in c.entries[..c.len].iter_mut().rev() {
            if let Some(entry) = slot.take() {
                // SAFETY: each entry is consumed once.
                unsafe { (entry.run)(entry.data) };
                ran += 1;
            }
        }
        c.len = 0;
        chunk = c.prev;
    }
    if ran > 0 {
        trace!("Ran {} arena cleanup callbacks", ran);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Mutex};

    use crate::arena::Arena;

    #[test]
    fn test_cleanups_run_newest_first() {
        let order = Arc::new(Mutex::new(Vec::new()));
        {
            let arena = Arena::new();
            for i in 0..40 {
                let order = Arc::clone(&order);
                arena
                    .register_cleanup(move || order.lock().unwrap().push(i))
                    .unwrap();
            }
        }
        let order = order.lock().unwrap();
        let expected: Vec<i32> = (0..40).rev().collect();
        assert_eq!(*order, expected);
    }

    #[test]
    fn test_cleanup_drops_captured_state_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let payload = Arc::new(vec![1u8, 2, 3]);
        {
            let arena = Arena::new();
            let hits = Arc::clone(&hits);
            let payload = Arc::clone(&payload);
            arena
                .register_cleanup(move || {
                    assert_eq!(payload.len(), 3);
                    hits.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                })
                .unwrap();
        }
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(Arc::strong_count(&payload), 1);
    }
}
