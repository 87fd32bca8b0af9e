//! Shared lifetime bookkeeping for arenas.
//!
//! Every arena handle owns one heap-allocated [`ArenaNode`]. Fused nodes
//! form a union-find forest: `parent_or_count` either points at a parent
//! node or, on a root, holds the number of live handles in the group. The
//! root also heads a singly linked list of every member so the last
//! release can free the whole group.
//!
//! Tagging: a word with the low bit set is a refcount (`count << 1 | 1`),
//! otherwise it is a node address (nodes are at least 8-byte aligned).

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::trace;

use super::alloc::BlockAlloc;
use super::cleanup::{self, CleanupChunk};

/// Header written at the start of every block the arena allocates.
#[repr(C)]
pub(crate) struct BlockHeader {
    pub(crate) next: *mut BlockHeader,
    pub(crate) size: usize,
}

pub(crate) struct ArenaNode {
    parent_or_count: AtomicUsize,
    next: AtomicPtr<ArenaNode>,
    tail: AtomicPtr<ArenaNode>,
    /// Owned blocks, newest first. Only the owning handle pushes.
    pub(crate) blocks: AtomicPtr<BlockHeader>,
    /// Cleanup chunks, newest first. Only the owning handle pushes.
    pub(crate) cleanups: AtomicPtr<CleanupChunk>,
    pub(crate) space_allocated: AtomicUsize,
    pub(crate) alloc: Arc<dyn BlockAlloc>,
    pub(crate) fusable: bool,
}

#[inline]
fn is_count(poc: usize) -> bool {
    poc & 1 == 1
}

#[inline]
fn tagged_count(count: usize) -> usize {
    (count << 1) | 1
}

#[inline]
fn count_of(poc: usize) -> usize {
    poc >> 1
}

#[inline]
fn tagged_ptr(node: *mut ArenaNode) -> usize {
    node as usize
}

#[inline]
fn ptr_of(poc: usize) -> *mut ArenaNode {
    poc as *mut ArenaNode
}

impl ArenaNode {
    /// Allocates a fresh root node with a refcount of one.
    pub(crate) fn create(alloc: Arc<dyn BlockAlloc>, fusable: bool) -> NonNull<ArenaNode> {
        let node = Box::new(ArenaNode {
            parent_or_count: AtomicUsize::new(tagged_count(1)),
            next: AtomicPtr::new(ptr::null_mut()),
            tail: AtomicPtr::new(ptr::null_mut()),
            blocks: AtomicPtr::new(ptr::null_mut()),
            cleanups: AtomicPtr::new(ptr::null_mut()),
            space_allocated: AtomicUsize::new(0),
            alloc,
            fusable,
        });
        let raw = Box::into_raw(node);
        // SAFETY: raw was just produced by Box::into_raw.
        unsafe { (*raw).tail.store(raw, Ordering::Relaxed) };
        // SAFETY: Box never yields null.
        unsafe { NonNull::new_unchecked(raw) }
    }
}

/// Root of `node`'s group and the tagged refcount observed on it.
///
/// Halves the path on the way up.
///
/// # Safety
///
/// `node` must belong to a group with at least one live handle.
unsafe fn find_root(node: *mut ArenaNode) -> (*mut ArenaNode, usize) {
    let mut node = node;
    // SAFETY: live group members are never freed.
    let mut poc = unsafe { (*node).parent_or_count.load(Ordering::Acquire) };
    while !is_count(poc) {
        let parent = ptr_of(poc);
        // SAFETY: as above.
        let parent_poc = unsafe { (*parent).parent_or_count.load(Ordering::Acquire) };
        if !is_count(parent_poc) {
            // SAFETY: as above; parent links only ever move closer to the root.
            unsafe { (*node).parent_or_count.store(parent_poc, Ordering::Release) };
        }
        node = parent;
        poc = parent_poc;
    }
    (node, poc)
}

/// Appends the member list headed by `child` to the list headed by `parent`.
///
/// # Safety
///
/// Both nodes must be live; `child` must just have been linked under `parent`.
unsafe fn append_list(parent: *mut ArenaNode, child: *mut ArenaNode) {
    let mut child = child;
    // SAFETY: every node on both lists stays alive while the group has handles.
    unsafe {
        let mut tail = (*parent).tail.load(Ordering::Relaxed);
        loop {
            // A stale tail still converges on the real one.
            let mut next = (*tail).next.load(Ordering::Relaxed);
            while !next.is_null() {
                tail = next;
                next = (*tail).next.load(Ordering::Relaxed);
            }
            let displaced = (*tail).next.swap(child, Ordering::Relaxed);
            tail = (*child).tail.load(Ordering::Relaxed);
            if displaced.is_null() {
                break;
            }
            // Something was appended concurrently; hang it off the new tail.
            child = displaced;
        }
        (*parent).tail.store(tail, Ordering::Relaxed);
    }
}

/// One fuse attempt. Returns the new root on success.
unsafe fn try_fuse(
    a: *mut ArenaNode,
    b: *mut ArenaNode,
    ref_delta: &mut usize,
) -> Option<*mut ArenaNode> {
    // SAFETY: callers hold handles on both groups.
    let (mut r1, mut c1) = unsafe { find_root(a) };
    let (mut r2, mut c2) = unsafe { find_root(b) };
    if r1 == r2 {
        return Some(r1);
    }
    // The lower address becomes the root, which rules out cycles.
    if (r1 as usize) > (r2 as usize) {
        std::mem::swap(&mut r1, &mut r2);
        std::mem::swap(&mut c1, &mut c2);
    }

    // Move r2's refs onto r1 first so r1 survives releases racing through r2.
    let r2_refs = c2 & !1;
    // SAFETY: r1 and r2 are live roots.
    unsafe {
        if (*r1)
            .parent_or_count
            .compare_exchange(c1, c1 + r2_refs, Ordering::Release, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        if (*r2)
            .parent_or_count
            .compare_exchange(c2, tagged_ptr(r1), Ordering::Release, Ordering::Acquire)
            .is_err()
        {
            // The refs parked on r1 are removed once a later attempt succeeds.
            *ref_delta += r2_refs;
            return None;
        }
        append_list(r1, r2);
    }
    Some(r1)
}

/// Removes refs parked on the root by failed attempts.
unsafe fn fixup_refs(root: *mut ArenaNode, ref_delta: usize) -> bool {
    if ref_delta == 0 {
        return true;
    }
    // SAFETY: root is live.
    let poc = unsafe { (*root).parent_or_count.load(Ordering::Relaxed) };
    if !is_count(poc) {
        return false;
    }
    // SAFETY: as above.
    unsafe {
        (*root)
            .parent_or_count
            .compare_exchange(poc, poc - ref_delta, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
}

/// Joins the groups of `a` and `b`.
///
/// # Safety
///
/// Both nodes must be owned by live handles.
pub(crate) unsafe fn fuse(a: NonNull<ArenaNode>, b: NonNull<ArenaNode>) {
    let mut ref_delta = 0;
    loop {
        // SAFETY: forwarded caller contract.
        if let Some(root) = unsafe { try_fuse(a.as_ptr(), b.as_ptr(), &mut ref_delta) } {
            // SAFETY: root is live.
            if unsafe { fixup_refs(root, ref_delta) } {
                return;
            }
        }
    }
}

/// Whether `a` and `b` share a root.
///
/// # Safety
///
/// Both nodes must be owned by live handles.
pub(crate) unsafe fn is_fused(a: NonNull<ArenaNode>, b: NonNull<ArenaNode>) -> bool {
    if a == b {
        return true;
    }
    // SAFETY: forwarded caller contract.
    unsafe {
        let (mut ra, _) = find_root(a.as_ptr());
        let mut rb = b.as_ptr();
        loop {
            rb = find_root(rb).0;
            if ra == rb {
                return true;
            }
            let (again, _) = find_root(ra);
            if again == ra {
                return false;
            }
            ra = again;
        }
    }
}

/// Live handles in `node`'s group.
///
/// # Safety
///
/// `node` must be owned by a live handle.
pub(crate) unsafe fn ref_count(node: NonNull<ArenaNode>) -> usize {
    // SAFETY: forwarded caller contract.
    count_of(unsafe { find_root(node.as_ptr()) }.1)
}

/// Visits every member of `node`'s group, root first.
///
/// # Safety
///
/// `node` must be owned by a live handle.
pub(crate) unsafe fn for_each_member(node: NonNull<ArenaNode>, mut f: impl FnMut(&ArenaNode)) {
    // SAFETY: forwarded caller contract; members live as long as the group.
    unsafe {
        let (mut cur, _) = find_root(node.as_ptr());
        while !cur.is_null() {
            f(&*cur);
            cur = (*cur).next.load(Ordering::Acquire);
        }
    }
}

/// Drops one handle's reference; frees the group when it was the last.
///
/// # Safety
///
/// Must be called exactly once per handle, after which the handle's node
/// pointer must not be used.
pub(crate) unsafe fn release(node: NonNull<ArenaNode>) {
    let mut cur = node.as_ptr();
    loop {
        // SAFETY: the group is alive until this release completes.
        let mut poc = unsafe { (*cur).parent_or_count.load(Ordering::Acquire) };
        while !is_count(poc) {
            cur = ptr_of(poc);
            // SAFETY: as above.
            poc = unsafe { (*cur).parent_or_count.load(Ordering::Acquire) };
        }
        if poc == tagged_count(1) {
            // SAFETY: we held the last reference.
            unsafe { free_group(cur) };
            return;
        }
        // SAFETY: as above.
        let swapped = unsafe {
            (*cur).parent_or_count.compare_exchange(
                poc,
                tagged_count(count_of(poc) - 1),
                Ordering::Release,
                Ordering::Acquire,
            )
        };
        if swapped.is_ok() {
            return;
        }
    }
}

/// Runs every member's cleanups, then frees all blocks and nodes.
unsafe fn free_group(root: *mut ArenaNode) {
    let mut members = Vec::new();
    let mut cur = root;
    while !cur.is_null() {
        members.push(cur);
        // SAFETY: members are live until freed below.
        cur = unsafe { (*cur).next.load(Ordering::Acquire) };
    }

    // Later members' cleanups run first; within a member, last registered first.
    for &member in members.iter().rev() {
        // SAFETY: cleanup chunks live in the member's blocks, still allocated.
        unsafe { cleanup::run_all(&*member) };
    }

    for member in members {
        // SAFETY: no handle references the group any more.
        let node = unsafe { Box::from_raw(member) };
        let mut block = node.blocks.load(Ordering::Relaxed);
        while !block.is_null() {
            // SAFETY: blocks were allocated by `node.alloc` with this layout.
            unsafe {
                let next = (*block).next;
                let size = (*block).size;
                trace!("Freeing arena block of {} bytes", size);
                let layout = std::alloc::Layout::from_size_align_unchecked(size, super::BLOCK_ALIGN);
                node.alloc.dealloc(NonNull::new_unchecked(block.cast::<u8>()), layout);
                block = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::alloc::HostAlloc;

    fn node() -> NonNull<ArenaNode> {
        ArenaNode::create(Arc::new(HostAlloc), true)
    }

    #[test]
    fn test_tagging() {
        assert!(is_count(tagged_count(3)));
        assert_eq!(count_of(tagged_count(3)), 3);
        let n = node();
        assert!(!is_count(tagged_ptr(n.as_ptr())));
        // SAFETY: n holds the only reference.
        unsafe { release(n) };
    }

    #[test]
    fn test_fuse_lower_address_is_root() {
        let a = node();
        let b = node();
        // SAFETY: both nodes stay alive until their own release.
        unsafe {
            fuse(a, b);
            let (ra, count) = find_root(a.as_ptr());
            let (rb, _) = find_root(b.as_ptr());
            assert_eq!(ra, rb);
            assert_eq!(ra as usize, (a.as_ptr() as usize).min(b.as_ptr() as usize));
            assert_eq!(count_of(count), 2);

            let mut members = 0;
            for_each_member(a, |_| members += 1);
            assert_eq!(members, 2);

            release(a);
            assert_eq!(ref_count(b), 1);
            release(b);
        }
    }

    #[test]
    fn test_fuse_chain_lists_every_member() {
        let nodes: Vec<_> = (0..5).map(|_| node()).collect();
        // SAFETY: every node is released exactly once, after its last use.
        unsafe {
            for pair in nodes.windows(2) {
                fuse(pair[0], pair[1]);
            }
            // fusing again is a no-op
            fuse(nodes[4], nodes[0]);
            assert_eq!(ref_count(nodes[2]), 5);
            let mut members = 0;
            for_each_member(nodes[3], |_| members += 1);
            assert_eq!(members, 5);
            assert!(is_fused(nodes[0], nodes[4]));
            for n in nodes {
                release(n);
            }
        }
    }
}
