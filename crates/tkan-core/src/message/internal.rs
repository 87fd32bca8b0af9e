//! Raw storage of message objects.
//!
//! A message object is `table.size` bytes allocated in an arena:
//!
//! ```text
//! +--------------------+--------------------+-----------+------------------+
//! | *mut Internal      | *const ArenaNode   | hasbits   | field slots ...  |
//! +--------------------+--------------------+-----------+------------------+
//! 0                    8                    16
//! ```
//!
//! `Internal` is allocated lazily and holds the unknown-field bytes and
//! the extension slots. Everything here is `unsafe`: callers guarantee
//! that `base` points at a live object laid out by the table the field
//! records come from.

use std::mem;
use std::ptr::{self, NonNull};

use crate::arena::{Arena, ArenaNode};
use crate::error::Result;
use crate::mini_table::{ExtensionIndex, FieldRep, MiniTable, MiniTableField, Presence};

/// Bytes preceding the presence bits of every message object.
pub(crate) const HEADER_SIZE: usize = 2 * mem::size_of::<usize>();

/// A string or bytes value: never mutated after it is written.
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct StringView {
    pub(crate) ptr: *const u8,
    pub(crate) len: usize,
}

impl StringView {
    pub(crate) const EMPTY: StringView = StringView {
        ptr: ptr::null(),
        len: 0,
    };

    /// # Safety
    ///
    /// The viewed bytes must outlive `'a`.
    pub(crate) unsafe fn as_slice<'a>(self) -> &'a [u8] {
        if self.len == 0 {
            &[]
        } else {
            // SAFETY: forwarded caller contract.
            unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
        }
    }
}

/// Backing store of a repeated field.
#[repr(C)]
pub(crate) struct ArrayHeader {
    pub(crate) data: *mut u8,
    pub(crate) len: usize,
    pub(crate) cap: usize,
}

/// One extension value.
#[repr(C)]
pub(crate) struct ExtensionSlot {
    pub(crate) index: ExtensionIndex,
    pub(crate) data: [usize; 2],
}

#[repr(C)]
pub(crate) struct Internal {
    unknown: *mut u8,
    unknown_len: usize,
    unknown_cap: usize,
    extensions: *mut ExtensionSlot,
    extension_len: usize,
    extension_cap: usize,
}

#[inline]
pub(crate) unsafe fn slot<T>(base: NonNull<u8>, offset: u32) -> *mut T {
    // SAFETY: offsets come from the layout of the object at `base`.
    unsafe { base.as_ptr().add(offset as usize).cast::<T>() }
}

/// Allocates a zeroed object for `table` in `arena`.
pub(crate) fn new_object(arena: &Arena, table: &MiniTable) -> Result<NonNull<u8>> {
    let base = arena.allocate_zeroed(table.size(), table.align())?;
    // SAFETY: the object is at least HEADER_SIZE bytes.
    unsafe { slot::<*const ArenaNode>(base, mem::size_of::<usize>() as u32).write(arena.node_ptr().as_ptr()) };
    Ok(base)
}

/// Arena node the object was allocated from.
pub(crate) unsafe fn owner(base: NonNull<u8>) -> NonNull<ArenaNode> {
    // SAFETY: written by `new_object`.
    unsafe { NonNull::new_unchecked(slot::<*mut ArenaNode>(base, mem::size_of::<usize>() as u32).read()) }
}

#[inline]
unsafe fn internal(base: NonNull<u8>) -> *mut Internal {
    // SAFETY: header word 0.
    unsafe { slot::<*mut Internal>(base, 0).read() }
}

unsafe fn internal_mut<'x>(base: NonNull<u8>, arena: &Arena) -> Result<&'x mut Internal> {
    // SAFETY: caller guarantees a live object.
    unsafe {
        let mut p = internal(base);
        if p.is_null() {
            p = arena
                .allocate_zeroed(mem::size_of::<Internal>(), mem::align_of::<Internal>())?
                .cast::<Internal>()
                .as_ptr();
            slot::<*mut Internal>(base, 0).write(p);
        }
        Ok(&mut *p)
    }
}

#[inline]
pub(crate) unsafe fn has_bit(base: NonNull<u8>, bit: u16) -> bool {
    // SAFETY: presence bytes follow the header.
    unsafe { *slot::<u8>(base, HEADER_SIZE as u32 + u32::from(bit / 8)) & (1 << (bit % 8)) != 0 }
}

#[inline]
pub(crate) unsafe fn set_bit(base: NonNull<u8>, bit: u16) {
    // SAFETY: as above.
    unsafe { *slot::<u8>(base, HEADER_SIZE as u32 + u32::from(bit / 8)) |= 1 << (bit % 8) }
}

#[inline]
pub(crate) unsafe fn clear_bit(base: NonNull<u8>, bit: u16) {
    // SAFETY: as above.
    unsafe { *slot::<u8>(base, HEADER_SIZE as u32 + u32::from(bit / 8)) &= !(1 << (bit % 8)) }
}

#[inline]
pub(crate) unsafe fn oneof_case(base: NonNull<u8>, case_offset: u32) -> u32 {
    // SAFETY: case fields are u32 slots.
    unsafe { slot::<u32>(base, case_offset).read() }
}

#[inline]
pub(crate) unsafe fn set_oneof_case(base: NonNull<u8>, case_offset: u32, number: u32) {
    // SAFETY: as above.
    unsafe { slot::<u32>(base, case_offset).write(number) }
}

/// Records that `field` now holds a value.
#[inline]
pub(crate) unsafe fn mark_present(base: NonNull<u8>, field: &MiniTableField) {
    // SAFETY: forwarded caller contract.
    unsafe {
        match field.presence {
            Presence::Hasbit(bit) => set_bit(base, bit),
            Presence::Oneof { case_offset, .. } => set_oneof_case(base, case_offset, field.number),
            Presence::Implicit => {}
        }
    }
}

/// True if the slot holds anything other than zero bits / an empty view.
#[inline]
pub(crate) unsafe fn slot_nonzero(p: *const u8, rep: FieldRep) -> bool {
    // SAFETY: p points at a slot of representation `rep`.
    unsafe {
        match rep {
            FieldRep::OneByte => p.read() != 0,
            FieldRep::FourByte => p.cast::<u32>().read() != 0,
            FieldRep::EightByte => p.cast::<u64>().read() != 0,
            FieldRep::StringView => p.cast::<StringView>().read().len != 0,
            FieldRep::Pointer => !p.cast::<*const u8>().read().is_null(),
        }
    }
}

/// Presence as seen by accessors and the encoder.
#[inline]
pub(crate) unsafe fn is_present(base: NonNull<u8>, field: &MiniTableField) -> bool {
    // SAFETY: forwarded caller contract.
    unsafe {
        match field.presence {
            Presence::Hasbit(bit) => has_bit(base, bit),
            Presence::Oneof { case_offset, .. } => oneof_case(base, case_offset) == field.number,
            Presence::Implicit => slot_nonzero(slot::<u8>(base, field.offset), field.rep()),
        }
    }
}

/// Unsets `field` and zeroes its slot.
pub(crate) unsafe fn clear_field(base: NonNull<u8>, field: &MiniTableField) {
    // SAFETY: forwarded caller contract.
    unsafe {
        match field.presence {
            Presence::Hasbit(bit) => clear_bit(base, bit),
            Presence::Oneof { case_offset, .. } => {
                if oneof_case(base, case_offset) != field.number {
                    return;
                }
                set_oneof_case(base, case_offset, 0);
            }
            Presence::Implicit => {}
        }
        ptr::write_bytes(slot::<u8>(base, field.offset), 0, field.rep().size());
    }
}

/// Zeroes every field and drops unknown data and extensions.
pub(crate) unsafe fn clear_object(base: NonNull<u8>, table: &MiniTable) {
    // SAFETY: the header's arena word is preserved.
    unsafe {
        slot::<*mut Internal>(base, 0).write(ptr::null_mut());
        ptr::write_bytes(slot::<u8>(base, HEADER_SIZE as u32), 0, table.size() - HEADER_SIZE);
    }
}

/// Unknown-field bytes of the object.
pub(crate) unsafe fn unknown<'a>(base: NonNull<u8>) -> &'a [u8] {
    // SAFETY: the buffer lives in the object's arena group.
    unsafe {
        let p = internal(base);
        if p.is_null() || (*p).unknown_len == 0 {
            return &[];
        }
        std::slice::from_raw_parts((*p).unknown, (*p).unknown_len)
    }
}

/// Appends raw tag+payload bytes to the unknown-field buffer.
pub(crate) unsafe fn append_unknown(base: NonNull<u8>, arena: &Arena, data: &[u8]) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    // SAFETY: forwarded caller contract; buffers come from this arena group.
    unsafe {
        let inner = internal_mut(base, arena)?;
        let needed = inner.unknown_len + data.len();
        if needed > inner.unknown_cap {
            let cap = needed.max(inner.unknown_cap * 2).max(64);
            let fresh = match NonNull::new(inner.unknown) {
                Some(old) => arena.realloc(old, inner.unknown_cap, cap, 1)?,
                None => arena.allocate(cap, 1)?,
            };
            inner.unknown = fresh.as_ptr();
            inner.unknown_cap = cap;
        }
        ptr::copy_nonoverlapping(data.as_ptr(), inner.unknown.add(inner.unknown_len), data.len());
        inner.unknown_len = needed;
    }
    Ok(())
}

/// Forgets the unknown-field bytes.
pub(crate) unsafe fn discard_unknown(base: NonNull<u8>) {
    // SAFETY: forwarded caller contract.
    unsafe {
        let p = internal(base);
        if !p.is_null() {
            (*p).unknown_len = 0;
        }
    }
}

/// Extension slots of the object, in insertion order.
pub(crate) unsafe fn extension_slots<'a>(base: NonNull<u8>) -> &'a [ExtensionSlot] {
    // SAFETY: slots live in the object's arena group.
    unsafe {
        let p = internal(base);
        if p.is_null() || (*p).extension_len == 0 {
            return &[];
        }
        std::slice::from_raw_parts((*p).extensions, (*p).extension_len)
    }
}

/// Value storage of extension `index`, if present.
pub(crate) unsafe fn find_extension(base: NonNull<u8>, index: ExtensionIndex) -> Option<NonNull<u8>> {
    // SAFETY: forwarded caller contract.
    unsafe {
        let p = internal(base);
        if p.is_null() {
            return None;
        }
        (0..(*p).extension_len)
            .map(|i| (*p).extensions.add(i))
            .find(|&s| (*s).index == index)
            .and_then(|s| NonNull::new(ptr::addr_of_mut!((*s).data).cast::<u8>()))
    }
}

/// Value storage of extension `index`, created zeroed if absent.
pub(crate) unsafe fn get_or_create_extension(
    base: NonNull<u8>,
    index: ExtensionIndex,
    arena: &Arena,
) -> Result<NonNull<u8>> {
    // SAFETY: forwarded caller contract.
    unsafe {
        if let Some(found) = find_extension(base, index) {
            return Ok(found);
        }
        let inner = internal_mut(base, arena)?;
        let size = mem::size_of::<ExtensionSlot>();
        let align = mem::align_of::<ExtensionSlot>();
        if inner.extension_len == inner.extension_cap {
            let cap = (inner.extension_cap * 2).max(4);
            let fresh = match NonNull::new(inner.extensions.cast::<u8>()) {
                Some(old) => arena.realloc(old, inner.extension_cap * size, cap * size, align)?,
                None => arena.allocate(cap * size, align)?,
            };
            inner.extensions = fresh.cast::<ExtensionSlot>().as_ptr();
            inner.extension_cap = cap;
        }
        let slot = inner.extensions.add(inner.extension_len);
        slot.write(ExtensionSlot { index, data: [0; 2] });
        inner.extension_len += 1;
        Ok(NonNull::new_unchecked(ptr::addr_of_mut!((*slot).data).cast::<u8>()))
    }
}

/// Allocates an empty array header.
pub(crate) fn new_array(arena: &Arena) -> Result<NonNull<ArrayHeader>> {
    Ok(arena
        .allocate_zeroed(mem::size_of::<ArrayHeader>(), mem::align_of::<ArrayHeader>())?
        .cast::<ArrayHeader>())
}

/// Array stored in a repeated field slot, created if absent.
pub(crate) unsafe fn array_slot(
    base: NonNull<u8>,
    field: &MiniTableField,
    arena: &Arena,
) -> Result<NonNull<ArrayHeader>> {
    // SAFETY: repeated slots hold a nullable ArrayHeader pointer.
    unsafe {
        let p = slot::<*mut ArrayHeader>(base, field.offset);
        if let Some(existing) = NonNull::new(p.read()) {
            return Ok(existing);
        }
        let fresh = new_array(arena)?;
        p.write(fresh.as_ptr());
        Ok(fresh)
    }
}

/// Ensures room for `additional` more elements.
pub(crate) unsafe fn array_reserve(
    hdr: NonNull<ArrayHeader>,
    rep: FieldRep,
    additional: usize,
    arena: &Arena,
) -> Result<()> {
    // SAFETY: forwarded caller contract.
    unsafe {
        let h = &mut *hdr.as_ptr();
        let needed = h.len.checked_add(additional).ok_or_else(|| crate::Error::out_of_memory(usize::MAX))?;
        if needed <= h.cap {
            return Ok(());
        }
        let elem = rep.size();
        let cap = needed.max(h.cap * 2).max(4);
        let bytes = cap.checked_mul(elem).ok_or_else(|| crate::Error::out_of_memory(usize::MAX))?;
        let fresh = match NonNull::new(h.data) {
            Some(old) => arena.realloc(old, h.cap * elem, bytes, rep.align())?,
            None => arena.allocate(bytes, rep.align())?,
        };
        h.data = fresh.as_ptr();
        h.cap = cap;
    }
    Ok(())
}

/// Appends one uninitialized element and returns its address.
pub(crate) unsafe fn array_push(
    hdr: NonNull<ArrayHeader>,
    rep: FieldRep,
    arena: &Arena,
) -> Result<*mut u8> {
    // SAFETY: forwarded caller contract.
    unsafe {
        array_reserve(hdr, rep, 1, arena)?;
        let h = &mut *hdr.as_ptr();
        let p = h.data.add(h.len * rep.size());
        h.len += 1;
        Ok(p)
    }
}

/// Address of element `i`.
#[inline]
pub(crate) unsafe fn array_elem(hdr: NonNull<ArrayHeader>, rep: FieldRep, i: usize) -> *mut u8 {
    // SAFETY: callers bound `i` by the header's len.
    unsafe { (*hdr.as_ptr()).data.add(i * rep.size()) }
}

#[inline]
pub(crate) unsafe fn array_len(hdr: NonNull<ArrayHeader>) -> usize {
    // SAFETY: live header.
    unsafe { (*hdr.as_ptr()).len }
}

/// Nullable array pointer stored in a repeated slot.
#[inline]
pub(crate) unsafe fn array_of(base: NonNull<u8>, field: &MiniTableField) -> Option<NonNull<ArrayHeader>> {
    // SAFETY: repeated slots hold a nullable ArrayHeader pointer.
    unsafe { NonNull::new(slot::<*mut ArrayHeader>(base, field.offset).read()) }
}
