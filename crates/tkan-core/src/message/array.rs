//! Repeated field views.

use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;

use super::internal::{self, ArrayHeader};
use super::{prepare, read_elem, write_elem, Message, Value};
use crate::arena::{Arena, ArenaNode};
use crate::error::{Error, Result};
use crate::mini_table::{FieldRep, MessageType, MiniTableField, Schema};

/// The elements of one repeated field.
///
/// Handles are cheap copies; every copy sees the same storage.
#[derive(Clone, Copy)]
pub struct Array<'a> {
    hdr: NonNull<ArrayHeader>,
    field: &'a MiniTableField,
    schema: &'a Schema,
    owner: NonNull<ArenaNode>,
    _arena: PhantomData<&'a Arena>,
}

impl<'a> Array<'a> {
    /// # Safety
    ///
    /// `hdr` must be the live array of `field`, allocated in the arena
    /// group of `owner`, which outlives `'a`.
    pub(crate) unsafe fn from_raw(
        hdr: NonNull<ArrayHeader>,
        field: &'a MiniTableField,
        schema: &'a Schema,
        owner: NonNull<ArenaNode>,
    ) -> Self {
        Self {
            hdr,
            field,
            schema,
            owner,
            _arena: PhantomData,
        }
    }

    pub(crate) fn header(&self) -> NonNull<ArrayHeader> {
        self.hdr
    }

    /// The field the array belongs to
    pub fn field(&self) -> &'a MiniTableField {
        self.field
    }

    fn elem_rep(&self) -> FieldRep {
        self.field.field_type().rep()
    }

    fn sub(&self) -> Option<MessageType<'a>> {
        self.field
            .message_index()
            .map(|index| self.schema.message(index))
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        // SAFETY: the header is alive for 'a.
        unsafe { internal::array_len(self.hdr) }
    }

    /// True if the array has no elements
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element `i`, or `None` past the end.
    pub fn get(&self, i: usize) -> Option<Value<'a>> {
        if i >= self.len() {
            return None;
        }
        // SAFETY: i is in bounds and elements have the field's representation.
        unsafe {
            read_elem(
                internal::array_elem(self.hdr, self.elem_rep(), i),
                self.field.field_type(),
                self.sub(),
            )
        }
    }

    /// Iterates over the elements in order.
    pub fn iter(&self) -> ArrayIter<'a> {
        ArrayIter { array: *self, pos: 0 }
    }

    fn check_arena(&self, arena: &Arena) -> Result<()> {
        if arena.is_fused_with_node(self.owner) {
            Ok(())
        } else {
            Err(Error::ArenaMismatch)
        }
    }

    /// Appends `value`, copying byte payloads into `arena`.
    pub fn push(&self, value: Value<'_>, arena: &'a Arena) -> Result<()> {
        self.check_arena(arena)?;
        let stored = prepare(self.field, self.sub(), value, arena)?;
        // SAFETY: the new slot has the element representation.
        unsafe {
            let p = internal::array_push(self.hdr, self.elem_rep(), arena)?;
            write_elem(p, stored);
        }
        Ok(())
    }

    /// Replaces element `i`.
    ///
    /// # Panics
    ///
    /// Panics if `i` is out of bounds.
    pub fn set(&self, i: usize, value: Value<'_>, arena: &'a Arena) -> Result<()> {
        let len = self.len();
        assert!(i < len, "index {} out of bounds for array of length {}", i, len);
        self.check_arena(arena)?;
        let stored = prepare(self.field, self.sub(), value, arena)?;
        // SAFETY: i is in bounds.
        unsafe { write_elem(internal::array_elem(self.hdr, self.elem_rep(), i), stored) };
        Ok(())
    }

    /// Appends a new empty message and returns it.
    pub fn append_message(&self, arena: &'a Arena) -> Result<Message<'a>> {
        let sub = self.sub().ok_or_else(|| Error::TypeMismatch {
            expected: "repeated message field".to_string(),
            found: format!("{:?}", self.field.field_type()),
        })?;
        self.check_arena(arena)?;
        let msg = Message::new(sub, arena)?;
        // SAFETY: pointer slot of a message array.
        unsafe {
            let p = internal::array_push(self.hdr, self.elem_rep(), arena)?;
            write_elem(p, Value::Message(msg));
        }
        Ok(msg)
    }

    /// Shortens the array to `len` elements; no-op if already shorter.
    pub fn truncate(&self, len: usize) {
        // SAFETY: the header is alive and only shrinks here.
        unsafe {
            let h = &mut *self.hdr.as_ptr();
            h.len = h.len.min(len);
        }
    }

    /// Removes all elements, keeping the capacity.
    pub fn clear(&self) {
        self.truncate(0)
    }
}

impl fmt::Debug for Array<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<'a> IntoIterator for Array<'a> {
    type Item = Value<'a>;
    type IntoIter = ArrayIter<'a>;

    fn into_iter(self) -> ArrayIter<'a> {
        self.iter()
    }
}

/// Iterator over the elements of an [`Array`].
#[derive(Debug, Clone)]
pub struct ArrayIter<'a> {
    array: Array<'a>,
    pos: usize,
}

impl<'a> Iterator for ArrayIter<'a> {
    type Item = Value<'a>;

    fn next(&mut self) -> Option<Value<'a>> {
        // message arrays never hold null pointers
        let v = self.array.get(self.pos)?;
        self.pos += 1;
        Some(v)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.array.len().saturating_sub(self.pos);
        (n, Some(n))
    }
}

impl ExactSizeIterator for ArrayIter<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mini_table::{FieldSpec, FieldType, SchemaBuilder};

    #[test]
    fn test_push_get_iter() {
        let mut b = SchemaBuilder::new();
        let m = b.add_message("R");
        b.message_mut(m)
            .add_field(FieldSpec::repeated(1, "n", FieldType::SInt32))
            .add_field(FieldSpec::repeated(2, "s", FieldType::String))
            .add_field(FieldSpec::repeated(3, "kids", FieldType::Message).message(m));
        let schema = b.build().unwrap();
        let ty = schema.message(m);
        let arena = Arena::new();
        let msg = Message::new(ty, &arena).unwrap();

        let n = ty.field(1).unwrap();
        assert!(msg.array(n).is_none());
        let arr = msg.mutable_array(n, &arena).unwrap();
        for i in -3..3 {
            arr.push(Value::I32(i), &arena).unwrap();
        }
        assert_eq!(arr.len(), 6);
        assert!(msg.has(n));
        let got: Vec<i32> = msg.array(n).unwrap().iter().filter_map(|v| v.as_i32()).collect();
        assert_eq!(got, vec![-3, -2, -1, 0, 1, 2]);
        assert!(matches!(arr.push(Value::I64(1), &arena), Err(Error::TypeMismatch { .. })));

        arr.set(0, Value::I32(9), &arena).unwrap();
        assert_eq!(arr.get(0), Some(Value::I32(9)));
        arr.truncate(2);
        assert_eq!(arr.len(), 2);
        arr.clear();
        assert!(!msg.has(n));

        let s = msg.mutable_array(ty.field(2).unwrap(), &arena).unwrap();
        s.push(Value::Bytes(b"one"), &arena).unwrap();
        assert_eq!(s.get(0).and_then(|v| v.as_str()), Some("one"));

        let kids = msg.mutable_array(ty.field(3).unwrap(), &arena).unwrap();
        let kid = kids.append_message(&arena).unwrap();
        kid.mutable_array(n, &arena).unwrap().push(Value::I32(7), &arena).unwrap();
        assert_eq!(kids.get(0).and_then(|v| v.as_message()), Some(kid));
    }

    #[test]
    fn test_foreign_arena_rejected() {
        let mut b = SchemaBuilder::new();
        let m = b.add_message("R");
        b.message_mut(m).add_field(FieldSpec::repeated(1, "b", FieldType::Bytes));
        let schema = b.build().unwrap();
        let ty = schema.message(m);
        let arena = Arena::new();
        let other = Arena::new();
        let msg = Message::new(ty, &arena).unwrap();
        let arr = msg.mutable_array(ty.field(1).unwrap(), &arena).unwrap();
        assert!(matches!(
            arr.push(Value::Bytes(b"x"), &other),
            Err(Error::ArenaMismatch)
        ));
    }
}
