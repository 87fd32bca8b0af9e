//! Message objects living in an arena.
//!
//! A [`Message`] is a copyable handle to a flat block of arena memory laid
//! out by its [`MiniTable`](crate::MiniTable). The handle carries the
//! message type, so every accessor knows the layout it is reading.
//! Accessors take field records obtained from the same type
//! ([`MessageType::field`]) and panic when handed a foreign record, the
//! same way slice indexing panics on a bad index.
//!
//! ```
//! use tkan_core::{Arena, FieldSpec, FieldType, Message, SchemaBuilder};
//!
//! let mut builder = SchemaBuilder::new();
//! let m = builder.add_message("demo.M");
//! builder.message_mut(m).add_field(FieldSpec::optional(1, "x", FieldType::Int32));
//! let schema = builder.build()?;
//! let ty = schema.message(m);
//!
//! let arena = Arena::new();
//! let msg = Message::new(ty, &arena)?;
//! let x = ty.field(1).unwrap();
//! assert!(!msg.has(x));
//! msg.set_i32(x, 150);
//! assert_eq!(msg.get_i32(x), 150);
//! # Ok::<(), tkan_core::Error>(())
//! ```

mod array;
pub(crate) mod internal;
mod map;
mod value;

use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::arena::Arena;
use crate::error::{Error, Result};
use crate::mini_table::{FieldMode, MessageType, MiniTable, MiniTableField, Presence};

pub use array::{Array, ArrayIter};
pub(crate) use internal::HEADER_SIZE;
pub use map::Map;
pub use value::Value;
pub(crate) use value::{default_of, prepare, read_elem, write_elem};

/// Default limit on submessage nesting for recursive operations.
pub const DEFAULT_MAX_DEPTH: u32 = 100;

/// Identity of a message object, stable for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(usize);

/// Handle to a message object allocated in an arena.
#[derive(Clone, Copy)]
pub struct Message<'a> {
    ptr: NonNull<u8>,
    ty: MessageType<'a>,
    _arena: PhantomData<&'a Arena>,
}

impl<'a> Message<'a> {
    /// Allocates an empty message of type `ty` in `arena`.
    pub fn new(ty: MessageType<'a>, arena: &'a Arena) -> Result<Self> {
        let ptr = internal::new_object(arena, ty.table())?;
        // SAFETY: freshly laid out for `ty` in `arena`.
        Ok(unsafe { Self::from_raw(ptr, ty) })
    }

    /// # Safety
    ///
    /// `ptr` must point at a live object laid out for `ty` whose arena
    /// group outlives `'a`.
    pub(crate) unsafe fn from_raw(ptr: NonNull<u8>, ty: MessageType<'a>) -> Self {
        Self {
            ptr,
            ty,
            _arena: PhantomData,
        }
    }

    pub(crate) fn as_non_null(&self) -> NonNull<u8> {
        self.ptr
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Type of the message
    pub fn message_type(&self) -> MessageType<'a> {
        self.ty
    }

    /// Layout table of the message
    pub fn table(&self) -> &'a MiniTable {
        self.ty.table()
    }

    /// Identity of the underlying object
    pub fn id(&self) -> MessageId {
        MessageId(self.ptr.as_ptr() as usize)
    }

    /// Resolves `field` to this message's own record.
    ///
    /// # Panics
    ///
    /// Panics if `field` is not a record of this message's table.
    pub(crate) fn own(&self, field: &MiniTableField) -> &'a MiniTableField {
        let fields = self.table().fields();
        let range = fields.as_ptr_range();
        let p = field as *const MiniTableField;
        assert!(
            range.contains(&p),
            "field {} is not a field of '{}'",
            field.number(),
            self.ty.name()
        );
        // SAFETY: p lies inside `fields`, so the offset is an element index.
        let idx = unsafe { p.offset_from(range.start) } as usize;
        &fields[idx]
    }

    /// Fails with [`Error::ArenaMismatch`] unless `arena` shares this
    /// message's lifetime.
    pub(crate) fn check_arena(&self, arena: &Arena) -> Result<()> {
        // SAFETY: the object is alive, so is the node recorded in it.
        if arena.is_fused_with_node(unsafe { internal::owner(self.ptr) }) {
            Ok(())
        } else {
            Err(Error::ArenaMismatch)
        }
    }

    /// Whether `field` holds a value.
    ///
    /// For implicit-presence fields that means "non-zero"; for repeated
    /// fields, "non-empty".
    pub fn has(&self, field: &MiniTableField) -> bool {
        let field = self.own(field);
        match field.mode() {
            // SAFETY: field belongs to this object's table.
            FieldMode::Scalar => unsafe { internal::is_present(self.ptr, field) },
            // SAFETY: repeated slots hold a nullable array pointer.
            FieldMode::Array | FieldMode::Map => unsafe {
                internal::array_of(self.ptr, field).map_or(false, |a| internal::array_len(a) > 0)
            },
        }
    }

    /// Unsets `field`; repeated fields become empty.
    pub fn clear_field(&self, field: &MiniTableField) {
        let field = self.own(field);
        // SAFETY: field belongs to this object's table.
        unsafe { internal::clear_field(self.ptr, field) }
    }

    /// Resets every field and forgets unknown data and extensions.
    pub fn clear(&self) {
        // SAFETY: the table describes this object.
        unsafe { internal::clear_object(self.ptr, self.table()) }
    }

    /// The set member of oneof `index`, if any.
    pub fn which_oneof(&self, index: usize) -> Option<&'a MiniTableField> {
        let oneof = self.table().oneofs().get(index)?;
        // SAFETY: case offsets come from this table.
        let number = unsafe { internal::oneof_case(self.ptr, oneof.case_offset()) };
        if number == 0 {
            None
        } else {
            self.ty.field(number)
        }
    }

    /// Value of a singular field, or its default when unset.
    ///
    /// Returns `None` for repeated fields and for unset message fields.
    pub fn get(&self, field: &MiniTableField) -> Option<Value<'a>> {
        let field = self.own(field);
        if field.is_repeated() {
            return None;
        }
        // SAFETY: field belongs to this object's table.
        unsafe {
            if field.presence() != Presence::Implicit && !internal::is_present(self.ptr, field) {
                if field.field_type().is_submessage() {
                    return None;
                }
                return Some(default_of(field));
            }
            read_elem(
                internal::slot::<u8>(self.ptr, field.offset()),
                field.field_type(),
                self.ty.submessage_of(field),
            )
        }
    }

    /// Stores `value` in a singular field and marks it present.
    ///
    /// Byte payloads are copied into `arena`, which must share this
    /// message's lifetime. Messages are attached, not copied: they must
    /// have the field's type and live in the same (or a fused) arena.
    pub fn set(&self, field: &MiniTableField, value: Value<'_>, arena: &'a Arena) -> Result<()> {
        let field = self.own(field);
        if field.is_repeated() {
            return Err(Error::TypeMismatch {
                expected: "repeated field accessor".to_string(),
                found: value.kind_name().to_string(),
            });
        }
        self.check_arena(arena)?;
        let stored = prepare(field, self.ty.submessage_of(field), value, arena)?;
        // SAFETY: field belongs to this object's table and the value matches its type.
        unsafe {
            write_elem(internal::slot::<u8>(self.ptr, field.offset()), stored);
            internal::mark_present(self.ptr, field);
        }
        Ok(())
    }

    fn set_plain(&self, field: &MiniTableField, value: Value<'_>) {
        let field = self.own(field);
        assert!(
            !field.is_repeated() && value.fits(field.field_type()),
            "field {} of '{}' cannot hold a {} value",
            field.number(),
            self.ty.name(),
            value.kind_name()
        );
        // SAFETY: as in `set`; plain scalars need no arena.
        unsafe {
            write_elem(internal::slot::<u8>(self.ptr, field.offset()), value);
            internal::mark_present(self.ptr, field);
        }
    }

    fn get_plain(&self, field: &MiniTableField, expected: &'static str) -> Value<'a> {
        match self.get(field) {
            Some(v) if v.kind_name() == expected => v,
            _ => panic!(
                "field {} of '{}' does not hold a {} value",
                field.number(),
                self.ty.name(),
                expected
            ),
        }
    }

    /// Reads a `bool` field.
    pub fn get_bool(&self, field: &MiniTableField) -> bool {
        self.get_plain(field, "bool").as_bool().unwrap_or_default()
    }

    /// Reads an `int32`, `sint32`, `sfixed32` or enum field.
    pub fn get_i32(&self, field: &MiniTableField) -> i32 {
        self.get_plain(field, "i32").as_i32().unwrap_or_default()
    }

    /// Reads a `uint32` or `fixed32` field.
    pub fn get_u32(&self, field: &MiniTableField) -> u32 {
        self.get_plain(field, "u32").as_u32().unwrap_or_default()
    }

    /// Reads an `int64`, `sint64` or `sfixed64` field.
    pub fn get_i64(&self, field: &MiniTableField) -> i64 {
        self.get_plain(field, "i64").as_i64().unwrap_or_default()
    }

    /// Reads a `uint64` or `fixed64` field.
    pub fn get_u64(&self, field: &MiniTableField) -> u64 {
        self.get_plain(field, "u64").as_u64().unwrap_or_default()
    }

    /// Reads a `float` field.
    pub fn get_f32(&self, field: &MiniTableField) -> f32 {
        self.get_plain(field, "f32").as_f32().unwrap_or_default()
    }

    /// Reads a `double` field.
    pub fn get_f64(&self, field: &MiniTableField) -> f64 {
        self.get_plain(field, "f64").as_f64().unwrap_or_default()
    }

    /// Reads a `string` or `bytes` field.
    pub fn get_bytes(&self, field: &MiniTableField) -> &'a [u8] {
        self.get_plain(field, "bytes").as_bytes().unwrap_or_default()
    }

    /// Reads a `string` field; `None` if the stored bytes are not UTF-8.
    pub fn get_str(&self, field: &MiniTableField) -> Option<&'a str> {
        std::str::from_utf8(self.get_bytes(field)).ok()
    }

    /// Writes a `bool` field.
    pub fn set_bool(&self, field: &MiniTableField, value: bool) {
        self.set_plain(field, Value::Bool(value))
    }

    /// Writes an `int32`, `sint32`, `sfixed32` or enum field.
    pub fn set_i32(&self, field: &MiniTableField, value: i32) {
        self.set_plain(field, Value::I32(value))
    }

    /// Writes a `uint32` or `fixed32` field.
    pub fn set_u32(&self, field: &MiniTableField, value: u32) {
        self.set_plain(field, Value::U32(value))
    }

    /// Writes an `int64`, `sint64` or `sfixed64` field.
    pub fn set_i64(&self, field: &MiniTableField, value: i64) {
        self.set_plain(field, Value::I64(value))
    }

    /// Writes a `uint64` or `fixed64` field.
    pub fn set_u64(&self, field: &MiniTableField, value: u64) {
        self.set_plain(field, Value::U64(value))
    }

    /// Writes a `float` field.
    pub fn set_f32(&self, field: &MiniTableField, value: f32) {
        self.set_plain(field, Value::F32(value))
    }

    /// Writes a `double` field.
    pub fn set_f64(&self, field: &MiniTableField, value: f64) {
        self.set_plain(field, Value::F64(value))
    }

    /// Copies `value` into `arena` and stores it in a `string` or `bytes` field.
    pub fn set_bytes(&self, field: &MiniTableField, value: &[u8], arena: &'a Arena) -> Result<()> {
        self.set(field, Value::Bytes(value), arena)
    }

    /// Copies `value` into `arena` and stores it in a `string` field.
    pub fn set_str(&self, field: &MiniTableField, value: &str, arena: &'a Arena) -> Result<()> {
        self.set(field, Value::Bytes(value.as_bytes()), arena)
    }

    /// The submessage in `field`, if set.
    pub fn get_message(&self, field: &MiniTableField) -> Option<Message<'a>> {
        self.get(field).and_then(|v| v.as_message())
    }

    /// The submessage in `field`, allocated in `arena` if unset.
    pub fn mutable_message(&self, field: &MiniTableField, arena: &'a Arena) -> Result<Message<'a>> {
        let field = self.own(field);
        let sub = self.ty.submessage_of(field).filter(|_| !field.is_repeated()).ok_or_else(|| {
            Error::TypeMismatch {
                expected: "singular message field".to_string(),
                found: format!("{:?}", field.field_type()),
            }
        })?;
        if let Some(existing) = self.get_message(field) {
            return Ok(existing);
        }
        self.check_arena(arena)?;
        let child = Message::new(sub, arena)?;
        // SAFETY: pointer slot of a message field of this table.
        unsafe {
            write_elem(internal::slot::<u8>(self.ptr, field.offset()), Value::Message(child));
            internal::mark_present(self.ptr, field);
        }
        Ok(child)
    }

    /// Attaches `child` to a message field.
    pub fn set_message(&self, field: &MiniTableField, child: Message<'_>, arena: &'a Arena) -> Result<()> {
        self.set(field, Value::Message(child), arena)
    }

    /// The array behind a repeated field, if it was ever created.
    pub fn array(&self, field: &MiniTableField) -> Option<Array<'a>> {
        let field = self.own(field);
        if field.mode() != FieldMode::Array {
            return None;
        }
        // SAFETY: repeated slot of this table.
        let hdr = unsafe { internal::array_of(self.ptr, field) }?;
        // SAFETY: the array lives in this message's arena group.
        Some(unsafe { Array::from_raw(hdr, field, self.ty.schema(), internal::owner(self.ptr)) })
    }

    /// The array behind a repeated field, created in `arena` if needed.
    pub fn mutable_array(&self, field: &MiniTableField, arena: &'a Arena) -> Result<Array<'a>> {
        let field = self.own(field);
        if field.mode() != FieldMode::Array {
            return Err(Error::TypeMismatch {
                expected: "repeated field".to_string(),
                found: format!("{:?}", field.mode()),
            });
        }
        self.check_arena(arena)?;
        // SAFETY: repeated slot of this table.
        unsafe {
            let hdr = internal::array_slot(self.ptr, field, arena)?;
            Ok(Array::from_raw(hdr, field, self.ty.schema(), internal::owner(self.ptr)))
        }
    }

    /// The map behind a map field, if it was ever created.
    pub fn map(&self, field: &MiniTableField) -> Option<Map<'a>> {
        let field = self.own(field);
        if field.mode() != FieldMode::Map {
            return None;
        }
        // SAFETY: map slot of this table.
        let hdr = unsafe { internal::array_of(self.ptr, field) }?;
        // SAFETY: the entries live in this message's arena group.
        let entries = unsafe { Array::from_raw(hdr, field, self.ty.schema(), internal::owner(self.ptr)) };
        Map::new(entries, self.ty.submessage_of(field)?)
    }

    /// The map behind a map field, created in `arena` if needed.
    pub fn mutable_map(&self, field: &MiniTableField, arena: &'a Arena) -> Result<Map<'a>> {
        let field = self.own(field);
        let entry = self.ty.submessage_of(field).filter(|_| field.mode() == FieldMode::Map).ok_or_else(|| {
            Error::TypeMismatch {
                expected: "map field".to_string(),
                found: format!("{:?}", field.mode()),
            }
        })?;
        self.check_arena(arena)?;
        // SAFETY: map slot of this table.
        let entries = unsafe {
            let hdr = internal::array_slot(self.ptr, field, arena)?;
            Array::from_raw(hdr, field, self.ty.schema(), internal::owner(self.ptr))
        };
        Map::new(entries, entry).ok_or_else(|| Error::schema("map field without an entry type"))
    }

    /// Raw bytes of fields that were not recognized during decode.
    pub fn unknown_fields(&self) -> &'a [u8] {
        // SAFETY: the buffer lives in this message's arena group.
        unsafe { internal::unknown(self.ptr) }
    }

    /// Appends raw tag+payload bytes to the unknown fields.
    pub fn add_unknown(&self, data: &[u8], arena: &'a Arena) -> Result<()> {
        self.check_arena(arena)?;
        // SAFETY: arena shares this object's lifetime.
        unsafe { internal::append_unknown(self.ptr, arena, data) }
    }

    /// Drops unknown fields from this message and every submessage below it.
    pub fn discard_unknown(&self, max_depth: u32) -> Result<()> {
        walk_submessages(*self, max_depth, &mut |m| {
            // SAFETY: m is a live object of the tree.
            unsafe { internal::discard_unknown(m.ptr) };
            true
        })
        .map(|_| ())
    }

    /// Whether every required field is set, here and in every submessage.
    ///
    /// Trees deeper than [`DEFAULT_MAX_DEPTH`] report `false`.
    pub fn is_initialized(&self) -> bool {
        walk_submessages(*self, DEFAULT_MAX_DEPTH, &mut |m| m.has_required()).unwrap_or(false)
    }

    /// Required fields of this message alone.
    pub(crate) fn has_required(&self) -> bool {
        let table = self.table();
        let count = u16::from(table.required_count());
        // SAFETY: the first `count` presence bits are the required ones.
        (0..count).all(|bit| unsafe { internal::has_bit(self.ptr, bit) })
    }

    /// Copies the whole tree into `arena` through the wire format.
    pub fn deep_clone<'b>(&self, arena: &'b Arena) -> Result<Message<'b>>
    where
        'a: 'b,
    {
        let bytes = crate::encode::encode_to_vec(*self, &crate::EncodeOptions::default())?;
        let copy = Message::new(self.ty, arena)?;
        crate::decode::decode(&bytes, copy, arena, &crate::DecodeOptions::default())?;
        Ok(copy)
    }
}

/// Visits `root` and every message below it (fields, arrays, maps and
/// extensions), stopping early when `visit` returns false.
fn walk_submessages<'a>(
    root: Message<'a>,
    max_depth: u32,
    visit: &mut dyn FnMut(Message<'a>) -> bool,
) -> Result<bool> {
    fn walk<'a>(
        msg: Message<'a>,
        depth: u32,
        limit: u32,
        visit: &mut dyn FnMut(Message<'a>) -> bool,
    ) -> Result<bool> {
        if depth > limit {
            return Err(Error::MaxDepthExceeded { limit });
        }
        if !visit(msg) {
            return Ok(false);
        }
        for field in msg.table().fields() {
            if !field.field_type().is_submessage() {
                continue;
            }
            let children: Vec<Message<'a>> = match field.mode() {
                FieldMode::Scalar => msg.get_message(field).into_iter().collect(),
                FieldMode::Array => msg
                    .array(field)
                    .map(|a| a.iter().filter_map(|v| v.as_message()).collect())
                    .unwrap_or_default(),
                FieldMode::Map => msg
                    .map(field)
                    .map(|m| m.entry_messages().collect())
                    .unwrap_or_default(),
            };
            for child in children {
                if !walk(child, depth + 1, limit, visit)? {
                    return Ok(false);
                }
            }
        }
        for child in msg.extension_messages() {
            if !walk(child, depth + 1, limit, visit)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
    walk(root, 0, max_depth, visit)
}

impl PartialEq for Message<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl fmt::Debug for Message<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("type", &self.ty.name())
            .field("addr", &self.ptr)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mini_table::{DefaultValue, FieldSpec, FieldType, Schema, SchemaBuilder};
    use bytes::Bytes;

    fn schema() -> (Schema, crate::MessageIndex) {
        let mut b = SchemaBuilder::new();
        let m = b.add_message("t.M");
        let spec = b.message_mut(m);
        let oneof = spec.add_oneof("kind");
        spec.add_field(FieldSpec::optional(1, "x", FieldType::Int32))
            .add_field(FieldSpec::optional(2, "s", FieldType::String))
            .add_field(FieldSpec::optional(3, "child", FieldType::Message).message(m))
            .add_field(FieldSpec::singular(4, "plain", FieldType::UInt64))
            .add_field(
                FieldSpec::optional(5, "named", FieldType::String)
                    .default_value(DefaultValue::Bytes(Bytes::from_static(b"anon"))),
            )
            .add_field(FieldSpec::optional(6, "num", FieldType::Int64).oneof(oneof))
            .add_field(FieldSpec::optional(7, "text", FieldType::String).oneof(oneof))
            .add_field(FieldSpec::required(8, "id", FieldType::Fixed32));
        (b.build().unwrap(), m)
    }

    #[test]
    fn test_scalar_presence_and_defaults() {
        let (schema, m) = schema();
        let ty = schema.message(m);
        let arena = Arena::new();
        let msg = Message::new(ty, &arena).unwrap();

        let x = ty.field(1).unwrap();
        let plain = ty.field(4).unwrap();
        let named = ty.field(5).unwrap();
        assert!(!msg.has(x));
        assert_eq!(msg.get_i32(x), 0);
        assert_eq!(msg.get_str(named), Some("anon"));

        msg.set_i32(x, 0);
        assert!(msg.has(x));
        msg.set_u64(plain, 0);
        assert!(!msg.has(plain));
        msg.set_u64(plain, 9);
        assert!(msg.has(plain));

        msg.clear_field(x);
        assert!(!msg.has(x));
    }

    #[test]
    fn test_strings_are_copied() {
        let (schema, m) = schema();
        let ty = schema.message(m);
        let arena = Arena::new();
        let msg = Message::new(ty, &arena).unwrap();
        let s = ty.field(2).unwrap();
        {
            let temp = String::from("hello");
            msg.set_str(s, &temp, &arena).unwrap();
        }
        assert_eq!(msg.get_str(s), Some("hello"));
        let err = msg.set_bytes(s, &[0xC0, 0x80], &arena).unwrap_err();
        assert!(matches!(err, Error::BadUtf8 { field: 2, .. }));
    }

    #[test]
    fn test_oneof_switches_members() {
        let (schema, m) = schema();
        let ty = schema.message(m);
        let arena = Arena::new();
        let msg = Message::new(ty, &arena).unwrap();
        let num = ty.field(6).unwrap();
        let text = ty.field(7).unwrap();

        assert!(msg.which_oneof(0).is_none());
        msg.set_i64(num, 42);
        assert_eq!(msg.which_oneof(0).unwrap().number(), 6);
        msg.set_str(text, "hi", &arena).unwrap();
        assert_eq!(msg.which_oneof(0).unwrap().number(), 7);
        assert!(!msg.has(num));
        assert_eq!(msg.get_i64(num), 0);
        assert_eq!(msg.get_str(text), Some("hi"));
    }

    #[test]
    fn test_submessages_and_arena_checks() {
        let (schema, m) = schema();
        let ty = schema.message(m);
        let arena = Arena::new();
        let msg = Message::new(ty, &arena).unwrap();
        let child_field = ty.field(3).unwrap();

        assert!(msg.get_message(child_field).is_none());
        let child = msg.mutable_message(child_field, &arena).unwrap();
        assert_eq!(msg.get_message(child_field), Some(child));
        assert_eq!(msg.mutable_message(child_field, &arena).unwrap(), child);

        let other = Arena::new();
        let stranger = Message::new(ty, &other).unwrap();
        assert!(matches!(
            msg.set_message(child_field, stranger, &arena),
            Err(Error::ArenaMismatch)
        ));
        arena.fuse(&other).unwrap();
        msg.set_message(child_field, stranger, &arena).unwrap();
        assert_eq!(msg.get_message(child_field), Some(stranger));
    }

    #[test]
    #[should_panic(expected = "is not a field of")]
    fn test_foreign_field_panics() {
        let (schema, m) = schema();
        let (other_schema, om) = self::schema();
        let arena = Arena::new();
        let msg = Message::new(schema.message(m), &arena).unwrap();
        msg.get_i32(other_schema.message(om).field(1).unwrap());
    }

    #[test]
    fn test_is_initialized_recurses() {
        let (schema, m) = schema();
        let ty = schema.message(m);
        let arena = Arena::new();
        let msg = Message::new(ty, &arena).unwrap();
        let id = ty.field(8).unwrap();
        assert!(!msg.is_initialized());
        msg.set_u32(id, 1);
        assert!(msg.is_initialized());
        let child = msg.mutable_message(ty.field(3).unwrap(), &arena).unwrap();
        assert!(!msg.is_initialized());
        child.set_u32(id, 2);
        assert!(msg.is_initialized());
    }

    #[test]
    fn test_clear_resets_everything() {
        let (schema, m) = schema();
        let ty = schema.message(m);
        let arena = Arena::new();
        let msg = Message::new(ty, &arena).unwrap();
        msg.set_i32(ty.field(1).unwrap(), 5);
        msg.add_unknown(&[0x10, 0x2A], &arena).unwrap();
        msg.clear();
        assert!(!msg.has(ty.field(1).unwrap()));
        assert!(msg.unknown_fields().is_empty());
        // the arena back-reference survives a clear
        msg.set_str(ty.field(2).unwrap(), "again", &arena).unwrap();
    }

    #[test]
    fn test_deep_clone_copies_the_tree() {
        let (schema, m) = schema();
        let ty = schema.message(m);
        let (x, s, child_field, id) = (
            ty.field(1).unwrap(),
            ty.field(2).unwrap(),
            ty.field(3).unwrap(),
            ty.field(8).unwrap(),
        );
        let arena = Arena::new();
        let msg = Message::new(ty, &arena).unwrap();
        msg.set_u32(id, 1);
        msg.set_str(s, "root", &arena).unwrap();
        msg.add_unknown(&[0x48, 0x2A], &arena).unwrap();
        let child = msg.mutable_message(child_field, &arena).unwrap();
        child.set_u32(id, 2);
        child.set_i32(x, 7);

        let other = Arena::new();
        let copy = msg.deep_clone(&other).unwrap();
        assert_ne!(copy, msg);
        assert_eq!(copy.get_str(s), Some("root"));
        assert_eq!(copy.unknown_fields(), &[0x48, 0x2A]);
        let copied_child = copy.get_message(child_field).unwrap();
        assert_ne!(copied_child, child);
        assert_eq!(copied_child.get_i32(x), 7);

        child.set_i32(x, 8);
        assert_eq!(copied_child.get_i32(x), 7);
        assert!(copy.is_initialized());
    }

    #[test]
    fn test_discard_unknown_recurses() {
        let (schema, m) = schema();
        let ty = schema.message(m);
        let child_field = ty.field(3).unwrap();
        let arena = Arena::new();
        let msg = Message::new(ty, &arena).unwrap();
        let child = msg.mutable_message(child_field, &arena).unwrap();
        let grandchild = child.mutable_message(child_field, &arena).unwrap();
        for node in [msg, child, grandchild] {
            node.add_unknown(&[0x48, 0x01], &arena).unwrap();
        }

        assert!(matches!(
            msg.discard_unknown(1),
            Err(Error::MaxDepthExceeded { limit: 1 })
        ));
        assert_eq!(grandchild.unknown_fields(), &[0x48, 0x01]);

        msg.discard_unknown(DEFAULT_MAX_DEPTH).unwrap();
        for node in [msg, child, grandchild] {
            assert!(node.unknown_fields().is_empty());
        }
        assert_eq!(msg.get_message(child_field), Some(child));
    }
}
