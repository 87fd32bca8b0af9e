//! Compact, read-only layout descriptions of message types.
//!
//! A [`MiniTable`] answers, for a field number, where the field lives in a
//! message object and how it travels on the wire. Tables are grouped in a
//! [`Schema`], which also owns the enum and extension definitions they
//! reference. Nested tables are referenced by index, so recursive message
//! types need no cycles of pointers.
//!
//! Schemas are produced by [`SchemaBuilder`] or loaded from compiled
//! descriptor sets via [`Schema::from_file_descriptor_set`].

mod builder;
mod reflect;

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::wire::WireType;

pub use builder::{Cardinality, FieldSpec, MessageSpec, SchemaBuilder};

/// Logical type of a field, numbered as in `descriptor.proto`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FieldType {
    /// `double`
    Double = 1,
    /// `float`
    Float = 2,
    /// `int64`
    Int64 = 3,
    /// `uint64`
    UInt64 = 4,
    /// `int32`
    Int32 = 5,
    /// `fixed64`
    Fixed64 = 6,
    /// `fixed32`
    Fixed32 = 7,
    /// `bool`
    Bool = 8,
    /// `string`
    String = 9,
    /// proto2 group
    Group = 10,
    /// Embedded message
    Message = 11,
    /// `bytes`
    Bytes = 12,
    /// `uint32`
    UInt32 = 13,
    /// Enum, stored as int32
    Enum = 14,
    /// `sfixed32`
    SFixed32 = 15,
    /// `sfixed64`
    SFixed64 = 16,
    /// `sint32`
    SInt32 = 17,
    /// `sint64`
    SInt64 = 18,
}

impl TryFrom<i32> for FieldType {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self> {
        use FieldType::*;
        Ok(match value {
            1 => Double,
            2 => Float,
            3 => Int64,
            4 => UInt64,
            5 => Int32,
            6 => Fixed64,
            7 => Fixed32,
            8 => Bool,
            9 => String,
            10 => Group,
            11 => Message,
            12 => Bytes,
            13 => UInt32,
            14 => Enum,
            15 => SFixed32,
            16 => SFixed64,
            17 => SInt32,
            18 => SInt64,
            other => return Err(Error::schema(format!("unknown field type {}", other))),
        })
    }
}

impl FieldType {
    /// Wire type of a single (unpacked) value of this type.
    pub fn wire_type(self) -> WireType {
        use FieldType::*;
        match self {
            Double | Fixed64 | SFixed64 => WireType::I64,
            Float | Fixed32 | SFixed32 => WireType::I32,
            Int64 | UInt64 | Int32 | Bool | UInt32 | Enum | SInt32 | SInt64 => WireType::Varint,
            String | Bytes | Message => WireType::Len,
            Group => WireType::StartGroup,
        }
    }

    /// Whether repeated fields of this type may use the packed encoding.
    pub fn is_packable(self) -> bool {
        !matches!(
            self,
            FieldType::String | FieldType::Bytes | FieldType::Message | FieldType::Group
        )
    }

    /// Message or group.
    pub fn is_submessage(self) -> bool {
        matches!(self, FieldType::Message | FieldType::Group)
    }

    /// Storage representation of one value of this type.
    pub fn rep(self) -> FieldRep {
        use FieldType::*;
        match self {
            Bool => FieldRep::OneByte,
            Float | Int32 | UInt32 | Fixed32 | SFixed32 | SInt32 | Enum => FieldRep::FourByte,
            Double | Int64 | UInt64 | Fixed64 | SFixed64 | SInt64 => FieldRep::EightByte,
            String | Bytes => FieldRep::StringView,
            Message | Group => FieldRep::Pointer,
        }
    }

    /// Fixed payload width on the wire, for I32/I64 types.
    pub(crate) fn fixed_width(self) -> Option<usize> {
        match self.wire_type() {
            WireType::I32 => Some(4),
            WireType::I64 => Some(8),
            _ => None,
        }
    }
}

/// How a value is stored inside a message object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRep {
    /// `bool`
    OneByte,
    /// 32-bit scalars
    FourByte,
    /// 64-bit scalars
    EightByte,
    /// Pointer plus length of a string or bytes payload
    StringView,
    /// Pointer to a message, array or map
    Pointer,
}

impl FieldRep {
    /// Size in bytes
    pub fn size(self) -> usize {
        match self {
            FieldRep::OneByte => 1,
            FieldRep::FourByte => 4,
            FieldRep::EightByte => 8,
            FieldRep::StringView => 2 * std::mem::size_of::<usize>(),
            FieldRep::Pointer => std::mem::size_of::<usize>(),
        }
    }

    /// Required alignment in bytes
    pub fn align(self) -> usize {
        match self {
            FieldRep::OneByte => 1,
            FieldRep::FourByte => 4,
            FieldRep::EightByte => 8,
            FieldRep::StringView | FieldRep::Pointer => std::mem::align_of::<usize>(),
        }
    }
}

/// Whether a field holds one value, a sequence or a map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldMode {
    /// One value
    Scalar,
    /// Repeated field
    Array,
    /// Map field, stored as repeated entry messages
    Map,
}

/// How the presence of a singular field is tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    /// No presence: the field is "set" when it differs from zero/empty
    Implicit,
    /// A bit in the message's presence bytes
    Hasbit(u16),
    /// Member of a oneof whose case field sits at `case_offset`
    Oneof {
        /// Byte offset of the `u32` case field
        case_offset: u32,
        /// Index of the oneof within its table
        index: u16,
    },
}

/// Index of a message table in its [`Schema`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageIndex(pub(crate) u32);

/// Index of an enum in its [`Schema`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EnumIndex(pub(crate) u32);

/// Index of an extension in its [`Schema`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExtensionIndex(pub(crate) u32);

macro_rules! index_accessor {
    ($($ty:ty),*) => {$(
        impl $ty {
            /// Position in the owning schema
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }
    )*};
}
index_accessor!(MessageIndex, EnumIndex, ExtensionIndex);

/// Nested table referenced by a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubRef {
    /// Scalar fields
    None,
    /// Message, group and map fields
    Message(MessageIndex),
    /// Enum fields
    Enum(EnumIndex),
}

/// Value reported by an unset field with explicit presence.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum DefaultValue {
    /// Zero, false or empty
    #[default]
    Zero,
    /// `bool` default
    Bool(bool),
    /// `int32`, `sint32`, `sfixed32` and enum defaults
    Int32(i32),
    /// `int64`, `sint64`, `sfixed64` defaults
    Int64(i64),
    /// `uint32`, `fixed32` defaults
    UInt32(u32),
    /// `uint64`, `fixed64` defaults
    UInt64(u64),
    /// `float` default
    Float(f32),
    /// `double` default
    Double(f64),
    /// `string` and `bytes` defaults
    Bytes(Bytes),
}

/// One field record.
#[derive(Debug, Clone, PartialEq)]
pub struct MiniTableField {
    pub(crate) number: u32,
    pub(crate) name: Box<str>,
    pub(crate) field_type: FieldType,
    pub(crate) mode: FieldMode,
    pub(crate) packed: bool,
    pub(crate) offset: u32,
    pub(crate) presence: Presence,
    pub(crate) sub: SubRef,
    pub(crate) default: DefaultValue,
    pub(crate) required: bool,
}

impl MiniTableField {
    /// Field number
    pub fn number(&self) -> u32 {
        self.number
    }

    /// Field name (may be empty for programmatic tables)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Logical type
    pub fn field_type(&self) -> FieldType {
        self.field_type
    }

    /// Scalar, repeated or map
    pub fn mode(&self) -> FieldMode {
        self.mode
    }

    /// Whether repeated values are written packed
    pub fn is_packed(&self) -> bool {
        self.packed
    }

    /// Byte offset of the storage slot inside the message object
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Presence tracking
    pub fn presence(&self) -> Presence {
        self.presence
    }

    /// Presence bit index, if the field has one
    pub fn hasbit(&self) -> Option<u16> {
        match self.presence {
            Presence::Hasbit(bit) => Some(bit),
            _ => None,
        }
    }

    /// Nested table reference
    pub fn sub(&self) -> SubRef {
        self.sub
    }

    /// Declared default
    pub fn default_value(&self) -> &DefaultValue {
        &self.default
    }

    /// `required` label
    pub fn is_required(&self) -> bool {
        self.required
    }

    /// Repeated or map
    pub fn is_repeated(&self) -> bool {
        self.mode != FieldMode::Scalar
    }

    /// Member of a oneof
    pub fn in_oneof(&self) -> bool {
        matches!(self.presence, Presence::Oneof { .. })
    }

    /// Storage representation of the slot at [`offset`](Self::offset).
    pub fn rep(&self) -> FieldRep {
        match self.mode {
            FieldMode::Scalar => self.field_type.rep(),
            FieldMode::Array | FieldMode::Map => FieldRep::Pointer,
        }
    }

    pub(crate) fn message_index(&self) -> Option<MessageIndex> {
        match self.sub {
            SubRef::Message(idx) => Some(idx),
            _ => None,
        }
    }

    pub(crate) fn enum_index(&self) -> Option<EnumIndex> {
        match self.sub {
            SubRef::Enum(idx) => Some(idx),
            _ => None,
        }
    }
}

/// Storage of one oneof.
#[derive(Debug, Clone, PartialEq)]
pub struct OneofTable {
    pub(crate) name: Box<str>,
    pub(crate) case_offset: u32,
    pub(crate) data_offset: u32,
    pub(crate) members: Vec<u32>,
}

impl OneofTable {
    /// Oneof name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Offset of the `u32` holding the number of the set member (0 = none)
    pub fn case_offset(&self) -> u32 {
        self.case_offset
    }

    /// Offset of the storage shared by all members
    pub fn data_offset(&self) -> u32 {
        self.data_offset
    }

    /// Field numbers of the members
    pub fn members(&self) -> &[u32] {
        &self.members
    }
}

/// Layout of one message type.
#[derive(Debug, Clone, PartialEq)]
pub struct MiniTable {
    pub(crate) name: Box<str>,
    pub(crate) size: u32,
    pub(crate) fields: Vec<MiniTableField>,
    pub(crate) dense_below: u32,
    pub(crate) required_count: u8,
    pub(crate) hasbit_bytes: u32,
    pub(crate) oneofs: Vec<OneofTable>,
    pub(crate) map_entry: bool,
    pub(crate) extendable: bool,
}

impl MiniTable {
    /// Full message name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total size of a message object, header included
    pub fn size(&self) -> usize {
        self.size as usize
    }

    /// Alignment of a message object
    pub fn align(&self) -> usize {
        std::mem::align_of::<usize>()
    }

    /// Field records in ascending field-number order
    pub fn fields(&self) -> &[MiniTableField] {
        &self.fields
    }

    /// Oneofs declared by the message
    pub fn oneofs(&self) -> &[OneofTable] {
        &self.oneofs
    }

    /// Number of leading fields whose numbers are exactly `1..=n`
    pub fn dense_below(&self) -> u32 {
        self.dense_below
    }

    /// Number of required fields
    pub fn required_count(&self) -> u8 {
        self.required_count
    }

    /// Bytes of presence bits following the header
    pub fn hasbit_bytes(&self) -> u32 {
        self.hasbit_bytes
    }

    /// Map entry table (`key = 1`, `value = 2`)
    pub fn is_map_entry(&self) -> bool {
        self.map_entry
    }

    /// Whether the message declares extension ranges
    pub fn is_extendable(&self) -> bool {
        self.extendable
    }

    /// Looks up a field record by number.
    ///
    /// Direct index for the dense prefix, binary search above it.
    #[inline]
    pub fn find_field_by_number(&self, number: u32) -> Option<&MiniTableField> {
        let idx = number.wrapping_sub(1);
        if idx < self.dense_below {
            return self.fields.get(idx as usize);
        }
        let sparse = &self.fields[self.dense_below as usize..];
        sparse
            .binary_search_by_key(&number, |f| f.number)
            .ok()
            .map(|i| &sparse[i])
    }

    /// Looks up a field record by name.
    pub fn find_field_by_name(&self, name: &str) -> Option<&MiniTableField> {
        self.fields.iter().find(|f| &*f.name == name)
    }

    /// Presence bits of the required fields, which occupy the lowest
    /// positions.
    pub fn required_mask(&self) -> u64 {
        match self.required_count {
            0 => 0,
            n => u64::MAX >> (64 - u32::from(n)),
        }
    }

    /// Map key field, for map entry tables
    pub fn map_key(&self) -> Option<&MiniTableField> {
        self.map_entry.then(|| &self.fields[0])
    }

    /// Map value field, for map entry tables
    pub fn map_value(&self) -> Option<&MiniTableField> {
        self.map_entry.then(|| &self.fields[1])
    }
}

/// An enum's value set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MiniEnum {
    pub(crate) name: Box<str>,
    pub(crate) low_mask: u64,
    pub(crate) values: Vec<i32>,
    pub(crate) closed: bool,
}

impl MiniEnum {
    /// Builds an enum from its declared values.
    pub fn new(name: impl Into<Box<str>>, values: impl IntoIterator<Item = i32>, closed: bool) -> Self {
        let mut values: Vec<i32> = values.into_iter().collect();
        values.sort_unstable();
        values.dedup();
        let low_mask = values
            .iter()
            .filter(|&&v| (0..64).contains(&v))
            .fold(0u64, |mask, &v| mask | (1 << v));
        Self {
            name: name.into(),
            low_mask,
            values,
            closed,
        }
    }

    /// Full enum name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Closed (proto2) enums reject undeclared values
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Declared values, ascending
    pub fn values(&self) -> &[i32] {
        &self.values
    }

    /// Whether `value` may be stored in a field of this enum.
    #[inline]
    pub fn check_value(&self, value: i32) -> bool {
        if !self.closed {
            return true;
        }
        if (0..64).contains(&value) {
            return self.low_mask & (1 << value) != 0;
        }
        self.values.binary_search(&value).is_ok()
    }
}

/// An extension field and the message it extends.
#[derive(Debug, Clone, PartialEq)]
pub struct MiniTableExtension {
    pub(crate) extendee: MessageIndex,
    pub(crate) field: MiniTableField,
}

impl MiniTableExtension {
    /// The extended message
    pub fn extendee(&self) -> MessageIndex {
        self.extendee
    }

    /// Field record; its offset is relative to the extension's value slot
    pub fn field(&self) -> &MiniTableField {
        &self.field
    }
}

/// A pool of message tables, enums and extensions.
#[derive(Debug, Default)]
pub struct Schema {
    pub(crate) messages: Vec<MiniTable>,
    pub(crate) enums: Vec<MiniEnum>,
    pub(crate) extensions: Vec<MiniTableExtension>,
    pub(crate) by_name: HashMap<Box<str>, MessageIndex>,
    pub(crate) extension_by_key: HashMap<(MessageIndex, u32), ExtensionIndex>,
}

impl Schema {
    /// Handle for the message at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` does not come from this schema.
    pub fn message(&self, index: MessageIndex) -> MessageType<'_> {
        assert!(index.index() < self.messages.len(), "message index out of range");
        MessageType {
            schema: self,
            index,
        }
    }

    /// Handle for the message named `name` (fully qualified, no leading dot).
    pub fn message_by_name(&self, name: &str) -> Option<MessageType<'_>> {
        let name = name.strip_prefix('.').unwrap_or(name);
        self.by_name.get(name).map(|&index| MessageType {
            schema: self,
            index,
        })
    }

    /// Iterates every message type.
    pub fn messages(&self) -> impl Iterator<Item = MessageType<'_>> + '_ {
        (0..self.messages.len()).map(move |i| MessageType {
            schema: self,
            index: MessageIndex(i as u32),
        })
    }

    /// Number of message tables
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Enum at `index`
    pub fn enum_table(&self, index: EnumIndex) -> Option<&MiniEnum> {
        self.enums.get(index.index())
    }

    /// Extension at `index`
    pub fn extension(&self, index: ExtensionIndex) -> Option<&MiniTableExtension> {
        self.extensions.get(index.index())
    }

    /// Finds the extension of `extendee` with `number`.
    pub fn find_extension(
        &self,
        extendee: MessageIndex,
        number: u32,
    ) -> Option<(ExtensionIndex, &MiniTableExtension)> {
        let idx = *self.extension_by_key.get(&(extendee, number))?;
        Some((idx, &self.extensions[idx.index()]))
    }

    pub(crate) fn table(&self, index: MessageIndex) -> &MiniTable {
        &self.messages[index.index()]
    }
}

/// A message table together with the schema that resolves its references.
#[derive(Clone, Copy)]
pub struct MessageType<'s> {
    schema: &'s Schema,
    index: MessageIndex,
}

impl<'s> MessageType<'s> {
    /// The layout table
    #[inline]
    pub fn table(&self) -> &'s MiniTable {
        self.schema.table(self.index)
    }

    /// Full message name
    pub fn name(&self) -> &'s str {
        self.table().name()
    }

    /// Position in the schema
    pub fn index(&self) -> MessageIndex {
        self.index
    }

    /// The owning schema
    pub fn schema(&self) -> &'s Schema {
        self.schema
    }

    /// Looks up a field record by number
    pub fn field(&self, number: u32) -> Option<&'s MiniTableField> {
        self.table().find_field_by_number(number)
    }

    /// Looks up a field record by number, failing with [`Error::FieldNotFound`]
    pub fn require_field(&self, number: u32) -> Result<&'s MiniTableField> {
        self.field(number).ok_or_else(|| Error::FieldNotFound {
            message: self.name().to_string(),
            number,
        })
    }

    /// Looks up a field record by name
    pub fn field_by_name(&self, name: &str) -> Option<&'s MiniTableField> {
        self.table().find_field_by_name(name)
    }

    /// Table of a message, group or map field's nested type.
    pub fn submessage_of(&self, field: &MiniTableField) -> Option<MessageType<'s>> {
        field.message_index().map(|index| MessageType {
            schema: self.schema,
            index,
        })
    }

    /// Enum of an enum field.
    pub fn enum_of(&self, field: &MiniTableField) -> Option<&'s MiniEnum> {
        field.enum_index().and_then(|idx| self.schema.enum_table(idx))
    }
}

impl PartialEq for MessageType<'_> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.schema, other.schema) && self.index == other.index
    }
}

impl Eq for MessageType<'_> {}

impl fmt::Debug for MessageType<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageType")
            .field("name", &self.name())
            .field("index", &self.index.0)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sparse_schema() -> Schema {
        let mut b = SchemaBuilder::new();
        let m = b.add_message("test.Sparse");
        b.message_mut(m)
            .add_field(FieldSpec::optional(3, "c", FieldType::Int32))
            .add_field(FieldSpec::optional(1, "a", FieldType::Int32))
            .add_field(FieldSpec::optional(2, "b", FieldType::Int32))
            .add_field(FieldSpec::optional(1000, "far", FieldType::Int64))
            .add_field(FieldSpec::optional(70, "mid", FieldType::String));
        b.build().unwrap()
    }

    #[test]
    fn test_find_field_dense_and_sparse() {
        let schema = sparse_schema();
        let ty = schema.message_by_name("test.Sparse").unwrap();
        let table = ty.table();
        assert_eq!(table.dense_below(), 3);
        let numbers: Vec<u32> = table.fields().iter().map(|f| f.number()).collect();
        assert_eq!(numbers, vec![1, 2, 3, 70, 1000]);

        assert_eq!(table.find_field_by_number(2).unwrap().name(), "b");
        assert_eq!(table.find_field_by_number(70).unwrap().name(), "mid");
        assert_eq!(table.find_field_by_number(1000).unwrap().name(), "far");
        assert!(table.find_field_by_number(0).is_none());
        assert!(table.find_field_by_number(4).is_none());
        assert!(table.find_field_by_number(999).is_none());
        assert!(ty.require_field(5).is_err());
    }

    #[test]
    fn test_required_mask_is_contiguous() {
        let mut b = SchemaBuilder::new();
        let m = b.add_message("R");
        b.message_mut(m)
            .add_field(FieldSpec::optional(1, "o", FieldType::Int32))
            .add_field(FieldSpec::required(2, "r1", FieldType::Int32))
            .add_field(FieldSpec::required(5, "r2", FieldType::String));
        let schema = b.build().unwrap();
        let table = schema.message(m).table();
        assert_eq!(table.required_count(), 2);
        assert_eq!(table.required_mask(), 0b11);
        let r1 = table.find_field_by_number(2).unwrap();
        let r2 = table.find_field_by_number(5).unwrap();
        let o = table.find_field_by_number(1).unwrap();
        assert_eq!(r1.hasbit(), Some(0));
        assert_eq!(r2.hasbit(), Some(1));
        assert_eq!(o.hasbit(), Some(2));
    }

    #[test]
    fn test_closed_enum_check() {
        let closed = MiniEnum::new("E", [0, 1, 5, 100, -3], true);
        assert!(closed.check_value(5));
        assert!(closed.check_value(100));
        assert!(closed.check_value(-3));
        assert!(!closed.check_value(2));
        assert!(!closed.check_value(101));
        let open = MiniEnum::new("O", [0], false);
        assert!(open.check_value(12345));
    }

    #[test]
    fn test_field_type_wire_types() {
        assert_eq!(FieldType::SInt64.wire_type(), WireType::Varint);
        assert_eq!(FieldType::SFixed32.wire_type(), WireType::I32);
        assert_eq!(FieldType::Double.wire_type(), WireType::I64);
        assert_eq!(FieldType::Bytes.wire_type(), WireType::Len);
        assert_eq!(FieldType::Group.wire_type(), WireType::StartGroup);
        assert!(!FieldType::String.is_packable());
        assert!(FieldType::Enum.is_packable());
        assert_eq!(FieldType::try_from(18).unwrap(), FieldType::SInt64);
        assert!(FieldType::try_from(19).is_err());
    }

    #[test]
    fn test_message_type_equality() {
        let a = sparse_schema();
        let b = sparse_schema();
        let ta = a.message_by_name(".test.Sparse").unwrap();
        assert_eq!(ta, a.message(ta.index()));
        assert_ne!(ta, b.message(ta.index()));
    }
}
