//! Programmatic construction of [`Schema`]s.
//!
//! Messages are declared first and filled in afterwards, so fields may
//! reference any message of the same builder, including their own.
//!
//! ```
//! use tkan_core::{Cardinality, FieldSpec, FieldType, SchemaBuilder};
//!
//! let mut builder = SchemaBuilder::new();
//! let node = builder.add_message("demo.Node");
//! builder
//!     .message_mut(node)
//!     .add_field(FieldSpec::optional(1, "value", FieldType::Int32))
//!     .add_field(FieldSpec::optional(2, "next", FieldType::Message).message(node));
//! let schema = builder.build()?;
//! assert_eq!(schema.message(node).table().fields().len(), 2);
//! # Ok::<(), tkan_core::Error>(())
//! ```

use std::collections::{HashMap, HashSet};

use tracing::debug;

use super::{
    DefaultValue, EnumIndex, ExtensionIndex, FieldMode, FieldType, MessageIndex, MiniEnum,
    MiniTable, MiniTableExtension, MiniTableField, OneofTable, Presence, Schema, SubRef,
};
use crate::error::{Error, Result};
use crate::message::HEADER_SIZE;
use crate::wire::{is_valid_field_number, MAX_FIELD_NUMBER};

/// Required fields beyond this count cannot share the contiguous mask.
const MAX_REQUIRED_FIELDS: usize = 63;

/// Label of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    /// One value without presence tracking (proto3 plain fields)
    Singular,
    /// One value with explicit presence
    Optional,
    /// One value that must be present for the message to be initialized
    Required,
    /// Any number of values
    Repeated,
}

/// Declaration of one field.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub(crate) number: u32,
    pub(crate) name: String,
    pub(crate) field_type: FieldType,
    pub(crate) cardinality: Cardinality,
    pub(crate) packed: bool,
    pub(crate) map: bool,
    pub(crate) sub: SubRef,
    pub(crate) oneof: Option<usize>,
    pub(crate) default: DefaultValue,
}

impl FieldSpec {
    /// Creates a field declaration
    pub fn new(
        number: u32,
        name: impl Into<String>,
        field_type: FieldType,
        cardinality: Cardinality,
    ) -> Self {
        Self {
            number,
            name: name.into(),
            field_type,
            cardinality,
            packed: false,
            map: false,
            sub: SubRef::None,
            oneof: None,
            default: DefaultValue::Zero,
        }
    }

    /// A field without presence tracking
    pub fn singular(number: u32, name: impl Into<String>, field_type: FieldType) -> Self {
        Self::new(number, name, field_type, Cardinality::Singular)
    }

    /// A field with explicit presence
    pub fn optional(number: u32, name: impl Into<String>, field_type: FieldType) -> Self {
        Self::new(number, name, field_type, Cardinality::Optional)
    }

    /// A required field
    pub fn required(number: u32, name: impl Into<String>, field_type: FieldType) -> Self {
        Self::new(number, name, field_type, Cardinality::Required)
    }

    /// A repeated field
    pub fn repeated(number: u32, name: impl Into<String>, field_type: FieldType) -> Self {
        Self::new(number, name, field_type, Cardinality::Repeated)
    }

    /// A map field whose entries are described by the `entry` table
    pub fn map(number: u32, name: impl Into<String>, entry: MessageIndex) -> Self {
        let mut spec = Self::new(number, name, FieldType::Message, Cardinality::Repeated);
        spec.map = true;
        spec.sub = SubRef::Message(entry);
        spec
    }

    /// Write repeated values packed
    pub fn packed(mut self, packed: bool) -> Self {
        self.packed = packed;
        self
    }

    /// Set the nested message type of a message or group field
    pub fn message(mut self, index: MessageIndex) -> Self {
        self.sub = SubRef::Message(index);
        self
    }

    /// Set the enum of an enum field
    pub fn enumeration(mut self, index: EnumIndex) -> Self {
        self.sub = SubRef::Enum(index);
        self
    }

    /// Place the field in the oneof returned by [`MessageSpec::add_oneof`]
    pub fn oneof(mut self, oneof: usize) -> Self {
        self.oneof = Some(oneof);
        self
    }

    /// Set the value reported while the field is unset
    pub fn default_value(mut self, value: DefaultValue) -> Self {
        self.default = value;
        self
    }
}

/// Declaration of one message.
#[derive(Debug, Clone)]
pub struct MessageSpec {
    name: String,
    fields: Vec<FieldSpec>,
    oneofs: Vec<String>,
    map_entry: bool,
    extendable: bool,
}

impl MessageSpec {
    /// Adds a field
    pub fn add_field(&mut self, field: FieldSpec) -> &mut Self {
        self.fields.push(field);
        self
    }

    /// Declares a oneof and returns its index for [`FieldSpec::oneof`]
    pub fn add_oneof(&mut self, name: impl Into<String>) -> usize {
        self.oneofs.push(name.into());
        self.oneofs.len() - 1
    }

    /// Allow extensions of this message
    pub fn set_extendable(&mut self, extendable: bool) -> &mut Self {
        self.extendable = extendable;
        self
    }

    /// Marks the message as a map entry type (key = 1, value = 2)
    pub fn set_map_entry(&mut self, map_entry: bool) -> &mut Self {
        self.map_entry = map_entry;
        self
    }

    /// Message name
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Collects message, enum and extension declarations and lays them out.
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    messages: Vec<MessageSpec>,
    enums: Vec<MiniEnum>,
    extensions: Vec<(MessageIndex, FieldSpec)>,
}

impl SchemaBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a message and returns its index.
    pub fn add_message(&mut self, name: impl Into<String>) -> MessageIndex {
        self.messages.push(MessageSpec {
            name: name.into(),
            fields: Vec::new(),
            oneofs: Vec::new(),
            map_entry: false,
            extendable: false,
        });
        MessageIndex((self.messages.len() - 1) as u32)
    }

    /// Declaration of a previously added message.
    ///
    /// # Panics
    ///
    /// Panics if `index` was not returned by this builder.
    pub fn message_mut(&mut self, index: MessageIndex) -> &mut MessageSpec {
        &mut self.messages[index.index()]
    }

    /// Declares a map entry message with `key = 1` and `value = 2`.
    pub fn add_map_entry(
        &mut self,
        name: impl Into<String>,
        key: FieldType,
        value: FieldType,
        value_sub: SubRef,
    ) -> MessageIndex {
        let idx = self.add_message(name);
        let entry = self.message_mut(idx);
        entry.map_entry = true;
        entry.add_field(FieldSpec::singular(1, "key", key));
        let mut value_field = FieldSpec::singular(2, "value", value);
        value_field.sub = value_sub;
        entry.add_field(value_field);
        idx
    }

    /// Declares an enum and returns its index.
    pub fn add_enum(
        &mut self,
        name: impl Into<String>,
        values: impl IntoIterator<Item = i32>,
        closed: bool,
    ) -> EnumIndex {
        self.enums.push(MiniEnum::new(name.into(), values, closed));
        EnumIndex((self.enums.len() - 1) as u32)
    }

    /// Declares an extension of `extendee`.
    pub fn add_extension(&mut self, extendee: MessageIndex, field: FieldSpec) -> ExtensionIndex {
        self.extensions.push((extendee, field));
        ExtensionIndex((self.extensions.len() - 1) as u32)
    }

    pub(crate) fn message_spec(&self, index: MessageIndex) -> Option<&MessageSpec> {
        self.messages.get(index.index())
    }

    /// Validates every declaration and computes the layouts.
    pub fn build(self) -> Result<Schema> {
        let mut messages = Vec::with_capacity(self.messages.len());
        let mut by_name = HashMap::with_capacity(self.messages.len());

        for (i, spec) in self.messages.iter().enumerate() {
            let table = self.layout_message(spec)?;
            if by_name.insert(spec.name.clone().into_boxed_str(), MessageIndex(i as u32)).is_some() {
                return Err(Error::schema(format!("duplicate message name '{}'", spec.name)));
            }
            messages.push(table);
        }

        let mut extensions = Vec::with_capacity(self.extensions.len());
        let mut extension_by_key = HashMap::with_capacity(self.extensions.len());
        for (i, (extendee, spec)) in self.extensions.iter().enumerate() {
            let target = self
                .message_spec(*extendee)
                .ok_or_else(|| Error::schema(format!("extension '{}' extends an unknown message", spec.name)))?;
            if !target.extendable {
                return Err(Error::schema(format!(
                    "extension '{}' extends '{}', which declares no extension ranges",
                    spec.name, target.name
                )));
            }
            if spec.oneof.is_some() || spec.cardinality == Cardinality::Required || spec.map {
                return Err(Error::schema(format!(
                    "extension '{}' cannot be required, a map or a oneof member",
                    spec.name
                )));
            }
            self.validate_field(target, spec)?;
            let mode = if spec.cardinality == Cardinality::Repeated {
                FieldMode::Array
            } else {
                FieldMode::Scalar
            };
            let field = MiniTableField {
                number: spec.number,
                name: spec.name.clone().into_boxed_str(),
                field_type: spec.field_type,
                mode,
                packed: spec.packed,
                offset: 0,
                presence: Presence::Implicit,
                sub: spec.sub,
                default: spec.default.clone(),
                required: false,
            };
            if extension_by_key
                .insert((*extendee, spec.number), ExtensionIndex(i as u32))
                .is_some()
            {
                return Err(Error::schema(format!(
                    "duplicate extension number {} on '{}'",
                    spec.number, target.name
                )));
            }
            if target.fields.iter().any(|f| f.number == spec.number) {
                return Err(Error::schema(format!(
                    "extension '{}' reuses field number {} of '{}'",
                    spec.name, spec.number, target.name
                )));
            }
            extensions.push(MiniTableExtension {
                extendee: *extendee,
                field,
            });
        }

        debug!(
            "Built schema with {} messages, {} enums, {} extensions",
            messages.len(),
            self.enums.len(),
            extensions.len()
        );

        Ok(Schema {
            messages,
            enums: self.enums,
            extensions,
            by_name,
            extension_by_key,
        })
    }

    fn validate_field(&self, owner: &MessageSpec, field: &FieldSpec) -> Result<()> {
        if !is_valid_field_number(field.number) {
            return Err(Error::InvalidFieldNumber {
                number: field.number,
                max: MAX_FIELD_NUMBER,
            });
        }
        let context = || format!("field {} ('{}') of '{}'", field.number, field.name, owner.name);

        match (field.field_type, field.sub) {
            (FieldType::Message | FieldType::Group, SubRef::Message(idx)) => {
                let sub = self
                    .message_spec(idx)
                    .ok_or_else(|| Error::schema(format!("{} references an unknown message", context())))?;
                if sub.map_entry != field.map {
                    return Err(Error::schema(format!(
                        "{}: map fields and map entry types must go together",
                        context()
                    )));
                }
            }
            (FieldType::Message | FieldType::Group, _) => {
                return Err(Error::schema(format!("{} has no message type", context())));
            }
            (FieldType::Enum, SubRef::Enum(idx)) => {
                if idx.index() >= self.enums.len() {
                    return Err(Error::schema(format!("{} references an unknown enum", context())));
                }
            }
            (FieldType::Enum, _) => {
                return Err(Error::schema(format!("{} has no enum type", context())));
            }
            (_, SubRef::None) => {}
            (_, _) => {
                return Err(Error::schema(format!(
                    "{} is a scalar but references a nested type",
                    context()
                )));
            }
        }

        if field.map && (field.cardinality != Cardinality::Repeated || field.field_type != FieldType::Message) {
            return Err(Error::schema(format!("{}: map fields are repeated messages", context())));
        }
        if field.packed && (field.cardinality != Cardinality::Repeated || !field.field_type.is_packable()) {
            return Err(Error::schema(format!(
                "{}: only repeated primitive fields can be packed",
                context()
            )));
        }
        let default_ok = match (&field.default, field.field_type) {
            (DefaultValue::Zero, _) => true,
            (DefaultValue::Bool(_), FieldType::Bool) => true,
            (DefaultValue::Int32(_), FieldType::Int32 | FieldType::SInt32 | FieldType::SFixed32 | FieldType::Enum) => {
                true
            }
            (DefaultValue::Int64(_), FieldType::Int64 | FieldType::SInt64 | FieldType::SFixed64) => true,
            (DefaultValue::UInt32(_), FieldType::UInt32 | FieldType::Fixed32) => true,
            (DefaultValue::UInt64(_), FieldType::UInt64 | FieldType::Fixed64) => true,
            (DefaultValue::Float(_), FieldType::Float) => true,
            (DefaultValue::Double(_), FieldType::Double) => true,
            (DefaultValue::Bytes(b), FieldType::String) => std::str::from_utf8(b).is_ok(),
            (DefaultValue::Bytes(_), FieldType::Bytes) => true,
            _ => false,
        };
        if !default_ok || (field.default != DefaultValue::Zero && field.cardinality == Cardinality::Repeated) {
            return Err(Error::schema(format!("{}: default value does not fit the field type", context())));
        }
        if let Some(oneof) = field.oneof {
            if oneof >= owner.oneofs.len() {
                return Err(Error::schema(format!("{} names an undeclared oneof", context())));
            }
            if matches!(field.cardinality, Cardinality::Repeated | Cardinality::Required) {
                return Err(Error::schema(format!(
                    "{}: oneof members cannot be repeated or required",
                    context()
                )));
            }
        }
        Ok(())
    }

    fn layout_message(&self, spec: &MessageSpec) -> Result<MiniTable> {
        let mut fields: Vec<&FieldSpec> = spec.fields.iter().collect();
        fields.sort_by_key(|f| f.number);

        let mut seen = HashSet::with_capacity(fields.len());
        for field in &fields {
            self.validate_field(spec, field)?;
            if !seen.insert(field.number) {
                return Err(Error::schema(format!(
                    "duplicate field number {} in '{}'",
                    field.number, spec.name
                )));
            }
        }

        if spec.map_entry {
            self.validate_map_entry(spec, &fields)?;
        }

        // Presence bits: required fields first so their mask is contiguous.
        let has_hasbit = |f: &FieldSpec| {
            f.oneof.is_none()
                && match f.cardinality {
                    Cardinality::Required | Cardinality::Optional => true,
                    Cardinality::Singular => f.field_type.is_submessage(),
                    Cardinality::Repeated => false,
                }
        };
        let mut hasbits: HashMap<u32, u16> = HashMap::new();
        let required: Vec<u32> = fields
            .iter()
            .filter(|f| f.cardinality == Cardinality::Required)
            .map(|f| f.number)
            .collect();
        if required.len() > MAX_REQUIRED_FIELDS {
            return Err(Error::schema(format!(
                "'{}' declares {} required fields; at most {} are supported",
                spec.name,
                required.len(),
                MAX_REQUIRED_FIELDS
            )));
        }
        for &number in &required {
            let bit = hasbits.len() as u16;
            hasbits.insert(number, bit);
        }
        for field in fields.iter().filter(|f| has_hasbit(f) && f.cardinality != Cardinality::Required) {
            let bit = hasbits.len() as u16;
            hasbits.insert(field.number, bit);
        }
        let hasbit_bytes = hasbits.len().div_ceil(8);

        // Storage slots, largest first to minimize padding.
        enum Slot {
            Field(usize),
            OneofData(usize),
            OneofCase(usize),
        }
        let mut slots: Vec<(usize, usize, Slot)> = Vec::new();
        for (i, field) in fields.iter().enumerate() {
            if field.oneof.is_none() {
                let rep = slot_rep(field);
                slots.push((rep.size(), rep.align(), Slot::Field(i)));
            }
        }
        for oneof in 0..spec.oneofs.len() {
            let members = fields.iter().filter(|f| f.oneof == Some(oneof));
            let (size, align) = members.fold((0, 1), |(s, a), f| {
                let rep = slot_rep(f);
                (s.max(rep.size()), a.max(rep.align()))
            });
            if size > 0 {
                slots.push((size, align, Slot::OneofData(oneof)));
                slots.push((4, 4, Slot::OneofCase(oneof)));
            }
        }
        slots.sort_by(|a, b| b.0.cmp(&a.0));

        let mut offset = HEADER_SIZE + hasbit_bytes;
        let mut field_offsets = vec![0u32; fields.len()];
        let mut oneof_data = vec![0u32; spec.oneofs.len()];
        let mut oneof_case = vec![0u32; spec.oneofs.len()];
        for (size, align, slot) in slots {
            offset = (offset + align - 1) & !(align - 1);
            let at = u32::try_from(offset)
                .map_err(|_| Error::schema(format!("'{}' is too large", spec.name)))?;
            match slot {
                Slot::Field(i) => field_offsets[i] = at,
                Slot::OneofData(k) => oneof_data[k] = at,
                Slot::OneofCase(k) => oneof_case[k] = at,
            }
            offset += size;
        }
        let align = std::mem::align_of::<usize>();
        let size = (offset + align - 1) & !(align - 1);

        let table_fields: Vec<MiniTableField> = fields
            .iter()
            .enumerate()
            .map(|(i, f)| {
                let (offset, presence) = match f.oneof {
                    Some(k) => (
                        oneof_data[k],
                        Presence::Oneof {
                            case_offset: oneof_case[k],
                            index: k as u16,
                        },
                    ),
                    None => (
                        field_offsets[i],
                        hasbits
                            .get(&f.number)
                            .map_or(Presence::Implicit, |&bit| Presence::Hasbit(bit)),
                    ),
                };
                let mode = match (f.map, f.cardinality) {
                    (true, _) => FieldMode::Map,
                    (false, Cardinality::Repeated) => FieldMode::Array,
                    _ => FieldMode::Scalar,
                };
                MiniTableField {
                    number: f.number,
                    name: f.name.clone().into_boxed_str(),
                    field_type: f.field_type,
                    mode,
                    packed: f.packed,
                    offset,
                    presence,
                    sub: f.sub,
                    default: f.default.clone(),
                    required: f.cardinality == Cardinality::Required,
                }
            })
            .collect();

        let dense_below = table_fields
            .iter()
            .enumerate()
            .take_while(|(i, f)| f.number == *i as u32 + 1)
            .count() as u32;

        let oneofs = spec
            .oneofs
            .iter()
            .enumerate()
            .map(|(k, name)| OneofTable {
                name: name.clone().into_boxed_str(),
                case_offset: oneof_case[k],
                data_offset: oneof_data[k],
                members: fields
                    .iter()
                    .filter(|f| f.oneof == Some(k))
                    .map(|f| f.number)
                    .collect(),
            })
            .collect();

        Ok(MiniTable {
            name: spec.name.clone().into_boxed_str(),
            size: u32::try_from(size).map_err(|_| Error::schema(format!("'{}' is too large", spec.name)))?,
            fields: table_fields,
            dense_below,
            required_count: required.len() as u8,
            hasbit_bytes: hasbit_bytes as u32,
            oneofs,
            map_entry: spec.map_entry,
            extendable: spec.extendable,
        })
    }

    fn validate_map_entry(&self, spec: &MessageSpec, fields: &[&FieldSpec]) -> Result<()> {
        let shape_ok = fields.len() == 2
            && fields[0].number == 1
            && fields[1].number == 2
            && fields.iter().all(|f| f.cardinality == Cardinality::Singular);
        if !shape_ok {
            return Err(Error::schema(format!(
                "map entry '{}' must have exactly a singular key = 1 and value = 2",
                spec.name
            )));
        }
        let key_ok = !matches!(
            fields[0].field_type,
            FieldType::Float
                | FieldType::Double
                | FieldType::Bytes
                | FieldType::Message
                | FieldType::Group
                | FieldType::Enum
        );
        if !key_ok {
            return Err(Error::schema(format!(
                "map entry '{}' has a key type that cannot be a map key",
                spec.name
            )));
        }
        Ok(())
    }
}

fn slot_rep(field: &FieldSpec) -> super::FieldRep {
    if field.cardinality == Cardinality::Repeated {
        super::FieldRep::Pointer
    } else {
        field.field_type.rep()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_offsets_do_not_overlap() {
        let mut b = SchemaBuilder::new();
        let m = b.add_message("L");
        let spec = b.message_mut(m);
        let choice = spec.add_oneof("choice");
        spec.add_field(FieldSpec::optional(1, "flag", FieldType::Bool))
            .add_field(FieldSpec::optional(2, "d", FieldType::Double))
            .add_field(FieldSpec::singular(3, "i", FieldType::Int32))
            .add_field(FieldSpec::optional(4, "s", FieldType::String))
            .add_field(FieldSpec::repeated(5, "r", FieldType::Int64).packed(true))
            .add_field(FieldSpec::optional(6, "o1", FieldType::Int32).oneof(choice))
            .add_field(FieldSpec::optional(7, "o2", FieldType::String).oneof(choice));
        let schema = b.build().unwrap();
        let table = schema.message(m).table();

        let mut ranges: Vec<(usize, usize)> = table
            .fields()
            .iter()
            .filter(|f| !f.in_oneof())
            .map(|f| (f.offset() as usize, f.offset() as usize + f.rep().size()))
            .collect();
        let oneof = &table.oneofs()[0];
        ranges.push((oneof.data_offset() as usize, oneof.data_offset() as usize + 16));
        ranges.push((oneof.case_offset() as usize, oneof.case_offset() as usize + 4));
        ranges.sort_unstable();
        assert!(ranges[0].0 >= HEADER_SIZE + table.hasbit_bytes() as usize);
        for pair in ranges.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "overlap in {:?}", ranges);
        }
        assert!(ranges.last().unwrap().1 <= table.size());
        assert_eq!(table.size() % std::mem::align_of::<usize>(), 0);

        let o1 = table.find_field_by_number(6).unwrap();
        let o2 = table.find_field_by_number(7).unwrap();
        assert_eq!(o1.offset(), o2.offset());
        assert_eq!(o1.presence(), o2.presence());
        assert_eq!(table.find_field_by_number(3).unwrap().presence(), Presence::Implicit);
    }

    #[test]
    fn test_rejects_bad_declarations() {
        let mut b = SchemaBuilder::new();
        let m = b.add_message("Dup");
        b.message_mut(m)
            .add_field(FieldSpec::optional(1, "a", FieldType::Int32))
            .add_field(FieldSpec::optional(1, "b", FieldType::Int32));
        assert!(b.build().is_err());

        let mut b = SchemaBuilder::new();
        let m = b.add_message("Reserved");
        b.message_mut(m)
            .add_field(FieldSpec::optional(19_000, "a", FieldType::Int32));
        assert!(matches!(b.build(), Err(Error::InvalidFieldNumber { number: 19_000, .. })));

        let mut b = SchemaBuilder::new();
        let m = b.add_message("NoSub");
        b.message_mut(m)
            .add_field(FieldSpec::optional(1, "child", FieldType::Message));
        assert!(b.build().is_err());

        let mut b = SchemaBuilder::new();
        let m = b.add_message("PackedString");
        b.message_mut(m)
            .add_field(FieldSpec::repeated(1, "s", FieldType::String).packed(true));
        assert!(b.build().is_err());

        let mut b = SchemaBuilder::new();
        let m = b.add_message("BadDefault");
        b.message_mut(m)
            .add_field(FieldSpec::optional(1, "n", FieldType::UInt32).default_value(DefaultValue::Int32(-1)));
        assert!(b.build().is_err());
    }

    #[test]
    fn test_map_entry_validation() {
        let mut b = SchemaBuilder::new();
        let entry = b.add_map_entry("M.ValuesEntry", FieldType::String, FieldType::Int32, SubRef::None);
        let m = b.add_message("M");
        b.message_mut(m).add_field(FieldSpec::map(1, "values", entry));
        let schema = b.build().unwrap();
        let table = schema.message(m).table();
        assert_eq!(table.fields()[0].mode(), FieldMode::Map);
        assert!(schema.message(entry).table().is_map_entry());

        let mut b = SchemaBuilder::new();
        let entry = b.add_map_entry("Bad", FieldType::Double, FieldType::Int32, SubRef::None);
        let m = b.add_message("M");
        b.message_mut(m).add_field(FieldSpec::map(1, "values", entry));
        assert!(b.build().is_err());
    }

    #[test]
    fn test_extension_requires_extendable_target() {
        let mut b = SchemaBuilder::new();
        let m = b.add_message("Base");
        b.add_extension(m, FieldSpec::optional(100, "ext", FieldType::Int32));
        assert!(b.build().is_err());

        let mut b = SchemaBuilder::new();
        let m = b.add_message("Base");
        b.message_mut(m).set_extendable(true);
        let ext = b.add_extension(m, FieldSpec::optional(100, "ext", FieldType::Int32));
        let schema = b.build().unwrap();
        let (found, def) = schema.find_extension(m, 100).unwrap();
        assert_eq!(found, ext);
        assert_eq!(def.field().number(), 100);
        assert!(schema.find_extension(m, 101).is_none());
    }
}
