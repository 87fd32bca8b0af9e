//! Wire format encoder.
//!
//! Output follows the table's field order, then extensions, then the
//! unknown fields. Repeated primitives are packed only when the field is
//! declared packed. Map fields become one entry record per stored entry;
//! with [`EncodeOptions::deterministic`] the entries are sorted by key and
//! only the last entry of a repeated key is written.

mod buffer;

use std::cmp::Ordering;
use std::ptr::NonNull;

use tracing::debug;

use crate::arena::{Arena, ArenaNode};
use crate::error::{Error, Result};
use crate::message::internal;
use crate::message::{read_elem, Array, Message, Value, DEFAULT_MAX_DEPTH};
use crate::mini_table::{FieldMode, FieldType, MessageType, MiniTableField, Schema};
use crate::wire::{self, WireType};

use buffer::ReverseBuffer;

/// Options controlling [`encode`].
#[derive(Debug, Clone)]
pub struct EncodeOptions {
    /// Sort map entries by key and extensions by number
    pub deterministic: bool,
    /// Leave unknown fields out of the output
    pub skip_unknown: bool,
    /// Fail with [`Error::MissingRequired`] if a required field is unset
    pub check_required: bool,
    /// Maximum submessage nesting below the root message
    pub max_depth: u32,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            deterministic: false,
            skip_unknown: false,
            check_required: false,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl EncodeOptions {
    /// Creates the default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets deterministic output
    pub fn deterministic(mut self, deterministic: bool) -> Self {
        self.deterministic = deterministic;
        self
    }

    /// Sets whether unknown fields are dropped
    pub fn skip_unknown(mut self, skip: bool) -> Self {
        self.skip_unknown = skip;
        self
    }

    /// Sets required-field checking
    pub fn check_required(mut self, check: bool) -> Self {
        self.check_required = check;
        self
    }

    /// Sets the nesting limit
    pub fn max_depth(mut self, depth: u32) -> Self {
        self.max_depth = depth;
        self
    }
}

/// Encodes `msg`, placing the output in `arena`.
pub fn encode<'a>(msg: Message<'_>, arena: &'a Arena, options: &EncodeOptions) -> Result<&'a [u8]> {
    let out = run(msg, options)?;
    let len = out.len();
    if len == 0 {
        return Ok(&[]);
    }
    let p = arena.allocate(len, 1)?;
    // SAFETY: p is a fresh arena region of `len` bytes, written once here
    // and alive as long as the arena.
    unsafe {
        let dst = std::slice::from_raw_parts_mut(p.as_ptr(), len);
        out.copy_to(dst);
        Ok(dst)
    }
}

/// Encodes `msg` into a new vector.
pub fn encode_to_vec(msg: Message<'_>, options: &EncodeOptions) -> Result<Vec<u8>> {
    Ok(run(msg, options)?.into_vec())
}

fn run(msg: Message<'_>, options: &EncodeOptions) -> Result<ReverseBuffer> {
    let mut encoder = Encoder {
        out: ReverseBuffer::new(),
        schema: msg.message_type().schema(),
        deterministic: options.deterministic,
        skip_unknown: options.skip_unknown,
        check_required: options.check_required,
        depth: options.max_depth,
        limit: options.max_depth,
    };
    encoder.message(msg)?;
    debug!(
        message = msg.message_type().name(),
        bytes = encoder.out.len(),
        deterministic = options.deterministic,
        "encoded"
    );
    Ok(encoder.out)
}

/// Encodes `msg` behind a varint length prefix.
pub fn encode_length_prefixed(msg: Message<'_>, options: &EncodeOptions) -> Result<Vec<u8>> {
    let body = encode_to_vec(msg, options)?;
    let mut scratch = [0u8; wire::MAX_VARINT_LEN];
    let n = wire::encode_varint(body.len() as u64, &mut scratch);
    let mut out = Vec::with_capacity(n + body.len());
    out.extend_from_slice(&scratch[..n]);
    out.extend_from_slice(&body);
    Ok(out)
}

struct Encoder<'s> {
    out: ReverseBuffer,
    schema: &'s Schema,
    deterministic: bool,
    skip_unknown: bool,
    check_required: bool,
    /// Remaining submessage levels
    depth: u32,
    limit: u32,
}

impl<'s> Encoder<'s> {
    fn sub_type(&self, field: &MiniTableField) -> Option<MessageType<'s>> {
        field.message_index().map(|idx| self.schema.message(idx))
    }

    /// Writes the body of `msg`, last byte first.
    fn message(&mut self, msg: Message<'_>) -> Result<()> {
        if self.check_required && !msg.has_required() {
            return Err(Error::missing_required(msg.message_type().name()));
        }
        if !self.skip_unknown {
            self.out.put_bytes(msg.unknown_fields());
        }

        let mut extensions = msg.extension_entries();
        if self.deterministic {
            extensions.sort_by_key(|(def, _)| def.field().number());
        }
        // SAFETY: live object.
        let owner = unsafe { internal::owner(msg.as_non_null()) };
        for (def, data) in extensions.iter().rev() {
            self.field(owner, *data, def.field(), true)?;
        }

        for field in msg.table().fields().iter().rev() {
            self.field(owner, msg.as_non_null(), field, false)?;
        }
        Ok(())
    }

    /// Writes `field` stored relative to `base`; `always` skips the
    /// presence test for singular values.
    fn field(
        &mut self,
        owner: NonNull<ArenaNode>,
        base: NonNull<u8>,
        field: &MiniTableField,
        always: bool,
    ) -> Result<()> {
        let ty = field.field_type();
        if ty == FieldType::Group && !cfg!(feature = "groups") {
            return Err(Error::Unsupported(format!(
                "group field {} in a build without group support",
                field.number()
            )));
        }
        match field.mode() {
            FieldMode::Scalar => {
                // SAFETY: base is a live object or extension slot laid out for `field`.
                let value = unsafe {
                    if !always && !internal::is_present(base, field) {
                        return Ok(());
                    }
                    read_elem(internal::slot::<u8>(base, field.offset()), ty, self.sub_type(field))
                };
                match value {
                    Some(v) => self.value(field.number(), ty, v),
                    None => Ok(()),
                }
            }
            FieldMode::Array => {
                // SAFETY: repeated slot of `field`.
                let Some(hdr) = (unsafe { internal::array_of(base, field) }) else {
                    return Ok(());
                };
                // SAFETY: the array lives as long as the message being encoded.
                let array = unsafe { Array::from_raw(hdr, field, self.schema, owner) };
                self.array(field, array)
            }
            FieldMode::Map => {
                // SAFETY: map slot of `field`.
                let Some(hdr) = (unsafe { internal::array_of(base, field) }) else {
                    return Ok(());
                };
                // SAFETY: as above.
                let array = unsafe { Array::from_raw(hdr, field, self.schema, owner) };
                self.map(field, array)
            }
        }
    }

    fn array(&mut self, field: &MiniTableField, array: Array<'_>) -> Result<()> {
        if array.is_empty() {
            return Ok(());
        }
        let ty = field.field_type();
        let elems: Vec<Value<'_>> = array.iter().collect();
        if field.is_packed() && ty.is_packable() {
            let mark = self.out.len();
            for v in elems.iter().rev() {
                self.payload(ty, *v)?;
            }
            let len = self.out.len() - mark;
            self.out.put_varint(len as u64);
            self.out.put_tag(field.number(), WireType::Len);
            return Ok(());
        }
        for v in elems.iter().rev() {
            self.value(field.number(), ty, *v)?;
        }
        Ok(())
    }

    fn map(&mut self, field: &MiniTableField, array: Array<'_>) -> Result<()> {
        let Some(entry_type) = self.sub_type(field) else {
            return Ok(());
        };
        let (Some(key), Some(value)) = (entry_type.table().map_key(), entry_type.table().map_value()) else {
            return Err(Error::schema(format!("map field {} has no entry table", field.number())));
        };
        let mut entries: Vec<Message<'_>> = array.iter().filter_map(|v| v.as_message()).collect();
        if self.deterministic {
            let keyed: Vec<(Value<'_>, Message<'_>)> =
                entries.iter().filter_map(|e| Some((e.get(key)?, *e))).collect();
            entries = sort_dedup_by_key(keyed);
        }
        for entry in entries.iter().rev() {
            self.descend()?;
            let mark = self.out.len();
            // key and value are always written, in that order
            match entry.get(value) {
                Some(v) => self.value(value.number(), value.field_type(), v)?,
                None => {
                    self.out.put_varint(0);
                    self.out.put_tag(value.number(), WireType::Len);
                }
            }
            if let Some(k) = entry.get(key) {
                self.value(key.number(), key.field_type(), k)?;
            }
            let len = self.out.len() - mark;
            self.depth += 1;
            self.out.put_varint(len as u64);
            self.out.put_tag(field.number(), WireType::Len);
        }
        Ok(())
    }

    fn descend(&mut self) -> Result<()> {
        if self.depth == 0 {
            return Err(Error::MaxDepthExceeded { limit: self.limit });
        }
        self.depth -= 1;
        Ok(())
    }

    /// Writes one tagged value.
    fn value(&mut self, number: u32, ty: FieldType, value: Value<'_>) -> Result<()> {
        match (ty, value) {
            (FieldType::Group, Value::Message(child)) => {
                self.out.put_tag(number, WireType::EndGroup);
                self.descend()?;
                self.message(child)?;
                self.depth += 1;
                self.out.put_tag(number, WireType::StartGroup);
            }
            (_, Value::Message(child)) => {
                let mark = self.out.len();
                self.descend()?;
                self.message(child)?;
                self.depth += 1;
                let len = self.out.len() - mark;
                self.out.put_varint(len as u64);
                self.out.put_tag(number, WireType::Len);
            }
            (_, Value::Bytes(data)) => {
                self.out.put_bytes(data);
                self.out.put_varint(data.len() as u64);
                self.out.put_tag(number, WireType::Len);
            }
            _ => {
                self.payload(ty, value)?;
                self.out.put_tag(number, ty.wire_type());
            }
        }
        Ok(())
    }

    /// Writes an untagged scalar payload.
    fn payload(&mut self, ty: FieldType, value: Value<'_>) -> Result<()> {
        use FieldType::*;
        match (ty, value) {
            (Bool, Value::Bool(v)) => self.out.put_varint(u64::from(v)),
            (Int32 | Enum, Value::I32(v)) => self.out.put_varint(i64::from(v) as u64),
            (SInt32, Value::I32(v)) => self.out.put_varint(u64::from(wire::zigzag_encode32(v))),
            (SFixed32, Value::I32(v)) => self.out.put_fixed32(v as u32),
            (UInt32, Value::U32(v)) => self.out.put_varint(u64::from(v)),
            (Fixed32, Value::U32(v)) => self.out.put_fixed32(v),
            (Int64, Value::I64(v)) => self.out.put_varint(v as u64),
            (SInt64, Value::I64(v)) => self.out.put_varint(wire::zigzag_encode64(v)),
            (SFixed64, Value::I64(v)) => self.out.put_fixed64(v as u64),
            (UInt64, Value::U64(v)) => self.out.put_varint(v),
            (Fixed64, Value::U64(v)) => self.out.put_fixed64(v),
            (Float, Value::F32(v)) => self.out.put_fixed32(v.to_bits()),
            (Double, Value::F64(v)) => self.out.put_fixed64(v.to_bits()),
            (ty, value) => {
                return Err(Error::TypeMismatch {
                    expected: format!("{:?}", ty),
                    found: value.kind_name().to_string(),
                })
            }
        }
        Ok(())
    }
}

/// Orders map keys: integers numerically, booleans false first, strings
/// bytewise.
fn key_order(a: &Value<'_>, b: &Value<'_>) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::I32(x), Value::I32(y)) => x.cmp(y),
        (Value::U32(x), Value::U32(y)) => x.cmp(y),
        (Value::I64(x), Value::I64(y)) => x.cmp(y),
        (Value::U64(x), Value::U64(y)) => x.cmp(y),
        (Value::Bytes(x), Value::Bytes(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

/// Stable sort by key, keeping only the last entry of each key.
fn sort_dedup_by_key<T>(mut keyed: Vec<(Value<'_>, T)>) -> Vec<T> {
    keyed.sort_by(|(a, _), (b, _)| key_order(a, b));
    let mut out: Vec<T> = Vec::with_capacity(keyed.len());
    let mut iter = keyed.into_iter().peekable();
    while let Some((key, item)) = iter.next() {
        let superseded = iter
            .peek()
            .is_some_and(|(next, _)| key_order(&key, next) == Ordering::Equal);
        if !superseded {
            out.push(item);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{decode, DecodeOptions};
    use crate::mini_table::{FieldSpec, SchemaBuilder, SubRef};
    use crate::ErrorKind;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_presence_rules() {
        let mut b = SchemaBuilder::new();
        let m = b.add_message("t.M");
        b.message_mut(m)
            .add_field(FieldSpec::optional(1, "opt", FieldType::Int32))
            .add_field(FieldSpec::singular(2, "plain", FieldType::Int32))
            .add_field(FieldSpec::singular(3, "s", FieldType::String));
        let schema = b.build().unwrap();
        let ty = schema.message(m);
        let arena = Arena::new();
        let msg = Message::new(ty, &arena).unwrap();
        assert_eq!(encode(msg, &arena, &EncodeOptions::default()).unwrap(), &[] as &[u8]);

        msg.set_i32(ty.field(1).unwrap(), 0);
        msg.set_i32(ty.field(2).unwrap(), 0);
        msg.set_str(ty.field(3).unwrap(), "", &arena).unwrap();
        assert_eq!(encode_to_vec(msg, &EncodeOptions::default()).unwrap(), vec![0x08, 0x00]);

        msg.set_i32(ty.field(2).unwrap(), -1);
        assert_eq!(
            encode_to_vec(msg, &EncodeOptions::default()).unwrap(),
            vec![0x08, 0x00, 0x10, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01]
        );
        let in_arena = encode(msg, &arena, &EncodeOptions::default()).unwrap();
        assert_eq!(in_arena, &encode_to_vec(msg, &EncodeOptions::default()).unwrap()[..]);
    }

    #[test]
    fn test_packed_only_when_declared() {
        let mut b = SchemaBuilder::new();
        let m = b.add_message("t.M");
        b.message_mut(m)
            .add_field(FieldSpec::repeated(1, "p", FieldType::UInt32).packed(true))
            .add_field(FieldSpec::repeated(2, "u", FieldType::UInt32).packed(false))
            .add_field(FieldSpec::repeated(3, "f", FieldType::Fixed32).packed(true));
        let schema = b.build().unwrap();
        let ty = schema.message(m);
        let arena = Arena::new();
        let msg = Message::new(ty, &arena).unwrap();
        for n in 1..=3 {
            let arr = msg.mutable_array(ty.field(n).unwrap(), &arena).unwrap();
            arr.push(Value::U32(1), &arena).unwrap();
            arr.push(Value::U32(300), &arena).unwrap();
        }
        assert_eq!(
            encode_to_vec(msg, &EncodeOptions::default()).unwrap(),
            vec![
                0x0A, 0x03, 0x01, 0xAC, 0x02, // packed varints
                0x10, 0x01, 0x10, 0xAC, 0x02, // one tag per element
                0x1A, 0x08, 1, 0, 0, 0, 0x2C, 0x01, 0, 0,
            ]
        );
    }

    #[test]
    fn test_known_then_extensions_then_unknown() {
        let mut b = SchemaBuilder::new();
        let m = b.add_message("t.M");
        b.message_mut(m)
            .add_field(FieldSpec::optional(1, "a", FieldType::Int32))
            .set_extendable(true);
        let e5 = b.add_extension(m, FieldSpec::optional(5, "e5", FieldType::Int32));
        let e4 = b.add_extension(m, FieldSpec::optional(4, "e4", FieldType::Int32));
        let schema = b.build().unwrap();
        let ty = schema.message(m);
        let arena = Arena::new();
        let msg = Message::new(ty, &arena).unwrap();
        decode(&[0x18, 0x2A, 0x08, 0x07], msg, &arena, &DecodeOptions::default()).unwrap();
        msg.set_extension(e5, Value::I32(5), &arena).unwrap();
        msg.set_extension(e4, Value::I32(0), &arena).unwrap();

        assert_eq!(
            encode_to_vec(msg, &EncodeOptions::default()).unwrap(),
            vec![0x08, 0x07, 0x28, 0x05, 0x20, 0x00, 0x18, 0x2A]
        );
        assert_eq!(
            encode_to_vec(msg, &EncodeOptions::new().deterministic(true).skip_unknown(true)).unwrap(),
            vec![0x08, 0x07, 0x20, 0x00, 0x28, 0x05]
        );
    }

    #[test]
    fn test_deterministic_maps() {
        let mut b = SchemaBuilder::new();
        let m = b.add_message("t.M");
        let entry = b.add_map_entry("t.M.E", FieldType::SInt32, FieldType::String, SubRef::None);
        b.message_mut(m).add_field(FieldSpec::map(1, "m", entry));
        let schema = b.build().unwrap();
        let ty = schema.message(m);
        let arena = Arena::new();
        let msg = Message::new(ty, &arena).unwrap();
        // entries 2:"x", -1:"y", 2:"z"
        let wire = [
            0x0A, 0x05, 0x08, 0x04, 0x12, 0x01, b'x', //
            0x0A, 0x05, 0x08, 0x01, 0x12, 0x01, b'y', //
            0x0A, 0x05, 0x08, 0x04, 0x12, 0x01, b'z',
        ];
        decode(&wire, msg, &arena, &DecodeOptions::default()).unwrap();
        assert_eq!(encode_to_vec(msg, &EncodeOptions::default()).unwrap(), wire.to_vec());
        assert_eq!(
            encode_to_vec(msg, &EncodeOptions::new().deterministic(true)).unwrap(),
            [&wire[7..14], &wire[14..]].concat()
        );
    }

    #[test]
    fn test_map_entries_write_defaults() {
        let mut b = SchemaBuilder::new();
        let m = b.add_message("t.M");
        let entry = b.add_map_entry("t.M.E", FieldType::Int32, FieldType::Int32, SubRef::None);
        b.message_mut(m).add_field(FieldSpec::map(1, "m", entry));
        let schema = b.build().unwrap();
        let ty = schema.message(m);
        let arena = Arena::new();
        let msg = Message::new(ty, &arena).unwrap();
        let map = msg.mutable_map(ty.field(1).unwrap(), &arena).unwrap();
        map.insert(Value::I32(0), Value::I32(0), &arena).unwrap();
        assert_eq!(
            encode_to_vec(msg, &EncodeOptions::default()).unwrap(),
            vec![0x0A, 0x04, 0x08, 0x00, 0x10, 0x00]
        );
    }

    #[test]
    fn test_required_and_depth() {
        let mut b = SchemaBuilder::new();
        let m = b.add_message("t.M");
        b.message_mut(m)
            .add_field(FieldSpec::required(1, "id", FieldType::Int32))
            .add_field(FieldSpec::optional(2, "child", FieldType::Message).message(m));
        let schema = b.build().unwrap();
        let ty = schema.message(m);
        let arena = Arena::new();
        let root = Message::new(ty, &arena).unwrap();
        let err = encode_to_vec(root, &EncodeOptions::new().check_required(true)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequired);
        assert!(encode_to_vec(root, &EncodeOptions::default()).is_ok());

        let mut cur = root;
        for _ in 0..3 {
            cur = cur.mutable_message(ty.field(2).unwrap(), &arena).unwrap();
        }
        assert!(encode_to_vec(root, &EncodeOptions::new().max_depth(3)).is_ok());
        let err = encode_to_vec(root, &EncodeOptions::new().max_depth(2)).unwrap_err();
        assert!(matches!(err, Error::MaxDepthExceeded { limit: 2 }));
    }

    #[test]
    fn test_sort_dedup_keeps_last() {
        let keyed = vec![
            (Value::Bytes(b"b"), 1),
            (Value::Bytes(b"a"), 2),
            (Value::Bytes(b"b"), 3),
            (Value::Bytes(b"ab"), 4),
        ];
        assert_eq!(sort_dedup_by_key(keyed), vec![2, 4, 3]);
    }

    #[test]
    fn test_length_prefixed() {
        let mut b = SchemaBuilder::new();
        let m = b.add_message("t.M");
        b.message_mut(m).add_field(FieldSpec::optional(1, "x", FieldType::Int32));
        let schema = b.build().unwrap();
        let ty = schema.message(m);
        let arena = Arena::new();
        let msg = Message::new(ty, &arena).unwrap();
        msg.set_i32(ty.field(1).unwrap(), 150);
        assert_eq!(
            encode_length_prefixed(msg, &EncodeOptions::default()).unwrap(),
            vec![0x03, 0x08, 0x96, 0x01]
        );
    }

    fn group_message<'a>(schema: &'a Schema, m: crate::MessageIndex, arena: &'a Arena) -> Message<'a> {
        let ty = schema.message(m);
        let msg = Message::new(ty, arena).unwrap();
        let g = msg.mutable_message(ty.field(1).unwrap(), arena).unwrap();
        g.set_i32(g.message_type().field(2).unwrap(), 5);
        msg
    }

    fn group_schema() -> (Schema, crate::MessageIndex) {
        let mut b = SchemaBuilder::new();
        let m = b.add_message("t.M");
        let g = b.add_message("t.M.G");
        b.message_mut(g).add_field(FieldSpec::optional(2, "n", FieldType::Int32));
        b.message_mut(m)
            .add_field(FieldSpec::optional(1, "g", FieldType::Group).message(g));
        (b.build().unwrap(), m)
    }

    #[cfg(feature = "groups")]
    #[test]
    fn test_groups_are_framed_by_tags() {
        let (schema, m) = group_schema();
        let arena = Arena::new();
        let msg = group_message(&schema, m, &arena);
        assert_eq!(
            encode(msg, &arena, &EncodeOptions::default()).unwrap(),
            &[0x0B, 0x10, 0x05, 0x0C]
        );
    }

    #[cfg(not(feature = "groups"))]
    #[test]
    fn test_groups_unsupported() {
        let (schema, m) = group_schema();
        let arena = Arena::new();
        let msg = group_message(&schema, m, &arena);
        assert!(matches!(
            encode_to_vec(msg, &EncodeOptions::default()),
            Err(Error::Unsupported(_))
        ));
    }
}
