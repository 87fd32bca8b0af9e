//! Dynamically typed field values.

use std::ptr::NonNull;

use super::internal::{self, StringView};
use super::Message;
use crate::arena::Arena;
use crate::error::{Error, Result};
use crate::mini_table::{DefaultValue, FieldType, MessageType, MiniTableField};

/// The value of one singular field or one repeated element.
///
/// Strings and bytes are borrowed from the arena; enums are carried as
/// `I32`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value<'a> {
    /// `bool`
    Bool(bool),
    /// `int32`, `sint32`, `sfixed32` and enums
    I32(i32),
    /// `uint32`, `fixed32`
    U32(u32),
    /// `int64`, `sint64`, `sfixed64`
    I64(i64),
    /// `uint64`, `fixed64`
    U64(u64),
    /// `float`
    F32(f32),
    /// `double`
    F64(f64),
    /// `string` or `bytes`
    Bytes(&'a [u8]),
    /// Message or group
    Message(Message<'a>),
}

impl<'a> Value<'a> {
    /// Short name of the variant, for diagnostics
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::I32(_) => "i32",
            Value::U32(_) => "u32",
            Value::I64(_) => "i64",
            Value::U64(_) => "u64",
            Value::F32(_) => "f32",
            Value::F64(_) => "f64",
            Value::Bytes(_) => "bytes",
            Value::Message(_) => "message",
        }
    }

    /// The `bool`, if this is one
    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Value::Bool(v) => Some(v),
            _ => None,
        }
    }

    /// The `i32`, if this is one
    pub fn as_i32(&self) -> Option<i32> {
        match *self {
            Value::I32(v) => Some(v),
            _ => None,
        }
    }

    /// The `u32`, if this is one
    pub fn as_u32(&self) -> Option<u32> {
        match *self {
            Value::U32(v) => Some(v),
            _ => None,
        }
    }

    /// The `i64`, if this is one
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::I64(v) => Some(v),
            _ => None,
        }
    }

    /// The `u64`, if this is one
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Value::U64(v) => Some(v),
            _ => None,
        }
    }

    /// The `f32`, if this is one
    pub fn as_f32(&self) -> Option<f32> {
        match *self {
            Value::F32(v) => Some(v),
            _ => None,
        }
    }

    /// The `f64`, if this is one
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::F64(v) => Some(v),
            _ => None,
        }
    }

    /// The byte payload, if this is a string or bytes value
    pub fn as_bytes(&self) -> Option<&'a [u8]> {
        match *self {
            Value::Bytes(v) => Some(v),
            _ => None,
        }
    }

    /// The payload as UTF-8, if it is a valid string
    pub fn as_str(&self) -> Option<&'a str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    /// The message, if this is one
    pub fn as_message(&self) -> Option<Message<'a>> {
        match *self {
            Value::Message(m) => Some(m),
            _ => None,
        }
    }

    /// Whether the variant can be stored in a field of type `ty`.
    pub fn fits(&self, ty: FieldType) -> bool {
        use FieldType::*;
        matches!(
            (self, ty),
            (Value::Bool(_), Bool)
                | (Value::I32(_), Int32 | SInt32 | SFixed32 | Enum)
                | (Value::U32(_), UInt32 | Fixed32)
                | (Value::I64(_), Int64 | SInt64 | SFixed64)
                | (Value::U64(_), UInt64 | Fixed64)
                | (Value::F32(_), Float)
                | (Value::F64(_), Double)
                | (Value::Bytes(_), String | Bytes)
                | (Value::Message(_), Message | Group)
        )
    }
}

/// Zero value of a non-message type.
pub(crate) fn zero_of(ty: FieldType) -> Value<'static> {
    use FieldType::*;
    match ty {
        Bool => Value::Bool(false),
        Int32 | SInt32 | SFixed32 | Enum => Value::I32(0),
        UInt32 | Fixed32 => Value::U32(0),
        Int64 | SInt64 | SFixed64 => Value::I64(0),
        UInt64 | Fixed64 => Value::U64(0),
        Float => Value::F32(0.0),
        Double => Value::F64(0.0),
        String | Bytes | Message | Group => Value::Bytes(&[]),
    }
}

/// Value an unset field reports.
pub(crate) fn default_of(field: &MiniTableField) -> Value<'_> {
    match &field.default {
        DefaultValue::Zero => zero_of(field.field_type),
        DefaultValue::Bool(v) => Value::Bool(*v),
        DefaultValue::Int32(v) => Value::I32(*v),
        DefaultValue::Int64(v) => Value::I64(*v),
        DefaultValue::UInt32(v) => Value::U32(*v),
        DefaultValue::UInt64(v) => Value::U64(*v),
        DefaultValue::Float(v) => Value::F32(*v),
        DefaultValue::Double(v) => Value::F64(*v),
        DefaultValue::Bytes(v) => Value::Bytes(v),
    }
}

/// Reads one stored value. Returns `None` for a null message pointer.
///
/// # Safety
///
/// `p` must point at a slot of `ty`'s representation inside the arena
/// group `'a` borrows, and `sub` must describe message pointees.
pub(crate) unsafe fn read_elem<'a>(
    p: *const u8,
    ty: FieldType,
    sub: Option<MessageType<'a>>,
) -> Option<Value<'a>> {
    use FieldType::*;
    // SAFETY: forwarded caller contract.
    unsafe {
        Some(match ty {
            Bool => Value::Bool(p.read() != 0),
            Int32 | SInt32 | SFixed32 | Enum => Value::I32(p.cast::<i32>().read()),
            UInt32 | Fixed32 => Value::U32(p.cast::<u32>().read()),
            Int64 | SInt64 | SFixed64 => Value::I64(p.cast::<i64>().read()),
            UInt64 | Fixed64 => Value::U64(p.cast::<u64>().read()),
            Float => Value::F32(p.cast::<f32>().read()),
            Double => Value::F64(p.cast::<f64>().read()),
            String | Bytes => Value::Bytes(p.cast::<StringView>().read().as_slice()),
            Message | Group => {
                let ptr = NonNull::new(p.cast::<*mut u8>().read())?;
                Value::Message(super::Message::from_raw(ptr, sub?))
            }
        })
    }
}

/// Stores a value produced by [`prepare`].
///
/// # Safety
///
/// `p` must point at a writable slot of `ty`'s representation.
pub(crate) unsafe fn write_elem(p: *mut u8, value: Value<'_>) {
    // SAFETY: forwarded caller contract.
    unsafe {
        match value {
            Value::Bool(v) => p.write(u8::from(v)),
            Value::I32(v) => p.cast::<i32>().write(v),
            Value::U32(v) => p.cast::<u32>().write(v),
            Value::I64(v) => p.cast::<i64>().write(v),
            Value::U64(v) => p.cast::<u64>().write(v),
            Value::F32(v) => p.cast::<f32>().write(v),
            Value::F64(v) => p.cast::<f64>().write(v),
            Value::Bytes(v) => p.cast::<StringView>().write(StringView {
                ptr: v.as_ptr(),
                len: v.len(),
            }),
            Value::Message(m) => p.cast::<*mut u8>().write(m.as_ptr()),
        }
    }
}

/// Checks `value` against a field and moves its payload into `arena`.
///
/// Byte payloads are copied; messages must have the field's type and live
/// in `arena`'s group.
pub(crate) fn prepare<'a>(
    field: &MiniTableField,
    sub: Option<MessageType<'a>>,
    value: Value<'_>,
    arena: &'a Arena,
) -> Result<Value<'a>> {
    if !value.fits(field.field_type) {
        return Err(Error::TypeMismatch {
            expected: format!("{:?}", field.field_type),
            found: value.kind_name().to_string(),
        });
    }
    Ok(match value {
        Value::Bool(v) => Value::Bool(v),
        Value::I32(v) => Value::I32(v),
        Value::U32(v) => Value::U32(v),
        Value::I64(v) => Value::I64(v),
        Value::U64(v) => Value::U64(v),
        Value::F32(v) => Value::F32(v),
        Value::F64(v) => Value::F64(v),
        Value::Bytes(v) => {
            if field.field_type == FieldType::String && std::str::from_utf8(v).is_err() {
                return Err(Error::BadUtf8 {
                    field: field.number,
                    offset: 0,
                });
            }
            Value::Bytes(arena.alloc_bytes(v)?)
        }
        Value::Message(m) => {
            let expected = sub.ok_or_else(|| Error::schema("message field without a message type"))?;
            if m.message_type() != expected {
                return Err(Error::TypeMismatch {
                    expected: expected.name().to_string(),
                    found: m.message_type().name().to_string(),
                });
            }
            // SAFETY: m is alive, so its owner node is too.
            if !arena.is_fused_with_node(unsafe { internal::owner(m.as_non_null()) }) {
                return Err(Error::ArenaMismatch);
            }
            // SAFETY: the object lives in `arena`'s group, which outlives 'a.
            Value::Message(unsafe { Message::from_raw(m.as_non_null(), expected) })
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fits() {
        assert!(Value::I32(1).fits(FieldType::Enum));
        assert!(Value::I32(1).fits(FieldType::SFixed32));
        assert!(!Value::I32(1).fits(FieldType::Int64));
        assert!(Value::Bytes(b"x").fits(FieldType::String));
        assert!(!Value::Bool(true).fits(FieldType::UInt32));
    }

    #[test]
    fn test_accessors() {
        assert_eq!(Value::U64(7).as_u64(), Some(7));
        assert_eq!(Value::U64(7).as_i64(), None);
        assert_eq!(Value::Bytes(b"hi").as_str(), Some("hi"));
        assert_eq!(Value::Bytes(&[0xFF]).as_str(), None);
        assert_eq!(Value::F64(1.5).kind_name(), "f64");
    }

    #[test]
    fn test_slot_roundtrip() {
        let mut slot = [0u64; 2];
        let p = slot.as_mut_ptr().cast::<u8>();
        // SAFETY: the slot is sixteen aligned bytes, enough for any element.
        unsafe {
            write_elem(p, Value::I64(-5));
            assert_eq!(read_elem(p, FieldType::SInt64, None), Some(Value::I64(-5)));
            write_elem(p, Value::Bool(true));
            assert_eq!(read_elem(p, FieldType::Bool, None), Some(Value::Bool(true)));
            write_elem(p, Value::Bytes(b"abc"));
            assert_eq!(read_elem(p, FieldType::Bytes, None), Some(Value::Bytes(b"abc")));
        }
    }
}
