//! Wire format decoder.
//!
//! Decoding is a single forward pass driven by the message's
//! [`MiniTable`](crate::MiniTable). Fields the table does not know, and
//! known fields arriving with an incompatible wire type, are kept verbatim
//! in the message's unknown-field buffer. Decoding merges into whatever
//! the message already holds.
//!
//! ```
//! use tkan_core::{decode, Arena, DecodeOptions, FieldSpec, FieldType, Message, SchemaBuilder};
//!
//! let mut builder = SchemaBuilder::new();
//! let m = builder.add_message("M");
//! builder.message_mut(m).add_field(FieldSpec::optional(1, "x", FieldType::Int32));
//! let schema = builder.build()?;
//!
//! let arena = Arena::new();
//! let msg = Message::new(schema.message(m), &arena)?;
//! decode(&[0x08, 0x96, 0x01], msg, &arena, &DecodeOptions::default())?;
//! assert_eq!(msg.get_i32(schema.message(m).field(1).unwrap()), 150);
//! # Ok::<(), tkan_core::Error>(())
//! ```

use std::ptr::NonNull;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::arena::Arena;
use crate::error::{Error, Result};
use crate::extension::ExtensionGuard;
use crate::message::internal::{self, StringView};
use crate::message::{write_elem, Message, Value, DEFAULT_MAX_DEPTH};
use crate::mini_table::{
    ExtensionIndex, FieldMode, FieldType, MessageType, MiniTableField, Presence, Schema,
};
use crate::wire::{self, WireType, MAX_VARINT_LEN};

/// Options controlling [`decode`].
#[derive(Debug, Clone)]
pub struct DecodeOptions {
    /// Let string and bytes fields point into the input instead of copying.
    /// Only honored by [`decode_shared`], which can keep the input alive.
    pub alias_strings: bool,
    /// Fail with [`Error::MissingRequired`] if a required field is unset
    pub check_required: bool,
    /// Maximum submessage nesting below the root message
    pub max_depth: u32,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            alias_strings: false,
            check_required: false,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl DecodeOptions {
    /// Creates the default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets string aliasing
    pub fn alias_strings(mut self, alias: bool) -> Self {
        self.alias_strings = alias;
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

/// Decodes `buf` into `msg`, merging with its current contents.
///
/// `arena` must be the arena `msg` was allocated in or one fused with it.
/// Strings are always copied into `arena`. On failure `msg` keeps
/// whatever was decoded before the error.
pub fn decode<'a>(buf: &[u8], msg: Message<'a>, arena: &'a Arena, options: &DecodeOptions) -> Result<()> {
    run(buf, msg, arena, options, false)
}

/// Decodes a shared buffer into `msg`.
///
/// With [`DecodeOptions::alias_strings`] set, string and bytes fields
/// reference `buf` directly; the arena keeps a handle to it until the
/// arena group is dropped.
pub fn decode_shared<'a>(buf: Bytes, msg: Message<'a>, arena: &'a Arena, options: &DecodeOptions) -> Result<()> {
    if options.alias_strings && !buf.is_empty() {
        let keep = buf.clone();
        arena.register_cleanup(move || drop(keep))?;
        return run(&buf, msg, arena, options, true);
    }
    run(&buf, msg, arena, options, false)
}

/// Decodes one varint-length-prefixed message from the front of `buf`.
///
/// Returns the number of bytes consumed, prefix included.
pub fn decode_length_prefixed<'a>(
    buf: &[u8],
    msg: Message<'a>,
    arena: &'a Arena,
    options: &DecodeOptions,
) -> Result<usize> {
    let (len, n) = wire::decode_varint(buf)?;
    let end = usize::try_from(len)
        .ok()
        .and_then(|len| n.checked_add(len))
        .filter(|&end| end <= buf.len())
        .ok_or_else(|| Error::malformed(n, format!("length prefix {} exceeds the {} remaining bytes", len, buf.len() - n)))?;
    decode(&buf[n..end], msg, arena, options)?;
    Ok(end)
}

fn run<'a>(buf: &[u8], msg: Message<'a>, arena: &'a Arena, options: &DecodeOptions, alias: bool) -> Result<()> {
    msg.check_arena(arena)?;
    debug!(
        message = msg.message_type().name(),
        bytes = buf.len(),
        max_depth = options.max_depth,
        "decoding"
    );
    let mut decoder = Decoder {
        buf,
        arena,
        schema: msg.message_type().schema(),
        alias,
        check_required: options.check_required,
        depth: options.max_depth,
        limit: options.max_depth,
        missing: None,
    };
    decoder.message(msg, 0, buf.len(), 0)?;
    if let Some(name) = decoder.missing {
        return Err(Error::missing_required(name));
    }
    debug!(message = msg.message_type().name(), "decode complete");
    Ok(())
}

/// Where a field's value lives.
#[derive(Clone, Copy)]
enum Target {
    /// A regular field of the message
    Field,
    /// An extension slot, created on first write
    Extension(ExtensionIndex),
}

struct Decoder<'a, 'b> {
    buf: &'b [u8],
    arena: &'a Arena,
    schema: &'a Schema,
    alias: bool,
    check_required: bool,
    /// Remaining submessage levels
    depth: u32,
    limit: u32,
    /// First message found lacking required fields
    missing: Option<&'a str>,
}

impl<'a> Decoder<'a, '_> {
    /// Decodes fields into `msg` until `end`, or until the EndGroup tag of
    /// `group` when it is non-zero. Returns the position after the frame.
    fn message(&mut self, msg: Message<'a>, mut pos: usize, end: usize, group: u32) -> Result<usize> {
        let ty = msg.message_type();
        let table = ty.table();
        while pos < end {
            let tag_start = pos;
            let (tag, n) = wire::decode_tag(&self.buf[pos..end]).map_err(|e| rebase(e, pos))?;
            pos += n;
            let number = tag >> 3;
            let wire_type = WireType::try_from((tag & 7) as u8).map_err(|e| rebase(e, tag_start))?;
            if number == 0 {
                return Err(Error::malformed(tag_start, "field number 0"));
            }
            if wire_type == WireType::EndGroup {
                if group == number {
                    return self.finish(msg, pos);
                }
                return Err(Error::malformed(tag_start, format!("unbalanced end group for field {}", number)));
            }

            let (field, target) = match table.find_field_by_number(number) {
                Some(f) => (Some(f), Target::Field),
                None if table.is_extendable() => match self.schema.find_extension(ty.index(), number) {
                    Some((idx, ext)) => (Some(ext.field()), Target::Extension(idx)),
                    None => (None, Target::Field),
                },
                None => (None, Target::Field),
            };

            pos = match field {
                Some(field) if accepts(field, wire_type) => {
                    if field.field_type() == FieldType::Group && !cfg!(feature = "groups") {
                        return Err(Error::Unsupported(format!(
                            "group field {} of '{}' in a build without group support",
                            number,
                            ty.name()
                        )));
                    }
                    self.field(msg, field, target, wire_type, tag_start, pos, end)?
                }
                _ => self.unknown(msg, number, wire_type, tag_start, pos, end)?,
            };
        }
        if group != 0 {
            return Err(Error::malformed(end, format!("unterminated group for field {}", group)));
        }
        self.finish(msg, pos)
    }

    fn finish(&mut self, msg: Message<'a>, pos: usize) -> Result<usize> {
        if self.check_required && self.missing.is_none() && !msg.has_required() {
            self.missing = Some(msg.message_type().name());
        }
        Ok(pos)
    }

    fn descend(&mut self) -> Result<()> {
        if self.depth == 0 {
            return Err(Error::MaxDepthExceeded { limit: self.limit });
        }
        self.depth -= 1;
        Ok(())
    }

    fn varint(&self, pos: usize, end: usize) -> Result<(u64, usize)> {
        let (v, n) = wire::decode_varint(&self.buf[pos..end]).map_err(|e| rebase(e, pos))?;
        Ok((v, pos + n))
    }

    fn fixed<const N: usize>(&self, pos: usize, end: usize) -> Result<([u8; N], usize)> {
        self.buf
            .get(pos..pos + N)
            .filter(|_| pos + N <= end)
            .and_then(|s| <[u8; N]>::try_from(s).ok())
            .map(|b| (b, pos + N))
            .ok_or_else(|| Error::malformed(pos, format!("truncated {}-byte fixed value", N)))
    }

    /// Reads a length prefix and returns the payload range.
    fn delimited(&self, pos: usize, end: usize) -> Result<(usize, usize)> {
        let (len, start) = self.varint(pos, end)?;
        if len > i32::MAX as u64 {
            return Err(Error::malformed(pos, "negative length"));
        }
        let stop = start + len as usize;
        if stop > end {
            return Err(Error::malformed(
                pos,
                format!("length {} exceeds the {} remaining bytes", len, end - start),
            ));
        }
        Ok((start, stop))
    }

    /// Reads one non-delimited scalar of type `ty`.
    fn scalar(&self, ty: FieldType, pos: usize, end: usize) -> Result<(Value<'static>, usize)> {
        use FieldType::*;
        Ok(match ty {
            Double => {
                let (b, next) = self.fixed::<8>(pos, end)?;
                (Value::F64(f64::from_le_bytes(b)), next)
            }
            Float => {
                let (b, next) = self.fixed::<4>(pos, end)?;
                (Value::F32(f32::from_le_bytes(b)), next)
            }
            Fixed64 => {
                let (b, next) = self.fixed::<8>(pos, end)?;
                (Value::U64(u64::from_le_bytes(b)), next)
            }
            SFixed64 => {
                let (b, next) = self.fixed::<8>(pos, end)?;
                (Value::I64(i64::from_le_bytes(b)), next)
            }
            Fixed32 => {
                let (b, next) = self.fixed::<4>(pos, end)?;
                (Value::U32(u32::from_le_bytes(b)), next)
            }
            SFixed32 => {
                let (b, next) = self.fixed::<4>(pos, end)?;
                (Value::I32(i32::from_le_bytes(b)), next)
            }
            Int64 | UInt64 | Int32 | UInt32 | Bool | Enum | SInt32 | SInt64 => {
                let (v, next) = self.varint(pos, end)?;
                let value = match ty {
                    Int64 => Value::I64(v as i64),
                    UInt64 => Value::U64(v),
                    Int32 | Enum => Value::I32(v as i32),
                    UInt32 => Value::U32(v as u32),
                    Bool => Value::Bool(v != 0),
                    SInt32 => Value::I32(wire::zigzag_decode32(v as u32)),
                    _ => Value::I64(wire::zigzag_decode64(v)),
                };
                (value, next)
            }
            String | Bytes | Message | Group => {
                return Err(Error::malformed(pos, format!("{:?} is not a scalar type", ty)));
            }
        })
    }

    fn enum_accepts(&self, field: &MiniTableField, value: &Value<'_>) -> bool {
        match (field.enum_index().and_then(|i| self.schema.enum_table(i)), value) {
            (Some(e), Value::I32(v)) if e.is_closed() => e.check_value(*v),
            _ => true,
        }
    }

    /// Storage base for `field`: the message itself, or the extension slot.
    /// Extension slots come with the guard that must outlive the write.
    fn base(&self, msg: Message<'a>, target: Target) -> Result<(NonNull<u8>, Option<ExtensionGuard>)> {
        match target {
            Target::Field => Ok((msg.as_non_null(), None)),
            Target::Extension(idx) => {
                let guard = ExtensionGuard::lock(&msg);
                // SAFETY: live object of a table that declares the extension.
                let slot = unsafe { internal::get_or_create_extension(msg.as_non_null(), idx, self.arena)? };
                Ok((slot, Some(guard)))
            }
        }
    }

    fn sub_type(&self, field: &MiniTableField) -> Result<MessageType<'a>> {
        field
            .message_index()
            .map(|idx| self.schema.message(idx))
            .ok_or_else(|| Error::schema(format!("field {} has no message type", field.number())))
    }

    fn store_bytes(&self, field: &MiniTableField, start: usize, stop: usize) -> Result<StringView> {
        let data = &self.buf[start..stop];
        if field.field_type() == FieldType::String && std::str::from_utf8(data).is_err() {
            return Err(Error::BadUtf8 {
                field: field.number(),
                offset: start,
            });
        }
        if data.is_empty() {
            return Ok(StringView::EMPTY);
        }
        let stored = if self.alias {
            data
        } else {
            self.arena.alloc_bytes(data)?
        };
        Ok(StringView {
            ptr: stored.as_ptr(),
            len: stored.len(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn field(
        &mut self,
        msg: Message<'a>,
        field: &'a MiniTableField,
        target: Target,
        wire_type: WireType,
        tag_start: usize,
        pos: usize,
        end: usize,
    ) -> Result<usize> {
        match field.mode() {
            FieldMode::Scalar => self.singular(msg, field, target, tag_start, pos, end),
            FieldMode::Array if wire_type == WireType::Len && field.field_type().is_packable() => {
                self.packed(msg, field, target, pos, end)
            }
            FieldMode::Array => self.repeated(msg, field, target, tag_start, pos, end),
            FieldMode::Map => self.map_entry(msg, field, tag_start, pos, end),
        }
    }

    fn singular(
        &mut self,
        msg: Message<'a>,
        field: &'a MiniTableField,
        target: Target,
        tag_start: usize,
        pos: usize,
        end: usize,
    ) -> Result<usize> {
        let ty = field.field_type();
        match ty {
            FieldType::Message | FieldType::Group => {
                let sub = self.sub_type(field)?;
                let (base, guard) = self.base(msg, target)?;
                // SAFETY: base holds a pointer slot at the field's offset.
                let child = unsafe {
                    let p = internal::slot::<*mut u8>(base, field.offset());
                    let current = match field.presence() {
                        Presence::Oneof { case_offset, .. }
                            if internal::oneof_case(base, case_offset) != field.number() =>
                        {
                            None
                        }
                        _ => NonNull::new(p.read()),
                    };
                    let child = match current {
                        Some(ptr) => Message::from_raw(ptr, sub),
                        None => {
                            let fresh = Message::new(sub, self.arena)?;
                            p.write(fresh.as_ptr());
                            fresh
                        }
                    };
                    internal::mark_present(base, field);
                    child
                };
                drop(guard);
                self.submessage(child, field, pos, end)
            }
            FieldType::String | FieldType::Bytes => {
                let (start, stop) = self.delimited(pos, end)?;
                let view = self.store_bytes(field, start, stop)?;
                let (base, _guard) = self.base(msg, target)?;
                // SAFETY: base holds a string view slot at the field's offset.
                unsafe {
                    internal::slot::<StringView>(base, field.offset()).write(view);
                    internal::mark_present(base, field);
                }
                Ok(stop)
            }
            _ => {
                let (value, next) = self.scalar(ty, pos, end)?;
                if !self.enum_accepts(field, &value) {
                    self.keep_unknown(msg, tag_start, next)?;
                    return Ok(next);
                }
                let (base, _guard) = self.base(msg, target)?;
                // SAFETY: the slot has the field's scalar representation.
                unsafe {
                    write_elem(internal::slot::<u8>(base, field.offset()), value);
                    internal::mark_present(base, field);
                }
                Ok(next)
            }
        }
    }

    /// Decodes a submessage payload: a delimited body for messages, a
    /// group frame for groups.
    fn submessage(&mut self, child: Message<'a>, field: &MiniTableField, pos: usize, end: usize) -> Result<usize> {
        self.descend()?;
        let next = if field.field_type() == FieldType::Group {
            self.message(child, pos, end, field.number())?
        } else {
            let (start, stop) = self.delimited(pos, end)?;
            self.message(child, start, stop, 0)?;
            stop
        };
        self.depth += 1;
        Ok(next)
    }

    fn repeated(
        &mut self,
        msg: Message<'a>,
        field: &'a MiniTableField,
        target: Target,
        tag_start: usize,
        pos: usize,
        end: usize,
    ) -> Result<usize> {
        let ty = field.field_type();
        let rep = ty.rep();
        match ty {
            FieldType::Message | FieldType::Group => {
                let sub = self.sub_type(field)?;
                let child = Message::new(sub, self.arena)?;
                {
                    let (base, _guard) = self.base(msg, target)?;
                    // SAFETY: repeated slot of `field`; elements are pointers.
                    unsafe {
                        let hdr = internal::array_slot(base, field, self.arena)?;
                        internal::array_push(hdr, rep, self.arena)?.cast::<*mut u8>().write(child.as_ptr());
                    }
                }
                self.submessage(child, field, pos, end)
            }
            FieldType::String | FieldType::Bytes => {
                let (start, stop) = self.delimited(pos, end)?;
                let view = self.store_bytes(field, start, stop)?;
                let (base, _guard) = self.base(msg, target)?;
                // SAFETY: repeated slot of `field`; elements are string views.
                unsafe {
                    let hdr = internal::array_slot(base, field, self.arena)?;
                    internal::array_push(hdr, rep, self.arena)?.cast::<StringView>().write(view);
                }
                Ok(stop)
            }
            _ => {
                let (value, next) = self.scalar(ty, pos, end)?;
                if !self.enum_accepts(field, &value) {
                    self.keep_unknown(msg, tag_start, next)?;
                    return Ok(next);
                }
                let (base, _guard) = self.base(msg, target)?;
                // SAFETY: repeated slot of `field`.
                unsafe {
                    let hdr = internal::array_slot(base, field, self.arena)?;
                    write_elem(internal::array_push(hdr, rep, self.arena)?, value);
                }
                Ok(next)
            }
        }
    }

    fn packed(&mut self, msg: Message<'a>, field: &'a MiniTableField, target: Target, pos: usize, end: usize) -> Result<usize> {
        let ty = field.field_type();
        let rep = ty.rep();
        let (mut at, stop) = self.delimited(pos, end)?;
        if let Some(width) = ty.fixed_width() {
            if (stop - at) % width != 0 {
                return Err(Error::malformed(
                    at,
                    format!("packed length {} is not a multiple of {}", stop - at, width),
                ));
            }
        }
        if at == stop {
            return Ok(stop);
        }
        let (base, _guard) = self.base(msg, target)?;
        // SAFETY: repeated slot of `field`.
        let hdr = unsafe { internal::array_slot(base, field, self.arena)? };
        if let Some(width) = ty.fixed_width() {
            // SAFETY: live header.
            unsafe { internal::array_reserve(hdr, rep, (stop - at) / width, self.arena)? };
        }
        let mut rejected = Vec::new();
        while at < stop {
            let (value, next) = self.scalar(ty, at, stop)?;
            if self.enum_accepts(field, &value) {
                // SAFETY: the element slot has the field's representation.
                unsafe { write_elem(internal::array_push(hdr, rep, self.arena)?, value) };
            } else if let Value::I32(v) = value {
                let mut scratch = [0u8; MAX_VARINT_LEN];
                let tag = wire::make_tag(field.number(), WireType::Varint);
                let n = wire::encode_varint(u64::from(tag), &mut scratch);
                rejected.extend_from_slice(&scratch[..n]);
                let n = wire::encode_varint(i64::from(v) as u64, &mut scratch);
                rejected.extend_from_slice(&scratch[..n]);
            }
            at = next;
        }
        if !rejected.is_empty() {
            self.append_unknown(msg, &rejected)?;
        }
        Ok(stop)
    }

    fn map_entry(&mut self, msg: Message<'a>, field: &'a MiniTableField, tag_start: usize, pos: usize, end: usize) -> Result<usize> {
        let entry_type = self.sub_type(field)?;
        let entry = Message::new(entry_type, self.arena)?;
        if let Some(value) = entry_type.table().map_value() {
            if value.field_type().is_submessage() {
                entry.mutable_message(value, self.arena)?;
            }
        }
        let stop = self.submessage(entry, field, pos, end)?;
        if !entry.unknown_fields().is_empty() {
            trace!(field = field.number(), "map entry with unknown data kept as unknown field");
            self.keep_unknown(msg, tag_start, stop)?;
            return Ok(stop);
        }
        // SAFETY: map slot of `field`; entries are pointers.
        unsafe {
            let hdr = internal::array_slot(msg.as_non_null(), field, self.arena)?;
            internal::array_push(hdr, field.field_type().rep(), self.arena)?
                .cast::<*mut u8>()
                .write(entry.as_ptr());
        }
        Ok(stop)
    }

    /// Skips one field payload and keeps the whole record as unknown data.
    fn unknown(
        &mut self,
        msg: Message<'a>,
        number: u32,
        wire_type: WireType,
        tag_start: usize,
        pos: usize,
        end: usize,
    ) -> Result<usize> {
        let next = self.skip(number, wire_type, pos, end)?;
        trace!(field = number, len = next - tag_start, "captured unknown field");
        self.keep_unknown(msg, tag_start, next)?;
        Ok(next)
    }

    fn skip(&mut self, number: u32, wire_type: WireType, pos: usize, end: usize) -> Result<usize> {
        match wire_type {
            WireType::Varint => self.varint(pos, end).map(|(_, next)| next),
            WireType::I64 => self.fixed::<8>(pos, end).map(|(_, next)| next),
            WireType::I32 => self.fixed::<4>(pos, end).map(|(_, next)| next),
            WireType::Len => self.delimited(pos, end).map(|(_, stop)| stop),
            WireType::StartGroup => {
                self.descend()?;
                let next = self.skip_group(number, pos, end)?;
                self.depth += 1;
                Ok(next)
            }
            WireType::EndGroup => Err(Error::malformed(pos, "unexpected end group")),
        }
    }

    fn skip_group(&mut self, number: u32, mut pos: usize, end: usize) -> Result<usize> {
        while pos < end {
            let tag_start = pos;
            let (tag, n) = wire::decode_tag(&self.buf[pos..end]).map_err(|e| rebase(e, pos))?;
            pos += n;
            let inner = tag >> 3;
            let wire_type = WireType::try_from((tag & 7) as u8).map_err(|e| rebase(e, tag_start))?;
            if inner == 0 {
                return Err(Error::malformed(tag_start, "field number 0"));
            }
            if wire_type == WireType::EndGroup {
                if inner == number {
                    return Ok(pos);
                }
                return Err(Error::malformed(tag_start, format!("unbalanced end group for field {}", inner)));
            }
            pos = self.skip(inner, wire_type, pos, end)?;
        }
        Err(Error::malformed(end, format!("unterminated group for field {}", number)))
    }

    fn keep_unknown(&self, msg: Message<'a>, start: usize, stop: usize) -> Result<()> {
        self.append_unknown(msg, &self.buf[start..stop])
    }

    fn append_unknown(&self, msg: Message<'a>, data: &[u8]) -> Result<()> {
        // SAFETY: the decoder's arena is fused with the message's.
        unsafe { internal::append_unknown(msg.as_non_null(), self.arena, data) }
    }
}

/// Whether a field record can take a value of `wire_type`.
fn accepts(field: &MiniTableField, wire_type: WireType) -> bool {
    let ty = field.field_type();
    let expected = ty.wire_type();
    match field.mode() {
        FieldMode::Scalar => wire_type == expected,
        FieldMode::Array => wire_type == expected || (ty.is_packable() && wire_type == WireType::Len),
        FieldMode::Map => wire_type == WireType::Len,
    }
}

/// Shifts the offset of a wire error found in a sub-slice starting at `base`.
fn rebase(err: Error, base: usize) -> Error {
    match err {
        Error::Malformed { offset, details } => Error::Malformed {
            offset: offset + base,
            details,
        },
        other => other,
    }
}
