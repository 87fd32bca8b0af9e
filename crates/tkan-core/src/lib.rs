//! # tkan-core
//!
//! An arena-backed protocol buffers runtime driven by compact layout tables.
//!
//! This crate provides the core functionality for:
//! - Allocating message objects in fusable bump arenas
//! - Describing message layouts with mini tables, built by hand or from a
//!   compiled `FileDescriptorSet`
//! - Decoding and encoding the protobuf wire format against those tables,
//!   including unknown fields and extensions
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`arena`]: Region allocator with fuse and cleanup support
//! - [`mini_table`]: Field layout tables and the schema builder
//! - [`message`]: Message objects, repeated fields and maps
//! - [`decode`] / [`encode`]: Wire format conversion
//! - [`extension`]: Extension storage and the process-wide extension locker
//! - [`wire`]: Varint, tag and zigzag primitives
//! - [`error`]: Error types and handling
//!
//! ## Example
//!
//! ```
//! use tkan_core::{
//!     decode, encode_to_vec, Arena, DecodeOptions, EncodeOptions, FieldSpec, FieldType, Message,
//!     SchemaBuilder, Value,
//! };
//!
//! let mut builder = SchemaBuilder::new();
//! let person = builder.add_message("demo.Person");
//! builder
//!     .message_mut(person)
//!     .add_field(FieldSpec::optional(1, "id", FieldType::Int32))
//!     .add_field(FieldSpec::optional(2, "name", FieldType::String));
//! let schema = builder.build()?;
//! let ty = schema.message(person);
//!
//! let arena = Arena::new();
//! let msg = Message::new(ty, &arena)?;
//! decode(&[0x08, 0x96, 0x01], msg, &arena, &DecodeOptions::default())?;
//! assert_eq!(msg.get(ty.field(1).unwrap()), Some(Value::I32(150)));
//!
//! msg.set_str(ty.field(2).unwrap(), "ada", &arena)?;
//! let bytes = encode_to_vec(msg, &EncodeOptions::default())?;
//! assert_eq!(bytes, [0x08, 0x96, 0x01, 0x12, 0x03, b'a', b'd', b'a']);
//! # Ok::<(), tkan_core::Error>(())
//! ```
//!
//! ## Features
//!
//! - `groups` (default): decode and encode proto2 group fields. Without it,
//!   known group fields fail with [`Error::Unsupported`] while unknown
//!   groups are still preserved.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, rust_2018_idioms, unreachable_pub)]

pub mod arena;
pub mod decode;
pub mod encode;
pub mod error;
pub mod extension;
pub mod message;
pub mod mini_table;
pub mod wire;

// Re-export primary types for convenience
pub use arena::{Arena, ArenaConfig, BlockAlloc, HostAlloc, LimitedAlloc};
pub use decode::{decode, decode_length_prefixed, decode_shared, DecodeOptions};
pub use encode::{encode, encode_length_prefixed, encode_to_vec, EncodeOptions};
pub use error::{Error, ErrorKind, Result};
pub use extension::{set_extension_locker, ExtensionLocker, ExtensionUnlocker};
pub use message::{Array, ArrayIter, Map, Message, MessageId, Value, DEFAULT_MAX_DEPTH};
pub use mini_table::{
    Cardinality, DefaultValue, EnumIndex, ExtensionIndex, FieldMode, FieldRep, FieldSpec, FieldType,
    MessageIndex, MessageSpec, MessageType, MiniEnum, MiniTable, MiniTableExtension, MiniTableField,
    OneofTable, Presence, Schema, SchemaBuilder, SubRef,
};

/// Crate version for programmatic access
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
