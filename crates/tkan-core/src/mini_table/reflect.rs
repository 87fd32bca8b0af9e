//! Building schemas from compiled descriptors.
//!
//! Descriptor sets are linked and validated by `prost-reflect`; every
//! message, enum and extension in the resulting pool is then declared with a
//! [`SchemaBuilder`].

use std::collections::HashMap;

use bytes::Bytes;
use prost::Message as _;
use prost_reflect::{
    Cardinality as DeclaredCardinality, DescriptorPool, ExtensionDescriptor, FieldDescriptor, Kind, MessageDescriptor,
    Syntax, Value,
};
use prost_types::FileDescriptorSet;
use tracing::debug;

use super::{Cardinality, DefaultValue, EnumIndex, FieldSpec, FieldType, MessageIndex, Schema, SchemaBuilder};
use crate::error::{Error, Result};

impl Schema {
    /// Builds a schema from a serialized `FileDescriptorSet`, as written by
    /// `protoc --descriptor_set_out`.
    pub fn from_file_descriptor_set(bytes: &[u8]) -> Result<Schema> {
        let set = FileDescriptorSet::decode(bytes)?;
        let pool = DescriptorPool::from_file_descriptor_set(set)
            .map_err(|e| Error::descriptor_build(format!("failed to link descriptor set: {}", e)))?;
        Self::from_descriptor_pool(&pool)
    }

    /// Builds a schema with a table for every message in `pool`.
    pub fn from_descriptor_pool(pool: &DescriptorPool) -> Result<Schema> {
        let schema = Loader::default().load(pool)?;
        debug!(
            files = pool.files().len(),
            messages = schema.message_count(),
            "loaded schema from descriptors"
        );
        Ok(schema)
    }
}

/// What the loader needs from a field or an extension descriptor.
struct FieldShape {
    number: u32,
    name: String,
    kind: Kind,
    group: bool,
    packed: bool,
    cardinality: Cardinality,
    default: Value,
}

impl FieldShape {
    fn of_field(field: &FieldDescriptor, map_entry: bool) -> Self {
        let cardinality = match field.cardinality() {
            DeclaredCardinality::Repeated => Cardinality::Repeated,
            DeclaredCardinality::Required => Cardinality::Required,
            // entry keys and values never track presence
            DeclaredCardinality::Optional if map_entry => Cardinality::Singular,
            DeclaredCardinality::Optional if field.supports_presence() => Cardinality::Optional,
            DeclaredCardinality::Optional => Cardinality::Singular,
        };
        FieldShape {
            number: field.number(),
            name: field.name().to_string(),
            kind: field.kind(),
            group: field.is_group(),
            packed: field.is_packed(),
            cardinality,
            default: Value::default_value_for_field(field),
        }
    }

    fn of_extension(ext: &ExtensionDescriptor) -> Self {
        let cardinality = match ext.cardinality() {
            DeclaredCardinality::Repeated => Cardinality::Repeated,
            _ => Cardinality::Optional,
        };
        FieldShape {
            number: ext.number(),
            name: ext.full_name().to_string(),
            kind: ext.kind(),
            group: ext.is_group(),
            packed: ext.is_packed(),
            cardinality,
            default: Value::default_value_for_extension(ext),
        }
    }

    fn field_type(&self) -> FieldType {
        match &self.kind {
            Kind::Double => FieldType::Double,
            Kind::Float => FieldType::Float,
            Kind::Int32 => FieldType::Int32,
            Kind::Int64 => FieldType::Int64,
            Kind::Uint32 => FieldType::UInt32,
            Kind::Uint64 => FieldType::UInt64,
            Kind::Sint32 => FieldType::SInt32,
            Kind::Sint64 => FieldType::SInt64,
            Kind::Fixed32 => FieldType::Fixed32,
            Kind::Fixed64 => FieldType::Fixed64,
            Kind::Sfixed32 => FieldType::SFixed32,
            Kind::Sfixed64 => FieldType::SFixed64,
            Kind::Bool => FieldType::Bool,
            Kind::String => FieldType::String,
            Kind::Bytes => FieldType::Bytes,
            Kind::Message(_) if self.group => FieldType::Group,
            Kind::Message(_) => FieldType::Message,
            Kind::Enum(_) => FieldType::Enum,
        }
    }

    /// The declared default, or `None` when it is the type's zero.
    fn default(&self) -> Option<DefaultValue> {
        let value = match &self.default {
            Value::Bool(v) => DefaultValue::Bool(*v),
            Value::I32(v) | Value::EnumNumber(v) => DefaultValue::Int32(*v),
            Value::I64(v) => DefaultValue::Int64(*v),
            Value::U32(v) => DefaultValue::UInt32(*v),
            Value::U64(v) => DefaultValue::UInt64(*v),
            Value::F32(v) => DefaultValue::Float(*v),
            Value::F64(v) => DefaultValue::Double(*v),
            Value::String(s) => DefaultValue::Bytes(Bytes::from(s.clone())),
            Value::Bytes(b) => DefaultValue::Bytes(b.clone()),
            Value::Message(_) | Value::List(_) | Value::Map(_) => return None,
        };
        let zero = match &value {
            DefaultValue::Bool(v) => !v,
            DefaultValue::Int32(v) => *v == 0,
            DefaultValue::Int64(v) => *v == 0,
            DefaultValue::UInt32(v) => *v == 0,
            DefaultValue::UInt64(v) => *v == 0,
            DefaultValue::Float(v) => v.to_bits() == 0,
            DefaultValue::Double(v) => v.to_bits() == 0,
            DefaultValue::Bytes(b) => b.is_empty(),
            DefaultValue::Zero => true,
        };
        (!zero).then_some(value)
    }
}

#[derive(Default)]
struct Loader {
    builder: SchemaBuilder,
    messages: HashMap<String, MessageIndex>,
    enums: HashMap<String, EnumIndex>,
}

impl Loader {
    fn load(mut self, pool: &DescriptorPool) -> Result<Schema> {
        let mut declared = Vec::new();
        for message in pool.all_messages() {
            let index = self.builder.add_message(message.full_name());
            self.builder
                .message_mut(index)
                .set_extendable(message.extension_ranges().next().is_some())
                .set_map_entry(message.is_map_entry());
            self.messages.insert(message.full_name().to_string(), index);
            declared.push((index, message));
        }
        for e in pool.all_enums() {
            let closed = e.parent_file().syntax() == Syntax::Proto2;
            let index = self.builder.add_enum(e.full_name(), e.values().map(|v| v.number()), closed);
            self.enums.insert(e.full_name().to_string(), index);
        }

        for (index, message) in &declared {
            self.define_message(*index, message)?;
        }

        for ext in pool.all_extensions() {
            let extendee = self.resolve_message(&ext.containing_message())?;
            let spec = self.field_spec(&FieldShape::of_extension(&ext), ext.is_map())?;
            self.builder.add_extension(extendee, spec);
        }

        self.builder.build()
    }

    fn resolve_message(&self, message: &MessageDescriptor) -> Result<MessageIndex> {
        self.messages
            .get(message.full_name())
            .copied()
            .ok_or_else(|| Error::descriptor_build(format!("unresolved message type '{}'", message.full_name())))
    }

    fn define_message(&mut self, index: MessageIndex, message: &MessageDescriptor) -> Result<()> {
        let map_entry = message.is_map_entry();
        let mut oneofs: HashMap<String, usize> = HashMap::new();
        let mut specs = Vec::new();
        for field in message.fields() {
            let mut spec = self.field_spec(&FieldShape::of_field(&field, map_entry), field.is_map())?;
            // a proto3 `optional` field sits alone in a synthetic oneof and
            // gets a presence bit instead
            let oneof = field
                .containing_oneof()
                .filter(|_| !field.field_descriptor_proto().proto3_optional());
            if let Some(oneof) = oneof {
                let slot = match oneofs.get(oneof.name()) {
                    Some(&slot) => slot,
                    None => {
                        let slot = self.builder.message_mut(index).add_oneof(oneof.name());
                        oneofs.insert(oneof.name().to_string(), slot);
                        slot
                    }
                };
                spec = spec.oneof(slot);
            }
            specs.push(spec);
        }

        let spec = self.builder.message_mut(index);
        for field in specs {
            spec.add_field(field);
        }
        Ok(())
    }

    fn field_spec(&self, shape: &FieldShape, is_map: bool) -> Result<FieldSpec> {
        let field_type = shape.field_type();
        let mut spec = FieldSpec::new(shape.number, shape.name.clone(), field_type, shape.cardinality);

        match &shape.kind {
            Kind::Message(sub) => {
                let sub = self.resolve_message(sub)?;
                spec = if is_map {
                    FieldSpec::map(shape.number, shape.name.clone(), sub)
                } else {
                    spec.message(sub)
                };
            }
            Kind::Enum(e) => {
                let index = self
                    .enums
                    .get(e.full_name())
                    .copied()
                    .ok_or_else(|| Error::descriptor_build(format!("unresolved enum type '{}'", e.full_name())))?;
                spec = spec.enumeration(index);
            }
            _ => {}
        }

        if shape.cardinality == Cardinality::Repeated && field_type.is_packable() {
            spec = spec.packed(shape.packed);
        }
        if shape.cardinality != Cardinality::Repeated {
            if let Some(default) = shape.default() {
                spec = spec.default_value(default);
            }
        }
        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mini_table::{FieldMode, Presence};
    use prost::Message as _;
    use prost_types::field_descriptor_proto::{Label, Type};
    use prost_types::{
        DescriptorProto, EnumDescriptorProto, EnumValueDescriptorProto, FieldDescriptorProto, FieldOptions,
        FileDescriptorProto, FileDescriptorSet, MessageOptions, OneofDescriptorProto,
    };

    fn field(name: &str, number: i32, label: Label, ty: Type) -> FieldDescriptorProto {
        FieldDescriptorProto {
            name: Some(name.to_string()),
            number: Some(number),
            label: Some(label as i32),
            r#type: Some(ty as i32),
            json_name: Some(name.to_string()),
            ..Default::default()
        }
    }

    fn typed(mut f: FieldDescriptorProto, type_name: &str) -> FieldDescriptorProto {
        f.type_name = Some(type_name.to_string());
        f
    }

    fn encode_set(files: Vec<FileDescriptorProto>) -> Vec<u8> {
        FileDescriptorSet { file: files }.encode_to_vec()
    }

    fn proto2_file() -> FileDescriptorProto {
        let mut with_default = field("level", 2, Label::Optional, Type::Int32);
        with_default.default_value = Some("-7".to_string());
        let mut blob = field("blob", 3, Label::Optional, Type::Bytes);
        blob.default_value = Some("a\\000\\x41\\n".to_string());
        let color = typed(field("color", 4, Label::Optional, Type::Enum), ".demo.Color");
        let mut packed = field("samples", 5, Label::Repeated, Type::Sint32);
        packed.options = Some(FieldOptions {
            packed: Some(true),
            ..Default::default()
        });

        FileDescriptorProto {
            name: Some("demo.proto".to_string()),
            package: Some("demo".to_string()),
            syntax: Some("proto2".to_string()),
            message_type: vec![DescriptorProto {
                name: Some("Item".to_string()),
                field: vec![
                    field("id", 1, Label::Required, Type::Int64),
                    with_default,
                    blob,
                    color,
                    packed,
                    field("plain", 6, Label::Repeated, Type::Uint32),
                    typed(field("payload", 7, Label::Optional, Type::Group), ".demo.Item.Payload"),
                ],
                nested_type: vec![DescriptorProto {
                    name: Some("Payload".to_string()),
                    field: vec![field("size", 8, Label::Optional, Type::Int32)],
                    ..Default::default()
                }],
                extension_range: vec![prost_types::descriptor_proto::ExtensionRange {
                    start: Some(100),
                    end: Some(200),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            enum_type: vec![EnumDescriptorProto {
                name: Some("Color".to_string()),
                value: vec![
                    EnumValueDescriptorProto {
                        name: Some("RED".to_string()),
                        number: Some(3),
                        ..Default::default()
                    },
                    EnumValueDescriptorProto {
                        name: Some("BLUE".to_string()),
                        number: Some(4),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }],
            extension: vec![FieldDescriptorProto {
                extendee: Some(".demo.Item".to_string()),
                ..field("note", 100, Label::Optional, Type::String)
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_proto2_semantics() {
        let schema = Schema::from_file_descriptor_set(&encode_set(vec![proto2_file()])).unwrap();
        let item = schema.message_by_name(".demo.Item").unwrap();
        let table = item.table();
        assert!(table.is_extendable());
        assert_eq!(table.required_count(), 1);

        let level = item.field(2).unwrap();
        assert!(matches!(level.presence(), Presence::Hasbit(_)));
        assert_eq!(level.default_value(), &DefaultValue::Int32(-7));
        assert_eq!(
            item.field(3).unwrap().default_value(),
            &DefaultValue::Bytes(Bytes::from_static(b"a\0A\n"))
        );

        let color = item.field(4).unwrap();
        assert_eq!(color.default_value(), &DefaultValue::Int32(3));
        let e = item.enum_of(color).unwrap();
        assert!(e.is_closed());
        assert!(!e.check_value(0));

        assert!(item.field(5).unwrap().is_packed());
        assert!(!item.field(6).unwrap().is_packed());
        assert_eq!(item.field(7).unwrap().field_type(), FieldType::Group);
        assert!(schema.message_by_name("demo.Item.Payload").is_some());

        let (_, note) = schema.find_extension(item.index(), 100).unwrap();
        assert_eq!(note.field().name(), "demo.note");
    }

    #[test]
    fn test_proto3_semantics() {
        let mut opt = field("maybe", 2, Label::Optional, Type::Int32);
        opt.proto3_optional = Some(true);
        opt.oneof_index = Some(1);
        let mut a = field("a", 3, Label::Optional, Type::String);
        a.oneof_index = Some(0);
        let mut b = field("b", 4, Label::Optional, Type::Int64);
        b.oneof_index = Some(0);

        let entry = DescriptorProto {
            name: Some("CountsEntry".to_string()),
            field: vec![
                field("key", 1, Label::Optional, Type::String),
                field("value", 2, Label::Optional, Type::Int32),
            ],
            options: Some(MessageOptions {
                map_entry: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };
        let file = FileDescriptorProto {
            name: Some("p3.proto".to_string()),
            package: Some("p3".to_string()),
            syntax: Some("proto3".to_string()),
            message_type: vec![DescriptorProto {
                name: Some("Msg".to_string()),
                field: vec![
                    field("plain", 1, Label::Optional, Type::Int32),
                    opt,
                    a,
                    b,
                    field("nums", 5, Label::Repeated, Type::Int32),
                    typed(field("counts", 6, Label::Repeated, Type::Message), ".p3.Msg.CountsEntry"),
                    typed(field("child", 7, Label::Optional, Type::Message), ".p3.Msg"),
                ],
                nested_type: vec![entry],
                oneof_decl: vec![
                    OneofDescriptorProto {
                        name: Some("choice".to_string()),
                        ..Default::default()
                    },
                    OneofDescriptorProto {
                        name: Some("_maybe".to_string()),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }],
            ..Default::default()
        };
        let schema = Schema::from_file_descriptor_set(&encode_set(vec![file])).unwrap();
        let msg = schema.message_by_name("p3.Msg").unwrap();
        let table = msg.table();

        assert_eq!(table.oneofs().len(), 1);
        assert_eq!(table.oneofs()[0].name(), "choice");
        assert_eq!(msg.field(1).unwrap().presence(), Presence::Implicit);
        assert!(matches!(msg.field(2).unwrap().presence(), Presence::Hasbit(_)));
        assert!(msg.field(3).unwrap().in_oneof());
        assert!(msg.field(5).unwrap().is_packed());
        assert_eq!(msg.field(6).unwrap().mode(), FieldMode::Map);
        assert!(matches!(msg.field(7).unwrap().presence(), Presence::Hasbit(_)));
        assert!(schema.message_by_name("p3.Msg.CountsEntry").unwrap().table().is_map_entry());
    }

    #[test]
    fn test_garbage_is_a_parse_error() {
        let err = Schema::from_file_descriptor_set(&[0x0A, 0xFF]).unwrap_err();
        assert!(matches!(err, Error::DescriptorParse(_)));
    }
}
