//! tkan - Decode, inspect and round-trip protocol buffer payloads
//!
//! This tool loads a compiled `FileDescriptorSet`, builds mini tables for
//! every message it declares and runs binary payloads through the
//! tkan-core decoder and encoder.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tkan_core::{
    decode, decode_length_prefixed, encode_to_vec, Arena, DecodeOptions, EncodeOptions, FieldMode, FieldType,
    Message, MessageType, MiniTableField, Presence, Schema, Value,
};
use tracing::{debug, info, trace, warn, Level};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

/// Decode, inspect and round-trip protocol buffer payloads
#[derive(Parser, Debug)]
#[command(name = "tkan")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the computed memory layout of message types
    Layout {
        #[command(flatten)]
        schema: SchemaArgs,

        /// Only print this message (fully qualified name)
        #[arg(short, long)]
        message: Option<String>,
    },
    /// Decode payloads and print their fields
    Decode {
        #[command(flatten)]
        schema: SchemaArgs,

        /// Fully qualified name of the payload's message type
        #[arg(short, long)]
        message: String,

        #[command(flatten)]
        input: InputMode,

        #[command(flatten)]
        wire: WireArgs,
    },
    /// Decode payloads, encode them again and compare the bytes
    Roundtrip {
        #[command(flatten)]
        schema: SchemaArgs,

        /// Fully qualified name of the payload's message type
        #[arg(short, long)]
        message: String,

        #[command(flatten)]
        input: InputMode,

        #[command(flatten)]
        wire: WireArgs,

        /// Sort map entries and extensions on encode
        #[arg(long)]
        deterministic: bool,

        /// Drop unknown fields from the re-encoded output
        #[arg(long)]
        skip_unknown: bool,

        /// Write re-encoded payloads into this directory
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Overwrite existing output files
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args, Debug)]
struct SchemaArgs {
    /// Compiled FileDescriptorSet (protoc --descriptor_set_out --include_imports)
    #[arg(short, long)]
    descriptors: PathBuf,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct InputMode {
    /// Path to a single payload file
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Path to a directory of payload files
    #[arg(long)]
    directory: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct WireArgs {
    /// Payloads are streams of varint-length-prefixed messages
    #[arg(long)]
    length_prefixed: bool,

    /// Only process files with this extension in directory mode
    #[arg(long, default_value = "pb")]
    extension: String,

    /// Maximum submessage nesting depth
    #[arg(long, default_value_t = tkan_core::DEFAULT_MAX_DEPTH)]
    max_depth: u32,

    /// Fail when required fields are missing
    #[arg(long)]
    check_required: bool,
}

impl WireArgs {
    fn decode_options(&self) -> DecodeOptions {
        DecodeOptions::new()
            .max_depth(self.max_depth)
            .check_required(self.check_required)
    }
}

#[derive(Default)]
struct RoundtripStats {
    identical: usize,
    changed: usize,
    failed: usize,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_target(false)
        .init();

    let stdout = io::stdout();
    let mut out = stdout.lock();
    run(&cli.command, &mut out)
}

fn run(command: &Command, out: &mut impl Write) -> Result<()> {
    match command {
        Command::Layout { schema, message } => {
            let schema = load_schema(&schema.descriptors)?;
            match message {
                Some(name) => write_layout(&lookup(&schema, name)?, out)?,
                None => {
                    for ty in schema.messages() {
                        write_layout(&ty, out)?;
                    }
                }
            }
            Ok(())
        }
        Command::Decode {
            schema,
            message,
            input,
            wire,
        } => {
            let schema = load_schema(&schema.descriptors)?;
            let ty = lookup(&schema, message)?;
            for path in collect_inputs(input, &wire.extension)? {
                let data = fs::read(&path).with_context(|| format!("Failed to read payload: {}", path.display()))?;
                writeln!(out, "# {}", path.display())?;
                if let Err(e) = dump_payload(ty, &data, wire, out) {
                    warn!("Failed to decode {}: {:#}", path.display(), e);
                }
            }
            Ok(())
        }
        Command::Roundtrip {
            schema,
            message,
            input,
            wire,
            deterministic,
            skip_unknown,
            output,
            force,
        } => {
            let schema = load_schema(&schema.descriptors)?;
            let ty = lookup(&schema, message)?;
            let encode = EncodeOptions::new()
                .deterministic(*deterministic)
                .skip_unknown(*skip_unknown)
                .max_depth(wire.max_depth);

            let mut stats = RoundtripStats::default();
            for path in collect_inputs(input, &wire.extension)? {
                let data = fs::read(&path).with_context(|| format!("Failed to read payload: {}", path.display()))?;
                let encoded = match roundtrip(ty, &data, wire, &encode) {
                    Ok(encoded) => encoded,
                    Err(e) => {
                        warn!("Failed to round-trip {}: {:#}", path.display(), e);
                        stats.failed += 1;
                        continue;
                    }
                };

                let before = blake3::hash(&data);
                let after = blake3::hash(&encoded);
                if before == after {
                    stats.identical += 1;
                    writeln!(out, "identical {} {}", &before.to_hex()[..16], path.display())?;
                } else {
                    stats.changed += 1;
                    writeln!(
                        out,
                        "changed   {} -> {} {} ({} -> {} bytes)",
                        &before.to_hex()[..16],
                        &after.to_hex()[..16],
                        path.display(),
                        data.len(),
                        encoded.len()
                    )?;
                }

                if let Some(dir) = output {
                    let name = path.file_name().context("Payload path has no file name")?;
                    write_output(&dir.join(name), &encoded, *force)?;
                }
            }

            info!(
                "Summary: {} identical, {} changed, {} failed",
                stats.identical, stats.changed, stats.failed
            );
            if stats.failed > 0 {
                bail!("{} payload(s) failed to round-trip", stats.failed);
            }
            Ok(())
        }
    }
}

fn load_schema(path: &Path) -> Result<Schema> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read descriptor set: {}", path.display()))?;
    let schema = Schema::from_file_descriptor_set(&bytes)
        .with_context(|| format!("Failed to load descriptor set: {}", path.display()))?;
    debug!("Loaded {} message types from {}", schema.message_count(), path.display());
    Ok(schema)
}

fn lookup<'s>(schema: &'s Schema, name: &str) -> Result<MessageType<'s>> {
    match schema.message_by_name(name) {
        Some(ty) => Ok(ty),
        None => bail!("Unknown message type: {}", name),
    }
}

/// Resolves the input mode into a sorted list of payload files
fn collect_inputs(input: &InputMode, extension: &str) -> Result<Vec<PathBuf>> {
    if let Some(ref file) = input.file {
        if !file.is_file() {
            bail!("Input path is not a file: {}", file.display());
        }
        return Ok(vec![file.clone()]);
    }
    let Some(ref directory) = input.directory else {
        bail!("Either --file or --directory must be specified")
    };
    if !directory.is_dir() {
        bail!("Path is not a directory: {}", directory.display());
    }

    info!("Scanning directory: {}", directory.display());
    let mut files = Vec::new();
    for entry in WalkDir::new(directory)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        // Skip hidden files
        if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with('.'))
        {
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some(extension) {
            trace!("Skipping {}", path.display());
            continue;
        }
        files.push(path.to_path_buf());
    }
    files.sort();
    Ok(files)
}

/// Decodes every message in `data` and prints it
fn dump_payload(ty: MessageType<'_>, data: &[u8], wire: &WireArgs, out: &mut impl Write) -> Result<()> {
    let options = wire.decode_options();
    if !wire.length_prefixed {
        let arena = Arena::new();
        let msg = Message::new(ty, &arena)?;
        decode(data, msg, &arena, &options)?;
        return write_message(msg, 0, out);
    }

    let mut rest = data;
    let mut index = 0;
    while !rest.is_empty() {
        let arena = Arena::new();
        let msg = Message::new(ty, &arena)?;
        let used = decode_length_prefixed(rest, msg, &arena, &options)
            .with_context(|| format!("Failed to decode message #{}", index))?;
        writeln!(out, "[{}] {{", index)?;
        write_message(msg, 1, out)?;
        writeln!(out, "}}")?;
        rest = &rest[used..];
        index += 1;
    }
    Ok(())
}

/// Decodes `data` and returns the re-encoded bytes
fn roundtrip(ty: MessageType<'_>, data: &[u8], wire: &WireArgs, encode: &EncodeOptions) -> Result<Vec<u8>> {
    let options = wire.decode_options();
    if !wire.length_prefixed {
        let arena = Arena::new();
        let msg = Message::new(ty, &arena)?;
        decode(data, msg, &arena, &options)?;
        return Ok(encode_to_vec(msg, encode)?);
    }

    let mut encoded = Vec::with_capacity(data.len());
    let mut rest = data;
    while !rest.is_empty() {
        let arena = Arena::new();
        let msg = Message::new(ty, &arena)?;
        let used = decode_length_prefixed(rest, msg, &arena, &options)?;
        encoded.extend_from_slice(&tkan_core::encode_length_prefixed(msg, encode)?);
        rest = &rest[used..];
    }
    Ok(encoded)
}

fn write_layout(ty: &MessageType<'_>, out: &mut impl Write) -> Result<()> {
    let table = ty.table();
    writeln!(
        out,
        "message {} (size {}, align {}, presence bytes {}, dense below {})",
        ty.name(),
        table.size(),
        table.align(),
        table.hasbit_bytes(),
        table.dense_below()
    )?;
    for field in table.fields() {
        let presence = match field.presence() {
            Presence::Implicit => "implicit".to_string(),
            Presence::Hasbit(bit) => format!("hasbit {}", bit),
            Presence::Oneof { case_offset, index } => format!("oneof {} case @{}", index, case_offset),
        };
        writeln!(
            out,
            "  {:>5} {:<24} {:<10} {:<6} @{:<4} {}{}{}",
            field.number(),
            field.name(),
            format!("{:?}", field.field_type()).to_lowercase(),
            format!("{:?}", field.mode()).to_lowercase(),
            field.offset(),
            presence,
            if field.is_packed() { ", packed" } else { "" },
            if field.is_required() { ", required" } else { "" },
        )?;
    }
    Ok(())
}

fn write_message(msg: Message<'_>, indent: usize, out: &mut impl Write) -> Result<()> {
    let ty = msg.message_type();
    let pad = "  ".repeat(indent);
    for field in ty.table().fields() {
        if !msg.has(field) {
            continue;
        }
        match field.mode() {
            FieldMode::Scalar => {
                if let Some(value) = msg.get(field) {
                    write_value(field, value, indent, out)?;
                }
            }
            FieldMode::Array => {
                if let Some(array) = msg.array(field) {
                    for value in array.iter() {
                        write_value(field, value, indent, out)?;
                    }
                }
            }
            FieldMode::Map => {
                let Some(map) = msg.map(field) else { continue };
                let entry = map.entry_type();
                let (Some(key_field), Some(value_field)) = (entry.field(1), entry.field(2)) else {
                    continue;
                };
                for (key, value) in map.iter() {
                    writeln!(out, "{}{} {{", pad, field.name())?;
                    write_value(key_field, key, indent + 1, out)?;
                    write_value(value_field, value, indent + 1, out)?;
                    writeln!(out, "{}}}", pad)?;
                }
            }
        }
    }

    let extensions = msg.extension_count();
    if extensions > 0 {
        writeln!(out, "{}# {} extension(s)", pad, extensions)?;
    }
    let unknown = msg.unknown_fields();
    if !unknown.is_empty() {
        writeln!(out, "{}# {} unknown byte(s): {}", pad, unknown.len(), hex(unknown))?;
    }
    Ok(())
}

fn write_value(field: &MiniTableField, value: Value<'_>, indent: usize, out: &mut impl Write) -> Result<()> {
    let pad = "  ".repeat(indent);
    let text = match value {
        Value::Message(child) => {
            writeln!(out, "{}{} {{", pad, field.name())?;
            write_message(child, indent + 1, out)?;
            writeln!(out, "{}}}", pad)?;
            return Ok(());
        }
        Value::Bytes(bytes) if field.field_type() == FieldType::String => {
            format!("{:?}", String::from_utf8_lossy(bytes))
        }
        Value::Bytes(bytes) => format!("\"{}\"", bytes.escape_ascii()),
        Value::Bool(v) => v.to_string(),
        Value::I32(v) => v.to_string(),
        Value::U32(v) => v.to_string(),
        Value::I64(v) => v.to_string(),
        Value::U64(v) => v.to_string(),
        Value::F32(v) => v.to_string(),
        Value::F64(v) => v.to_string(),
    };
    writeln!(out, "{}{}: {}", pad, field.name(), text)?;
    Ok(())
}

fn hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join(" ")
}

/// Write an output file, refusing to clobber unless forced
fn write_output(output_path: &Path, content: &[u8], force: bool) -> Result<()> {
    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    if output_path.exists() && !force {
        bail!(
            "File already exists: {} (use --force to overwrite)",
            output_path.display()
        );
    }

    fs::write(output_path, content).with_context(|| format!("Failed to write file: {}", output_path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use prost::Message as _;
    use prost_types::field_descriptor_proto::{Label, Type};
    use prost_types::{DescriptorProto, FieldDescriptorProto, FileDescriptorProto, FileDescriptorSet};
    use tempfile::TempDir;

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

    /// Writes a descriptor set declaring `demo.Person { int32 id = 1; string name = 2; repeated int32 tags = 3; }`
    fn write_descriptors(dir: &Path) -> PathBuf {
        let file = FileDescriptorProto {
            name: Some("demo.proto".to_string()),
            package: Some("demo".to_string()),
            syntax: Some("proto3".to_string()),
            message_type: vec![DescriptorProto {
                name: Some("Person".to_string()),
                field: vec![
                    field("id", 1, Label::Optional, Type::Int32),
                    field("name", 2, Label::Optional, Type::String),
                    field("tags", 3, Label::Repeated, Type::Int32),
                ],
                ..Default::default()
            }],
            ..Default::default()
        };
        let path = dir.join("demo.fds");
        fs::write(&path, FileDescriptorSet { file: vec![file] }.encode_to_vec()).unwrap();
        path
    }

    const PERSON: &[u8] = &[0x08, 0x96, 0x01, 0x12, 0x03, b'a', b'd', b'a', 0x1A, 0x02, 0x01, 0x02];

    fn wire() -> WireArgs {
        WireArgs {
            length_prefixed: false,
            extension: "pb".to_string(),
            max_depth: tkan_core::DEFAULT_MAX_DEPTH,
            check_required: false,
        }
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_dump_payload() {
        let temp_dir = TempDir::new().unwrap();
        let schema = load_schema(&write_descriptors(temp_dir.path())).unwrap();
        let ty = lookup(&schema, "demo.Person").unwrap();

        let mut out = Vec::new();
        dump_payload(ty, PERSON, &wire(), &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "id: 150\nname: \"ada\"\ntags: 1\ntags: 2\n");
    }

    #[test]
    fn test_dump_reports_unknown_bytes() {
        let temp_dir = TempDir::new().unwrap();
        let schema = load_schema(&write_descriptors(temp_dir.path())).unwrap();
        let ty = lookup(&schema, "demo.Person").unwrap();

        let mut out = Vec::new();
        dump_payload(ty, &[0x08, 0x01, 0x28, 0x07], &wire(), &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("# 2 unknown byte(s): 28 07"));
    }

    #[test]
    fn test_roundtrip_length_prefixed() {
        let temp_dir = TempDir::new().unwrap();
        let schema = load_schema(&write_descriptors(temp_dir.path())).unwrap();
        let ty = lookup(&schema, "demo.Person").unwrap();

        let mut stream = vec![PERSON.len() as u8];
        stream.extend_from_slice(PERSON);
        stream.extend_from_slice(&[0x02, 0x08, 0x05]);

        let wire = WireArgs {
            length_prefixed: true,
            ..wire()
        };
        let encoded = roundtrip(ty, &stream, &wire, &EncodeOptions::default()).unwrap();
        assert_eq!(encoded, stream);
    }

    #[test]
    fn test_roundtrip_directory_writes_output() {
        let temp_dir = TempDir::new().unwrap();
        let descriptors = write_descriptors(temp_dir.path());
        let payloads = temp_dir.path().join("payloads");
        fs::create_dir_all(&payloads).unwrap();
        fs::write(payloads.join("a.pb"), PERSON).unwrap();
        fs::write(payloads.join(".hidden.pb"), PERSON).unwrap();
        fs::write(payloads.join("notes.txt"), b"not a payload").unwrap();
        let output = temp_dir.path().join("out");

        let command = Command::Roundtrip {
            schema: SchemaArgs { descriptors },
            message: "demo.Person".to_string(),
            input: InputMode {
                file: None,
                directory: Some(payloads),
            },
            wire: wire(),
            deterministic: true,
            skip_unknown: false,
            output: Some(output.clone()),
            force: false,
        };
        let mut out = Vec::new();
        run(&command, &mut out).unwrap();

        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), 1);
        assert!(text.starts_with("identical"));
        assert_eq!(fs::read(output.join("a.pb")).unwrap(), PERSON);

        // second run refuses to overwrite
        assert!(run(&command, &mut Vec::new()).is_err());
    }

    #[test]
    fn test_unknown_message_type() {
        let temp_dir = TempDir::new().unwrap();
        let schema = load_schema(&write_descriptors(temp_dir.path())).unwrap();
        let err = lookup(&schema, "demo.Missing").unwrap_err();
        assert!(err.to_string().contains("demo.Missing"));
    }

    #[test]
    fn test_layout_lists_fields() {
        let temp_dir = TempDir::new().unwrap();
        let schema = load_schema(&write_descriptors(temp_dir.path())).unwrap();
        let mut out = Vec::new();
        write_layout(&lookup(&schema, "demo.Person").unwrap(), &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("message demo.Person"));
        assert!(text.contains("tags"));
        assert!(text.contains("packed"));
    }
}
