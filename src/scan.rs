use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use jclassfile::class_file;
use jclassfile::constant_pool::ConstantPool;
use jclassfile::methods::MethodFlags;
use opentelemetry::KeyValue;
use serde_json::Value;
use serde_sarif::sarif::{Artifact, ArtifactLocation, ArtifactRoles};
use tracing::warn;
use zip::ZipArchive;

use crate::descriptor::OBJECT_SIGNATURE;
use crate::ir::{
    CallKind, CallSite, Class, ExceptionHandler, FieldRef, Instruction, InstructionKind,
    LineNumber, Method, MethodAccess,
};
use crate::opcodes;
use crate::telemetry::Telemetry;

/// Snapshot of parsed artifacts, classes, and counts for a scan.
pub(crate) struct ScanOutput {
    pub(crate) artifacts: Vec<Artifact>,
    pub(crate) class_count: usize,
    pub(crate) classes: Vec<Class>,
    /// Files inside a scanned directory that could not be read or decoded.
    pub(crate) skipped_file_count: usize,
}

impl ScanOutput {
    /// Methods left out of the analysis because their bytecode could not be decoded.
    pub(crate) fn skipped_method_count(&self) -> usize {
        self.classes.iter().map(|class| class.skipped_methods).sum()
    }
}

/// Collects classes from a `.class` file, a `.jar`, or a directory tree.
pub(crate) fn scan_inputs(input: &Path, telemetry: Option<&Telemetry>) -> Result<ScanOutput> {
    let mut output = ScanOutput {
        artifacts: Vec::new(),
        class_count: 0,
        classes: Vec::new(),
        skipped_file_count: 0,
    };
    if !input.exists() {
        anyhow::bail!("input not found: {}", input.display());
    }
    scan_path(input, true, telemetry, &mut output)?;
    Ok(output)
}

fn scan_path(
    path: &Path,
    strict: bool,
    telemetry: Option<&Telemetry>,
    output: &mut ScanOutput,
) -> Result<()> {
    if path.is_dir() {
        return scan_dir(path, telemetry, output);
    }

    let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");
    match extension {
        "class" => scan_class_file(path, telemetry, output),
        "jar" => scan_jar_file(path, telemetry, output),
        _ if strict => anyhow::bail!("unsupported input file: {}", path.display()),
        _ => Ok(()),
    }
}

fn scan_dir(path: &Path, telemetry: Option<&Telemetry>, output: &mut ScanOutput) -> Result<()> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(path)
        .with_context(|| format!("failed to read directory {}", path.display()))?
    {
        let entry =
            entry.with_context(|| format!("failed to read entry under {}", path.display()))?;
        entries.push(entry.path());
    }

    // Directory listings are sorted so reports come out in a stable order.
    entries.sort_by(|a, b| path_key(a).cmp(&path_key(b)));

    for entry in entries {
        if entry.is_dir() {
            scan_dir(&entry, telemetry, output)?;
            continue;
        }
        if let Err(err) = scan_path(&entry, false, telemetry, output) {
            output.skipped_file_count += 1;
            let error = format!("{err:#}");
            warn!(path = %entry.display(), error = %error, "skipping unreadable input file");
        }
    }
    Ok(())
}

fn scan_class_file(path: &Path, telemetry: Option<&Telemetry>, output: &mut ScanOutput) -> Result<()> {
    let read_and_parse = || -> Result<(u64, ParsedClass)> {
        let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        let parsed = parse_class_bytes(&data)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok((data.len() as u64, parsed))
    };
    let (len, parsed) = match telemetry {
        Some(telemetry) => {
            let attributes = [KeyValue::new("cislint.class_path", path.display().to_string())];
            telemetry.in_span("class.scan", &attributes, read_and_parse)?
        }
        None => read_and_parse()?,
    };

    let artifact_index = push_artifact(path_to_uri(path), len, &mut output.artifacts);
    output.class_count += 1;
    output.classes.push(parsed.into_class(artifact_index));
    Ok(())
}

fn scan_jar_file(path: &Path, telemetry: Option<&Telemetry>, output: &mut ScanOutput) -> Result<()> {
    let open = || -> Result<ZipArchive<fs::File>> {
        let file =
            fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        ZipArchive::new(file).with_context(|| format!("failed to read {}", path.display()))
    };
    let mut archive = match telemetry {
        Some(telemetry) => {
            let attributes = [KeyValue::new("cislint.jar_path", path.display().to_string())];
            telemetry.in_span("jar.scan", &attributes, open)?
        }
        None => open()?,
    };

    let jar_len = fs::metadata(path)
        .with_context(|| format!("failed to read {}", path.display()))?
        .len();
    let jar_index = push_artifact(path_to_uri(path), jar_len, &mut output.artifacts);

    let mut entry_names = Vec::new();
    for index in 0..archive.len() {
        let entry = archive
            .by_index(index)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        if name.ends_with(".class")
            && !name.ends_with("module-info.class")
            && !name.starts_with("META-INF/versions/")
        {
            entry_names.push(name);
        }
    }
    entry_names.sort();

    for name in entry_names {
        let mut read_entry = || -> Result<ParsedClass> {
            let mut entry = archive
                .by_name(&name)
                .with_context(|| format!("failed to read {}:{}", path.display(), name))?;
            let mut data = Vec::new();
            entry
                .read_to_end(&mut data)
                .with_context(|| format!("failed to read {}:{}", path.display(), name))?;
            parse_class_bytes(&data)
                .with_context(|| format!("failed to parse {}:{}", path.display(), name))
        };
        let parsed = match telemetry {
            Some(telemetry) => {
                let attributes = [
                    KeyValue::new("cislint.jar_path", path.display().to_string()),
                    KeyValue::new("cislint.jar_entry", name.clone()),
                ];
                telemetry.in_span("class.scan", &attributes, read_entry)?
            }
            None => read_entry()?,
        };
        output.class_count += 1;
        output.classes.push(parsed.into_class(jar_index));
    }

    Ok(())
}

fn push_artifact(uri: String, len: u64, artifacts: &mut Vec<Artifact>) -> i64 {
    let roles: Vec<Value> = serde_json::to_value(ArtifactRoles::AnalysisTarget)
        .map(|role| vec![role])
        .unwrap_or_default();
    let location = ArtifactLocation::builder().uri(uri).build();
    let artifact = Artifact::builder()
        .location(location)
        .length(len as i64)
        .roles(roles)
        .build();
    let index = artifacts.len() as i64;
    artifacts.push(artifact);
    index
}

fn path_to_uri(path: &Path) -> String {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(path)
    };
    format!("file://{}", absolute.to_string_lossy())
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// Parsed class data extracted from class file bytes.
struct ParsedClass {
    name: String,
    methods: Vec<Method>,
    skipped_methods: usize,
}

impl ParsedClass {
    fn into_class(self, artifact_index: i64) -> Class {
        Class {
            name: self.name,
            methods: self.methods,
            artifact_index,
            skipped_methods: self.skipped_methods,
        }
    }
}

fn parse_class_bytes(data: &[u8]) -> Result<ParsedClass> {
    let class_file = class_file::parse(data).context("failed to parse class file bytes")?;
    let constant_pool = class_file.constant_pool();
    let name =
        resolve_class_name(constant_pool, class_file.this_class()).context("resolve class name")?;
    let (methods, skipped_methods) = parse_methods(&name, constant_pool, class_file.methods());
    Ok(ParsedClass {
        name,
        methods,
        skipped_methods,
    })
}

/// Decodes every method with a body; a method that fails to decode is skipped, not fatal.
fn parse_methods(
    class_name: &str,
    constant_pool: &[ConstantPool],
    methods: &[jclassfile::methods::MethodInfo],
) -> (Vec<Method>, usize) {
    let mut parsed = Vec::new();
    let mut skipped = 0;
    for method in methods {
        match parse_method(constant_pool, method) {
            Ok(Some(method)) => parsed.push(method),
            Ok(None) => {}
            Err(err) => {
                skipped += 1;
                let error = format!("{err:#}");
                warn!(class = class_name, error = %error, "skipping undecodable method");
            }
        }
    }
    (parsed, skipped)
}

fn parse_method(
    constant_pool: &[ConstantPool],
    method: &jclassfile::methods::MethodInfo,
) -> Result<Option<Method>> {
    let name = resolve_utf8(constant_pool, method.name_index()).context("resolve method name")?;
    let descriptor = resolve_utf8(constant_pool, method.descriptor_index())
        .context("resolve method descriptor")?;
    let access = MethodAccess {
        is_static: method.access_flags().contains(MethodFlags::ACC_STATIC),
    };
    let code = method
        .attributes()
        .iter()
        .find_map(|attribute| match attribute {
            jclassfile::attributes::Attribute::Code {
                code,
                exception_table,
                attributes,
                ..
            } => Some((code, exception_table, attributes)),
            _ => None,
        });
    let Some((code, exception_table, code_attributes)) = code else {
        return Ok(None);
    };
    let instructions = parse_bytecode(code, constant_pool)
        .with_context(|| format!("decode {name}{descriptor}"))?;
    let exception_handlers =
        parse_exception_handlers(exception_table, constant_pool).context("parse handlers")?;
    Ok(Some(Method {
        name,
        descriptor,
        access,
        bytecode: code.clone(),
        instructions,
        line_numbers: parse_line_numbers(code_attributes),
        exception_handlers,
    }))
}

fn parse_line_numbers(attributes: &[jclassfile::attributes::Attribute]) -> Vec<LineNumber> {
    let mut entries = Vec::new();
    for attribute in attributes {
        let jclassfile::attributes::Attribute::LineNumberTable { line_number_table } = attribute
        else {
            continue;
        };
        for record in line_number_table {
            entries.push(LineNumber {
                start_pc: record.start_pc() as u32,
                line: record.line_number() as u32,
            });
        }
    }
    entries.sort_by_key(|entry| entry.start_pc);
    entries
}

fn parse_exception_handlers(
    table: &[jclassfile::attributes::ExceptionRecord],
    constant_pool: &[ConstantPool],
) -> Result<Vec<ExceptionHandler>> {
    let mut handlers = Vec::new();
    for entry in table {
        let catch_type = if entry.catch_type() == 0 {
            None
        } else {
            Some(
                resolve_class_name(constant_pool, entry.catch_type())
                    .context("resolve catch type")?,
            )
        };
        handlers.push(ExceptionHandler {
            handler_pc: entry.handler_pc() as u32,
            catch_type,
        });
    }
    Ok(handlers)
}

fn resolve_class_name(constant_pool: &[ConstantPool], class_index: u16) -> Result<String> {
    let entry = constant_pool
        .get(class_index as usize)
        .context("missing class entry")?;
    match entry {
        ConstantPool::Class { name_index } => resolve_utf8(constant_pool, *name_index),
        _ => anyhow::bail!("unexpected class entry"),
    }
}

fn resolve_utf8(constant_pool: &[ConstantPool], index: u16) -> Result<String> {
    let entry = constant_pool
        .get(index as usize)
        .context("missing utf8 entry")?;
    match entry {
        ConstantPool::Utf8 { value } => Ok(value.clone()),
        _ => anyhow::bail!("unexpected utf8 entry"),
    }
}

fn resolve_name_and_type(constant_pool: &[ConstantPool], index: u16) -> Result<(String, String)> {
    let entry = constant_pool
        .get(index as usize)
        .context("missing name and type entry")?;
    match entry {
        ConstantPool::NameAndType {
            name_index,
            descriptor_index,
        } => Ok((
            resolve_utf8(constant_pool, *name_index).context("resolve member name")?,
            resolve_utf8(constant_pool, *descriptor_index).context("resolve member descriptor")?,
        )),
        _ => anyhow::bail!("unexpected name and type entry"),
    }
}

/// Owner, name and descriptor of a method or field reference.
struct MemberRef {
    owner: String,
    name: String,
    descriptor: String,
}

fn resolve_member_ref(constant_pool: &[ConstantPool], index: u16) -> Result<MemberRef> {
    let entry = constant_pool
        .get(index as usize)
        .context("missing member ref entry")?;
    let (class_index, name_and_type_index) = match entry {
        ConstantPool::Methodref {
            class_index,
            name_and_type_index,
        }
        | ConstantPool::InterfaceMethodref {
            class_index,
            name_and_type_index,
        }
        | ConstantPool::Fieldref {
            class_index,
            name_and_type_index,
        } => (*class_index, *name_and_type_index),
        _ => anyhow::bail!("unexpected member ref entry"),
    };
    let owner = resolve_class_name(constant_pool, class_index).context("resolve owner")?;
    let (name, descriptor) = resolve_name_and_type(constant_pool, name_and_type_index)?;
    Ok(MemberRef {
        owner,
        name,
        descriptor,
    })
}

/// Kind of value an `ldc` family instruction loads.
fn resolve_constant(constant_pool: &[ConstantPool], index: u16) -> Result<InstructionKind> {
    let entry = constant_pool
        .get(index as usize)
        .context("missing constant pool entry")?;
    let kind = match entry {
        ConstantPool::String { string_index } => {
            InstructionKind::ConstString(resolve_utf8(constant_pool, *string_index)?)
        }
        ConstantPool::Integer { .. } => InstructionKind::Constant("I".to_string()),
        ConstantPool::Float { .. } => InstructionKind::Constant("F".to_string()),
        ConstantPool::Long { .. } => InstructionKind::Constant("J".to_string()),
        ConstantPool::Double { .. } => InstructionKind::Constant("D".to_string()),
        ConstantPool::Class { .. } => InstructionKind::Constant("Ljava/lang/Class;".to_string()),
        ConstantPool::MethodType { .. } => {
            InstructionKind::Constant("Ljava/lang/invoke/MethodType;".to_string())
        }
        ConstantPool::MethodHandle { .. } => {
            InstructionKind::Constant("Ljava/lang/invoke/MethodHandle;".to_string())
        }
        ConstantPool::Dynamic {
            name_and_type_index,
            ..
        } => {
            let (_, descriptor) = resolve_name_and_type(constant_pool, *name_and_type_index)?;
            InstructionKind::Constant(descriptor)
        }
        _ => InstructionKind::Constant(OBJECT_SIGNATURE.to_string()),
    };
    Ok(kind)
}

fn parse_bytecode(code: &[u8], constant_pool: &[ConstantPool]) -> Result<Vec<Instruction>> {
    let mut instructions = Vec::new();
    let mut offset = 0usize;
    while offset < code.len() {
        let opcode = code[offset];
        let length = opcode_length(code, offset)?;
        if length == 0 || offset + length > code.len() {
            anyhow::bail!("invalid bytecode length at offset {}", offset);
        }
        let kind = match opcode {
            opcodes::INVOKEVIRTUAL
            | opcodes::INVOKESPECIAL
            | opcodes::INVOKESTATIC
            | opcodes::INVOKEINTERFACE => {
                let method_ref = resolve_member_ref(constant_pool, read_u16(code, offset + 1)?)
                    .context("resolve method ref")?;
                let kind = match opcode {
                    opcodes::INVOKEVIRTUAL => CallKind::Virtual,
                    opcodes::INVOKESPECIAL => CallKind::Special,
                    opcodes::INVOKESTATIC => CallKind::Static,
                    _ => CallKind::Interface,
                };
                InstructionKind::Invoke(CallSite {
                    owner: method_ref.owner,
                    name: method_ref.name,
                    descriptor: method_ref.descriptor,
                    kind,
                })
            }
            opcodes::INVOKEDYNAMIC => {
                let index = read_u16(code, offset + 1)?;
                let entry = constant_pool
                    .get(index as usize)
                    .context("missing invokedynamic entry")?;
                let ConstantPool::InvokeDynamic {
                    name_and_type_index,
                    ..
                } = entry
                else {
                    anyhow::bail!("unexpected invokedynamic entry");
                };
                let (_, descriptor) = resolve_name_and_type(constant_pool, *name_and_type_index)?;
                InstructionKind::InvokeDynamic { descriptor }
            }
            opcodes::GETSTATIC | opcodes::PUTSTATIC | opcodes::GETFIELD | opcodes::PUTFIELD => {
                let field_ref = resolve_member_ref(constant_pool, read_u16(code, offset + 1)?)
                    .context("resolve field ref")?;
                InstructionKind::Field(FieldRef {
                    owner: field_ref.owner,
                    name: field_ref.name,
                    descriptor: field_ref.descriptor,
                })
            }
            opcodes::LDC => {
                let index = code.get(offset + 1).copied().context("ldc index")?;
                resolve_constant(constant_pool, u16::from(index))?
            }
            opcodes::LDC_W | opcodes::LDC2_W => {
                resolve_constant(constant_pool, read_u16(code, offset + 1)?)?
            }
            opcodes::NEW
            | opcodes::ANEWARRAY
            | opcodes::CHECKCAST
            | opcodes::INSTANCEOF
            | opcodes::MULTIANEWARRAY => {
                let class_name = resolve_class_name(constant_pool, read_u16(code, offset + 1)?)
                    .context("resolve type operand")?;
                InstructionKind::TypeRef(class_name)
            }
            _ => InstructionKind::Other,
        };

        instructions.push(Instruction {
            offset: offset as u32,
            opcode,
            kind,
        });
        offset += length;
    }
    Ok(instructions)
}

pub(crate) fn opcode_length(code: &[u8], offset: usize) -> Result<usize> {
    let opcode = code[offset];
    let length = match opcode {
        0x00..=0x0f => 1,
        opcodes::BIPUSH => 2,
        opcodes::SIPUSH => 3,
        opcodes::LDC => 2,
        opcodes::LDC_W | opcodes::LDC2_W => 3,
        opcodes::ILOAD..=opcodes::ALOAD => 2,
        opcodes::ILOAD_0..=opcodes::SALOAD => 1,
        opcodes::ISTORE..=opcodes::ASTORE => 2,
        opcodes::ISTORE_0..=opcodes::LXOR => 1,
        opcodes::IINC => 3,
        opcodes::I2L..=opcodes::DCMPG => 1,
        opcodes::IFEQ..=opcodes::JSR => 3,
        opcodes::RET => 2,
        opcodes::TABLESWITCH => tableswitch_length(code, offset)?,
        opcodes::LOOKUPSWITCH => lookupswitch_length(code, offset)?,
        opcodes::IRETURN..=opcodes::RETURN => 1,
        opcodes::GETSTATIC..=opcodes::INVOKESTATIC => 3,
        opcodes::INVOKEINTERFACE | opcodes::INVOKEDYNAMIC => 5,
        opcodes::NEW => 3,
        opcodes::NEWARRAY => 2,
        opcodes::ANEWARRAY => 3,
        opcodes::ARRAYLENGTH | opcodes::ATHROW => 1,
        opcodes::CHECKCAST | opcodes::INSTANCEOF => 3,
        opcodes::MONITORENTER | opcodes::MONITOREXIT => 1,
        opcodes::WIDE => wide_length(code, offset)?,
        opcodes::MULTIANEWARRAY => 4,
        opcodes::IFNULL | opcodes::IFNONNULL => 3,
        opcodes::GOTO_W | opcodes::JSR_W => 5,
        _ => anyhow::bail!("unsupported opcode 0x{:02x}", opcode),
    };
    Ok(length)
}

fn tableswitch_length(code: &[u8], offset: usize) -> Result<usize> {
    let padding = padding(offset);
    let base = offset + 1 + padding;
    let low = read_i32(code, base + 4)?;
    let high = read_i32(code, base + 8)?;
    let count = high
        .checked_sub(low)
        .and_then(|v| v.checked_add(1))
        .context("invalid tableswitch range")?;
    if count < 0 {
        anyhow::bail!("invalid tableswitch range");
    }
    Ok(1 + padding + 12 + (count as usize) * 4)
}

fn lookupswitch_length(code: &[u8], offset: usize) -> Result<usize> {
    let padding = padding(offset);
    let base = offset + 1 + padding;
    let npairs = read_i32(code, base + 4)?;
    if npairs < 0 {
        anyhow::bail!("invalid lookupswitch pairs");
    }
    Ok(1 + padding + 8 + (npairs as usize) * 8)
}

fn wide_length(code: &[u8], offset: usize) -> Result<usize> {
    let opcode = code
        .get(offset + 1)
        .copied()
        .context("missing wide opcode")?;
    if opcode == opcodes::IINC { Ok(6) } else { Ok(4) }
}

/// Alignment bytes after a switch opcode at `offset`.
pub(crate) fn padding(offset: usize) -> usize {
    (4 - ((offset + 1) % 4)) % 4
}

pub(crate) fn read_u16(code: &[u8], offset: usize) -> Result<u16> {
    let slice = code
        .get(offset..offset + 2)
        .context("bytecode u16 out of bounds")?;
    Ok(u16::from_be_bytes([slice[0], slice[1]]))
}

pub(crate) fn read_u32(code: &[u8], offset: usize) -> Result<u32> {
    let slice = code
        .get(offset..offset + 4)
        .context("bytecode u32 out of bounds")?;
    Ok(u32::from_be_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

fn read_i32(code: &[u8], offset: usize) -> Result<i32> {
    let value = read_u32(code, offset)?;
    Ok(i32::from_be_bytes(value.to_be_bytes()))
}
