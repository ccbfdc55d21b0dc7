use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use tempfile::TempDir;

use crate::engine::{Engine, EngineOutput, build_context};
use crate::ir::{
    CallKind, CallSite, ExceptionHandler, FieldRef, Instruction, InstructionKind, LineNumber,
    Method, MethodAccess,
};
use crate::opcodes;
use crate::scan::scan_inputs;

/// Source file definition for compilation.
pub(crate) struct SourceFile {
    pub(crate) path: String,
    pub(crate) contents: String,
}

/// Compiled output directories from the harness.
pub(crate) struct CompileOutput {
    _temp_dir: TempDir,
    classes_dir: PathBuf,
}

impl CompileOutput {
    pub(crate) fn classes_dir(&self) -> &Path {
        &self.classes_dir
    }
}

/// Test harness that compiles Java sources and runs analysis.
pub(crate) struct JvmTestHarness {
    javac: PathBuf,
}

impl JvmTestHarness {
    /// Fails when no JDK is reachable through `JAVA_HOME`.
    pub(crate) fn new() -> Result<Self> {
        Ok(Self {
            javac: javac_path()?,
        })
    }

    pub(crate) fn compile(&self, sources: &[SourceFile]) -> Result<CompileOutput> {
        let temp_dir = tempfile::tempdir().context("create temp dir")?;
        let src_dir = temp_dir.path().join("src");
        let classes_dir = temp_dir.path().join("classes");
        fs::create_dir_all(&src_dir).context("create src dir")?;
        fs::create_dir_all(&classes_dir).context("create classes dir")?;

        let mut source_paths = Vec::new();
        for source in sources {
            let path = src_dir.join(&source.path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).context("create source parent dir")?;
            }
            fs::write(&path, source.contents.as_bytes()).context("write source file")?;
            source_paths.push(path);
        }

        let mut command = Command::new(&self.javac);
        command.arg("-g").arg("-d").arg(&classes_dir);
        command.args(&source_paths);
        run_command(command, "javac")?;

        Ok(CompileOutput {
            _temp_dir: temp_dir,
            classes_dir,
        })
    }

    pub(crate) fn compile_and_analyze(&self, sources: &[SourceFile]) -> Result<EngineOutput> {
        let output = self.compile(sources)?;
        analyze_path(output.classes_dir())
    }
}

/// Runs every registered rule over a `.class`, `.jar` or directory input.
pub(crate) fn analyze_path(input: &Path) -> Result<EngineOutput> {
    let scan = scan_inputs(input, None).context("scan classes")?;
    let context = build_context(scan.classes, &scan.artifacts, None)?;
    Engine::new().analyze(context).context("run analysis")
}

/// Writes generated class files into a temp directory and analyzes it.
pub(crate) fn analyze_class_files(files: &[(&str, Vec<u8>)]) -> Result<EngineOutput> {
    let temp_dir = tempfile::tempdir().context("create temp dir")?;
    for (name, bytes) in files {
        fs::write(temp_dir.path().join(name), bytes)
            .with_context(|| format!("write {name}"))?;
    }
    analyze_path(temp_dir.path())
}

fn javac_path() -> Result<PathBuf> {
    let java_home = std::env::var("JAVA_HOME").context("JAVA_HOME not set")?;
    let mut path = PathBuf::from(java_home);
    path.push("bin");
    path.push("javac");
    if cfg!(windows) {
        path.set_extension("exe");
    }
    if !path.exists() {
        anyhow::bail!("javac not found at {}", path.display());
    }
    Ok(path)
}

fn run_command(mut command: Command, label: &str) -> Result<()> {
    let output = command.output().with_context(|| format!("run {label}"))?;
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("{label} failed: stdout={stdout} stderr={stderr}");
    }
    Ok(())
}

/// Assembles an already-decoded method body for stack and scanner tests.
///
/// Constant pool operands are written as zero; the decoded `InstructionKind` carries the
/// resolved reference instead.
pub(crate) struct MethodBodyBuilder {
    name: String,
    descriptor: String,
    is_static: bool,
    bytecode: Vec<u8>,
    instructions: Vec<Instruction>,
    line_numbers: Vec<LineNumber>,
    exception_handlers: Vec<ExceptionHandler>,
}

impl MethodBodyBuilder {
    pub(crate) fn instance(name: &str, descriptor: &str) -> Self {
        Self::new(name, descriptor, false)
    }

    pub(crate) fn static_method(name: &str, descriptor: &str) -> Self {
        Self::new(name, descriptor, true)
    }

    fn new(name: &str, descriptor: &str, is_static: bool) -> Self {
        Self {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            is_static,
            bytecode: Vec::new(),
            instructions: Vec::new(),
            line_numbers: Vec::new(),
            exception_handlers: Vec::new(),
        }
    }

    fn emit(mut self, bytes: &[u8], kind: InstructionKind) -> Self {
        self.instructions.push(Instruction {
            offset: self.bytecode.len() as u32,
            opcode: bytes[0],
            kind,
        });
        self.bytecode.extend_from_slice(bytes);
        self
    }

    pub(crate) fn op(self, opcode: u8) -> Self {
        self.emit(&[opcode], InstructionKind::Other)
    }

    pub(crate) fn aload(self, index: u8) -> Self {
        if index <= 3 {
            self.op(opcodes::ALOAD_0 + index)
        } else {
            self.emit(&[opcodes::ALOAD, index], InstructionKind::Other)
        }
    }

    pub(crate) fn astore(self, index: u8) -> Self {
        if index <= 3 {
            self.op(opcodes::ASTORE_0 + index)
        } else {
            self.emit(&[opcodes::ASTORE, index], InstructionKind::Other)
        }
    }

    pub(crate) fn ldc_string(self, value: &str) -> Self {
        self.emit(
            &[opcodes::LDC, 0],
            InstructionKind::ConstString(value.to_string()),
        )
    }

    pub(crate) fn branch(self, opcode: u8, relative: i16) -> Self {
        let [high, low] = relative.to_be_bytes();
        self.emit(&[opcode, high, low], InstructionKind::Other)
    }

    fn invoke(self, opcode: u8, kind: CallKind, owner: &str, name: &str, descriptor: &str) -> Self {
        let call = InstructionKind::Invoke(CallSite {
            owner: owner.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            kind,
        });
        if kind == CallKind::Interface {
            self.emit(&[opcode, 0, 0, 1, 0], call)
        } else {
            self.emit(&[opcode, 0, 0], call)
        }
    }

    pub(crate) fn invokevirtual(self, owner: &str, name: &str, descriptor: &str) -> Self {
        self.invoke(opcodes::INVOKEVIRTUAL, CallKind::Virtual, owner, name, descriptor)
    }

    pub(crate) fn invokeinterface(self, owner: &str, name: &str, descriptor: &str) -> Self {
        self.invoke(opcodes::INVOKEINTERFACE, CallKind::Interface, owner, name, descriptor)
    }

    pub(crate) fn invokespecial(self, owner: &str, name: &str, descriptor: &str) -> Self {
        self.invoke(opcodes::INVOKESPECIAL, CallKind::Special, owner, name, descriptor)
    }

    fn field(self, opcode: u8, owner: &str, name: &str, descriptor: &str) -> Self {
        let field = FieldRef {
            owner: owner.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        };
        self.emit(&[opcode, 0, 0], InstructionKind::Field(field))
    }

    pub(crate) fn getfield(self, owner: &str, name: &str, descriptor: &str) -> Self {
        self.field(opcodes::GETFIELD, owner, name, descriptor)
    }

    pub(crate) fn putfield(self, owner: &str, name: &str, descriptor: &str) -> Self {
        self.field(opcodes::PUTFIELD, owner, name, descriptor)
    }

    pub(crate) fn putstatic(self, owner: &str, name: &str, descriptor: &str) -> Self {
        self.field(opcodes::PUTSTATIC, owner, name, descriptor)
    }

    pub(crate) fn new_object(self, class_name: &str) -> Self {
        self.emit(
            &[opcodes::NEW, 0, 0],
            InstructionKind::TypeRef(class_name.to_string()),
        )
    }

    pub(crate) fn checkcast(self, class_name: &str) -> Self {
        self.emit(
            &[opcodes::CHECKCAST, 0, 0],
            InstructionKind::TypeRef(class_name.to_string()),
        )
    }

    /// Maps the next instruction to a source line.
    pub(crate) fn line(mut self, line: u32) -> Self {
        self.line_numbers.push(LineNumber {
            start_pc: self.bytecode.len() as u32,
            line,
        });
        self
    }

    /// Marks the next instruction as an exception handler entry.
    pub(crate) fn handler(mut self, catch_type: &str) -> Self {
        self.exception_handlers.push(ExceptionHandler {
            handler_pc: self.bytecode.len() as u32,
            catch_type: Some(catch_type.to_string()),
        });
        self
    }

    pub(crate) fn build(self) -> Method {
        Method {
            name: self.name,
            descriptor: self.descriptor,
            access: MethodAccess {
                is_static: self.is_static,
            },
            bytecode: self.bytecode,
            instructions: self.instructions,
            line_numbers: self.line_numbers,
            exception_handlers: self.exception_handlers,
        }
    }
}

/// Minimal class file writer for end-to-end tests without a JDK.
pub(crate) struct ClassFileBuilder {
    cp: Vec<CpEntry>,
    this_class: u16,
    super_class: u16,
    fields: Vec<(u16, u16)>,
    methods: Vec<MethodSpec>,
    code_index: u16,
    line_table_index: u16,
}

impl ClassFileBuilder {
    pub(crate) fn new(class_name: &str) -> Self {
        let mut builder = Self {
            cp: Vec::new(),
            this_class: 0,
            super_class: 0,
            fields: Vec::new(),
            methods: Vec::new(),
            code_index: 0,
            line_table_index: 0,
        };
        builder.code_index = builder.add_utf8("Code");
        builder.line_table_index = builder.add_utf8("LineNumberTable");
        builder.this_class = builder.add_class(class_name);
        builder.super_class = builder.add_class("java/lang/Object");
        builder
    }

    fn add_utf8(&mut self, value: &str) -> u16 {
        self.cp.push(CpEntry::Utf8(value.to_string()));
        self.cp.len() as u16
    }

    pub(crate) fn add_class(&mut self, name: &str) -> u16 {
        let name_index = self.add_utf8(name);
        self.cp.push(CpEntry::Class(name_index));
        self.cp.len() as u16
    }

    pub(crate) fn add_string(&mut self, value: &str) -> u16 {
        let value_index = self.add_utf8(value);
        self.cp.push(CpEntry::String(value_index));
        self.cp.len() as u16
    }

    fn add_member_ref(&mut self, tag: u8, class: &str, name: &str, descriptor: &str) -> u16 {
        let class_index = self.add_class(class);
        let name_index = self.add_utf8(name);
        let descriptor_index = self.add_utf8(descriptor);
        self.cp
            .push(CpEntry::NameAndType(name_index, descriptor_index));
        let name_and_type = self.cp.len() as u16;
        self.cp
            .push(CpEntry::MemberRef(tag, class_index, name_and_type));
        self.cp.len() as u16
    }

    pub(crate) fn add_field_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        self.add_member_ref(9, class, name, descriptor)
    }

    pub(crate) fn add_method_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        self.add_member_ref(10, class, name, descriptor)
    }

    pub(crate) fn add_interface_method_ref(
        &mut self,
        class: &str,
        name: &str,
        descriptor: &str,
    ) -> u16 {
        self.add_member_ref(11, class, name, descriptor)
    }

    pub(crate) fn add_field(&mut self, name: &str, descriptor: &str) {
        let name_index = self.add_utf8(name);
        let descriptor_index = self.add_utf8(descriptor);
        self.fields.push((name_index, descriptor_index));
    }

    /// Adds a public instance method; every instruction of `code` maps to `line`.
    pub(crate) fn add_method(
        &mut self,
        name: &str,
        descriptor: &str,
        code: Vec<u8>,
        max_stack: u16,
        max_locals: u16,
        line: u16,
    ) {
        let name_index = self.add_utf8(name);
        let descriptor_index = self.add_utf8(descriptor);
        self.methods.push(MethodSpec {
            name_index,
            descriptor_index,
            code,
            max_stack,
            max_locals,
            line,
        });
    }

    pub(crate) fn finish(self) -> Vec<u8> {
        let mut bytes = Vec::new();
        write_u32(&mut bytes, 0xCAFEBABE);
        write_u16(&mut bytes, 0);
        write_u16(&mut bytes, 52);
        write_u16(&mut bytes, (self.cp.len() + 1) as u16);
        for entry in &self.cp {
            entry.write(&mut bytes);
        }
        write_u16(&mut bytes, 0x0021);
        write_u16(&mut bytes, self.this_class);
        write_u16(&mut bytes, self.super_class);
        write_u16(&mut bytes, 0);
        write_u16(&mut bytes, self.fields.len() as u16);
        for (name_index, descriptor_index) in &self.fields {
            write_u16(&mut bytes, 0x0002);
            write_u16(&mut bytes, *name_index);
            write_u16(&mut bytes, *descriptor_index);
            write_u16(&mut bytes, 0);
        }
        write_u16(&mut bytes, self.methods.len() as u16);
        for method in &self.methods {
            write_u16(&mut bytes, 0x0001);
            write_u16(&mut bytes, method.name_index);
            write_u16(&mut bytes, method.descriptor_index);
            write_u16(&mut bytes, 1);
            write_u16(&mut bytes, self.code_index);
            // Code header, code, empty exception table, one LineNumberTable attribute.
            let line_table_len = 2 + 4;
            let attr_len = 12 + method.code.len() as u32 + 6 + line_table_len;
            write_u32(&mut bytes, attr_len);
            write_u16(&mut bytes, method.max_stack);
            write_u16(&mut bytes, method.max_locals);
            write_u32(&mut bytes, method.code.len() as u32);
            bytes.extend_from_slice(&method.code);
            write_u16(&mut bytes, 0);
            write_u16(&mut bytes, 1);
            write_u16(&mut bytes, self.line_table_index);
            write_u32(&mut bytes, line_table_len);
            write_u16(&mut bytes, 1);
            write_u16(&mut bytes, 0);
            write_u16(&mut bytes, method.line);
        }
        write_u16(&mut bytes, 0);
        bytes
    }
}

/// Method definition for generated class files.
struct MethodSpec {
    name_index: u16,
    descriptor_index: u16,
    code: Vec<u8>,
    max_stack: u16,
    max_locals: u16,
    line: u16,
}

/// Constant pool entries needed by generated class files.
enum CpEntry {
    Utf8(String),
    Class(u16),
    String(u16),
    NameAndType(u16, u16),
    /// Field, method or interface method ref, keyed by its tag.
    MemberRef(u8, u16, u16),
}

impl CpEntry {
    fn write(&self, bytes: &mut Vec<u8>) {
        match self {
            CpEntry::Utf8(value) => {
                bytes.push(1);
                write_u16(bytes, value.len() as u16);
                bytes.extend_from_slice(value.as_bytes());
            }
            CpEntry::Class(name_index) => {
                bytes.push(7);
                write_u16(bytes, *name_index);
            }
            CpEntry::String(value_index) => {
                bytes.push(8);
                write_u16(bytes, *value_index);
            }
            CpEntry::NameAndType(name_index, descriptor_index) => {
                bytes.push(12);
                write_u16(bytes, *name_index);
                write_u16(bytes, *descriptor_index);
            }
            CpEntry::MemberRef(tag, class_index, name_and_type) => {
                bytes.push(*tag);
                write_u16(bytes, *class_index);
                write_u16(bytes, *name_and_type);
            }
        }
    }
}

fn write_u16(bytes: &mut Vec<u8>, value: u16) {
    bytes.extend_from_slice(&value.to_be_bytes());
}

fn write_u32(bytes: &mut Vec<u8>, value: u32) {
    bytes.extend_from_slice(&value.to_be_bytes());
}

/// Big-endian operand bytes of a constant pool index.
pub(crate) fn index_bytes(index: u16) -> [u8; 2] {
    index.to_be_bytes()
}
