use crate::opcodes;

/// Intermediate representation for parsed JVM classes and methods.
#[derive(Clone, Debug)]
pub(crate) struct Class {
    pub(crate) name: String,
    pub(crate) methods: Vec<Method>,
    pub(crate) artifact_index: i64,
    /// Methods dropped because their bytecode could not be decoded.
    pub(crate) skipped_methods: usize,
}

/// Intermediate representation for a method and its decoded bytecode.
#[derive(Clone, Debug)]
pub(crate) struct Method {
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) access: MethodAccess,
    pub(crate) bytecode: Vec<u8>,
    pub(crate) instructions: Vec<Instruction>,
    pub(crate) line_numbers: Vec<LineNumber>,
    pub(crate) exception_handlers: Vec<ExceptionHandler>,
}

impl Method {
    /// Source line covering the given bytecode offset, if a line table is present.
    pub(crate) fn line_for_offset(&self, offset: u32) -> Option<u32> {
        self.line_numbers
            .iter()
            .take_while(|entry| entry.start_pc <= offset)
            .last()
            .map(|entry| entry.line)
    }
}

/// Access flags relevant to stack simulation.
#[derive(Clone, Copy, Debug)]
pub(crate) struct MethodAccess {
    pub(crate) is_static: bool,
}

/// Line number table entry.
#[derive(Clone, Copy, Debug)]
pub(crate) struct LineNumber {
    pub(crate) start_pc: u32,
    pub(crate) line: u32,
}

/// Exception table entry; only the handler entry point matters for stack simulation.
#[derive(Clone, Debug)]
pub(crate) struct ExceptionHandler {
    pub(crate) handler_pc: u32,
    pub(crate) catch_type: Option<String>,
}

/// Bytecode instruction captured for analysis.
#[derive(Clone, Debug)]
pub(crate) struct Instruction {
    pub(crate) offset: u32,
    pub(crate) opcode: u8,
    pub(crate) kind: InstructionKind,
}

/// Operand-resolved view of an instruction.
#[derive(Clone, Debug)]
pub(crate) enum InstructionKind {
    Invoke(CallSite),
    InvokeDynamic { descriptor: String },
    Field(FieldRef),
    ConstString(String),
    /// Non-string `ldc` constant, carrying the pushed type signature.
    Constant(String),
    /// Class operand of `new`, `anewarray`, `checkcast`, `instanceof` or `multianewarray`.
    TypeRef(String),
    Other,
}

/// Coarse instruction classes the impersonation rules care about.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum OpcodeCategory {
    VirtualCall,
    InterfaceCall,
    FieldStore,
    Other,
}

impl Instruction {
    pub(crate) fn category(&self) -> OpcodeCategory {
        match (&self.kind, self.opcode) {
            (InstructionKind::Invoke(call), _) if call.kind == CallKind::Virtual => {
                OpcodeCategory::VirtualCall
            }
            (InstructionKind::Invoke(call), _) if call.kind == CallKind::Interface => {
                OpcodeCategory::InterfaceCall
            }
            (InstructionKind::Field(_), opcodes::PUTFIELD) => {
                OpcodeCategory::FieldStore
            }
            _ => OpcodeCategory::Other,
        }
    }
}

/// Call site extracted from bytecode.
#[derive(Clone, Debug)]
pub(crate) struct CallSite {
    pub(crate) owner: String,
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) kind: CallKind,
}

/// Call opcode classification.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) enum CallKind {
    Virtual,
    Interface,
    Special,
    Static,
}

/// Field reference resolved from the constant pool.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) struct FieldRef {
    pub(crate) owner: String,
    pub(crate) name: String,
    pub(crate) descriptor: String,
}
