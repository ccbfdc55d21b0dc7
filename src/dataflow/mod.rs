//! Forward abstract interpretation of method bodies over a tagged operand stack.

pub(crate) mod opcode_semantics;
pub(crate) mod provenance;
pub(crate) mod stack_machine;
