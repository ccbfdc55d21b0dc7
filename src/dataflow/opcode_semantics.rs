use std::collections::BTreeMap;
use std::sync::OnceLock;

use opentelemetry::KeyValue;
use tracing::info;

use crate::dataflow::stack_machine::{OperandStack, StackSlot};
use crate::descriptor::{OBJECT_SIGNATURE, STRING_SIGNATURE, method_signature, object_signature};
use crate::ir::{CallKind, Instruction, InstructionKind, Method};
use crate::opcodes;
use crate::scan::{padding, read_u16, read_u32};

/// Result of applying one instruction to the stack model.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) enum ApplyOutcome {
    /// The instruction consumed its operands and pushed one new result value.
    Produced,
    /// The effect was applied without producing a fresh result value.
    Applied,
    /// The effect is unknown; the stack was cleared.
    NotHandled,
}

/// Optional debug controls for opcode semantics instrumentation.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) struct SemanticsDebugConfig {
    pub(crate) enabled: bool,
    pub(crate) rule_id: &'static str,
}

/// Coverage counters for opcode semantics execution.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct SemanticsCoverage {
    pub(crate) applied: usize,
    pub(crate) fallback_not_handled: usize,
    fallback_opcodes: BTreeMap<u8, usize>,
}

impl SemanticsCoverage {
    fn record_apply(&mut self) {
        self.applied += 1;
    }

    fn record_fallback(&mut self, opcode: u8) {
        self.fallback_not_handled += 1;
        *self.fallback_opcodes.entry(opcode).or_insert(0) += 1;
    }

    /// Returns how often a specific opcode could not be simulated.
    pub(crate) fn fallback_count(&self, opcode: u8) -> usize {
        self.fallback_opcodes.get(&opcode).copied().unwrap_or(0)
    }

    /// Merges another coverage snapshot into this one.
    pub(crate) fn merge_from(&mut self, other: &SemanticsCoverage) {
        self.applied += other.applied;
        self.fallback_not_handled += other.fallback_not_handled;
        for (opcode, count) in &other.fallback_opcodes {
            *self.fallback_opcodes.entry(*opcode).or_insert(0) += count;
        }
    }
}

/// Rule hook points around every simulated instruction.
pub(crate) trait SemanticsHooks {
    /// Sees the stack as it is before the instruction executes.
    fn before_effect(&mut self, _stack: &OperandStack, _method: &Method, _instruction: &Instruction) {
    }

    /// Runs once the instruction's effect has been applied.
    fn after_effect(
        &mut self,
        _stack: &mut OperandStack,
        _method: &Method,
        _instruction: &Instruction,
        _outcome: ApplyOutcome,
    ) {
    }
}

/// Simulates a whole method body in program order with a fresh stack model.
pub(crate) fn simulate_method<H>(
    class_name: &str,
    method: &Method,
    hooks: &mut H,
    coverage: &mut SemanticsCoverage,
    debug_config: SemanticsDebugConfig,
) where
    H: SemanticsHooks,
{
    let mut handlers: BTreeMap<u32, &str> = BTreeMap::new();
    for handler in &method.exception_handlers {
        let caught = handler.catch_type.as_deref().unwrap_or("java/lang/Throwable");
        handlers.entry(handler.handler_pc).or_insert(caught);
    }

    let mut stack = OperandStack::for_method(class_name, method);
    for instruction in &method.instructions {
        stack.enter(instruction.offset, handlers.get(&instruction.offset).copied());
        apply_semantics(&mut stack, method, instruction, hooks, coverage, debug_config);
    }
}

/// Applies table-driven semantics for one instruction, surrounded by the rule hooks.
pub(crate) fn apply_semantics<H>(
    stack: &mut OperandStack,
    method: &Method,
    instruction: &Instruction,
    hooks: &mut H,
    coverage: &mut SemanticsCoverage,
    debug_config: SemanticsDebugConfig,
) -> ApplyOutcome
where
    H: SemanticsHooks,
{
    hooks.before_effect(stack, method, instruction);

    let outcome = match decode(method, instruction) {
        Some(effect) => apply_effect(stack, method, instruction, effect),
        None => ApplyOutcome::NotHandled,
    };
    if outcome == ApplyOutcome::NotHandled {
        stack.clear();
        coverage.record_fallback(instruction.opcode);
        if debug_config.enabled {
            info!(
                "opcode_semantics debug: rule={} offset={} opcode=0x{:02x} event=fallback",
                debug_config.rule_id, instruction.offset, instruction.opcode
            );
        }
    } else {
        coverage.record_apply();
    }

    hooks.after_effect(stack, method, instruction, outcome);
    outcome
}

/// Returns whether opcode semantics debug logging is enabled.
pub(crate) fn opcode_semantics_debug_enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| {
        std::env::var("CISLINT_DEBUG_OPCODE_SEMANTICS")
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    })
}

/// Emits one summary event for opcode semantics fallback counters.
pub(crate) fn emit_opcode_semantics_summary_event(rule_id: &str, coverage: &SemanticsCoverage) {
    let invoke_fallbacks = coverage.fallback_count(opcodes::INVOKEVIRTUAL)
        + coverage.fallback_count(opcodes::INVOKESPECIAL)
        + coverage.fallback_count(opcodes::INVOKESTATIC)
        + coverage.fallback_count(opcodes::INVOKEINTERFACE)
        + coverage.fallback_count(opcodes::INVOKEDYNAMIC);
    let attributes = [
        KeyValue::new("cislint.rule_id", rule_id.to_string()),
        KeyValue::new("cislint.debug_summary", "opcode_semantics"),
        KeyValue::new(
            "cislint.fallback_count",
            coverage.fallback_not_handled as i64,
        ),
        KeyValue::new("cislint.apply_count", coverage.applied as i64),
        KeyValue::new("cislint.invoke_fallback_count", invoke_fallbacks as i64),
    ];
    crate::telemetry::add_current_span_event("cislint.debug.summary", &attributes);
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Effect {
    Noop,
    Push(&'static str),
    PushConstant,
    LoadLocal {
        slot: LocalSlot,
        fallback: &'static str,
    },
    StoreLocal(LocalSlot),
    Pop(usize),
    PopWords(usize),
    Dup {
        copy_words: usize,
        skip_words: usize,
    },
    Swap,
    PopAndPush {
        pop_count: usize,
        push: &'static str,
    },
    ArrayElementLoad,
    GetField,
    GetStatic,
    Invoke,
    InvokeDynamic,
    New,
    NewArray,
    ANewArray,
    MultiANewArray,
    CheckCast,
    Branch {
        pop_count: usize,
        conditional: bool,
    },
    Jsr,
    Switch,
    Exit {
        pop_count: usize,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum LocalSlot {
    OperandU8,
    OperandWide,
    Fixed(usize),
}

fn apply_effect(
    stack: &mut OperandStack,
    method: &Method,
    instruction: &Instruction,
    effect: Effect,
) -> ApplyOutcome {
    let offset = instruction.offset as usize;
    match effect {
        Effect::Noop => {}
        Effect::Push(signature) => stack.push(StackSlot::of_type(signature)),
        Effect::PushConstant => {
            let signature = match &instruction.kind {
                InstructionKind::ConstString(_) => STRING_SIGNATURE,
                InstructionKind::Constant(signature) => signature.as_str(),
                _ => OBJECT_SIGNATURE,
            };
            stack.push(StackSlot::of_type(signature));
        }
        Effect::LoadLocal { slot, fallback } => {
            let value = match local_index(method, offset, slot) {
                Some(index) => stack.load_local(index),
                None => None,
            };
            stack.push(value.unwrap_or_else(|| StackSlot::of_type(fallback)));
        }
        Effect::StoreLocal(slot) => {
            let Some(value) = stack.pop() else {
                return ApplyOutcome::Applied;
            };
            if let Some(index) = local_index(method, offset, slot) {
                stack.store_local(index, value);
            }
        }
        Effect::Pop(count) => stack.pop_n(count),
        Effect::PopWords(words) => stack.pop_words(words),
        Effect::Dup {
            copy_words,
            skip_words,
        } => stack.dup_words(copy_words, skip_words),
        Effect::Swap => stack.swap(),
        Effect::PopAndPush { pop_count, push } => {
            stack.apply_effect(pop_count, Some(StackSlot::of_type(push)));
            return ApplyOutcome::Produced;
        }
        Effect::ArrayElementLoad => {
            stack.pop();
            let element = match stack.pop() {
                Some(array) if array.signature.starts_with('[') => array.signature[1..].to_string(),
                _ => OBJECT_SIGNATURE.to_string(),
            };
            stack.push(StackSlot::of_type(element));
            return ApplyOutcome::Produced;
        }
        Effect::GetField | Effect::GetStatic => {
            let InstructionKind::Field(field) = &instruction.kind else {
                return ApplyOutcome::NotHandled;
            };
            let pop_count = usize::from(effect == Effect::GetField);
            stack.apply_effect(pop_count, Some(StackSlot::from_field(field)));
            return ApplyOutcome::Produced;
        }
        Effect::Invoke => {
            let InstructionKind::Invoke(call) = &instruction.kind else {
                return ApplyOutcome::NotHandled;
            };
            let Ok(signature) = method_signature(&call.descriptor) else {
                return ApplyOutcome::NotHandled;
            };
            let receiver = usize::from(call.kind != CallKind::Static);
            let pushed = signature.return_type.clone().map(StackSlot::of_type);
            if stack.apply_effect(signature.param_count() + receiver, pushed) {
                return ApplyOutcome::Produced;
            }
        }
        Effect::InvokeDynamic => {
            let InstructionKind::InvokeDynamic { descriptor } = &instruction.kind else {
                return ApplyOutcome::NotHandled;
            };
            let Ok(signature) = method_signature(descriptor) else {
                return ApplyOutcome::NotHandled;
            };
            let pushed = signature.return_type.clone().map(StackSlot::of_type);
            if stack.apply_effect(signature.param_count(), pushed) {
                return ApplyOutcome::Produced;
            }
        }
        Effect::New => {
            let InstructionKind::TypeRef(class_name) = &instruction.kind else {
                return ApplyOutcome::NotHandled;
            };
            stack.push(StackSlot::of_type(object_signature(class_name)));
            return ApplyOutcome::Produced;
        }
        Effect::NewArray => {
            let element = match method.bytecode.get(offset + 1).copied() {
                Some(4) => "Z",
                Some(5) => "C",
                Some(6) => "F",
                Some(7) => "D",
                Some(8) => "B",
                Some(9) => "S",
                Some(11) => "J",
                _ => "I",
            };
            stack.apply_effect(1, Some(StackSlot::of_type(format!("[{element}"))));
            return ApplyOutcome::Produced;
        }
        Effect::ANewArray => {
            let InstructionKind::TypeRef(class_name) = &instruction.kind else {
                return ApplyOutcome::NotHandled;
            };
            let signature = format!("[{}", object_signature(class_name));
            stack.apply_effect(1, Some(StackSlot::of_type(signature)));
            return ApplyOutcome::Produced;
        }
        Effect::MultiANewArray => {
            let InstructionKind::TypeRef(class_name) = &instruction.kind else {
                return ApplyOutcome::NotHandled;
            };
            let dims = method.bytecode.get(offset + 3).copied().unwrap_or(1) as usize;
            stack.apply_effect(dims, Some(StackSlot::of_type(object_signature(class_name))));
            return ApplyOutcome::Produced;
        }
        Effect::CheckCast => {
            let InstructionKind::TypeRef(class_name) = &instruction.kind else {
                return ApplyOutcome::NotHandled;
            };
            let mut value = stack
                .pop()
                .unwrap_or_else(|| StackSlot::of_type(OBJECT_SIGNATURE));
            value.signature = object_signature(class_name);
            stack.push(value);
        }
        Effect::Branch {
            pop_count,
            conditional,
        } => {
            stack.pop_n(pop_count);
            let Some(target) = branch_target(method, instruction) else {
                return ApplyOutcome::NotHandled;
            };
            if target > instruction.offset {
                stack.record_jump(target);
            }
            if !conditional {
                stack.mark_unreachable();
            }
        }
        Effect::Jsr => {
            let Some(target) = branch_target(method, instruction) else {
                return ApplyOutcome::NotHandled;
            };
            if target > instruction.offset {
                let mut entry: Vec<StackSlot> = (0..stack.depth())
                    .rev()
                    .filter_map(|depth| stack.peek(depth).cloned())
                    .collect();
                entry.push(StackSlot::of_type(OBJECT_SIGNATURE));
                stack.record_jump_with(target, entry);
            }
        }
        Effect::Switch => {
            stack.pop();
            let Some(targets) = switch_targets(method, offset) else {
                return ApplyOutcome::NotHandled;
            };
            for target in targets {
                if target > instruction.offset {
                    stack.record_jump(target);
                }
            }
            stack.mark_unreachable();
        }
        Effect::Exit { pop_count } => {
            stack.pop_n(pop_count);
            stack.mark_unreachable();
        }
    }
    ApplyOutcome::Applied
}

fn decode(method: &Method, instruction: &Instruction) -> Option<Effect> {
    let effect = match instruction.opcode {
        opcodes::NOP => Effect::Noop,
        opcodes::ACONST_NULL => Effect::Push(OBJECT_SIGNATURE),
        opcodes::ICONST_M1..=opcodes::ICONST_5 | opcodes::BIPUSH | opcodes::SIPUSH => {
            Effect::Push("I")
        }
        opcodes::LCONST_0 | opcodes::LCONST_1 => Effect::Push("J"),
        opcodes::FCONST_0..=opcodes::FCONST_2 => Effect::Push("F"),
        opcodes::DCONST_0 | opcodes::DCONST_1 => Effect::Push("D"),
        opcodes::LDC | opcodes::LDC_W | opcodes::LDC2_W => Effect::PushConstant,
        opcodes::ILOAD..=opcodes::ALOAD => Effect::LoadLocal {
            slot: LocalSlot::OperandU8,
            fallback: load_type(instruction.opcode - opcodes::ILOAD),
        },
        opcodes::ILOAD_0..=opcodes::ALOAD_3 => {
            let relative = instruction.opcode - opcodes::ILOAD_0;
            Effect::LoadLocal {
                slot: LocalSlot::Fixed(usize::from(relative % 4)),
                fallback: load_type(relative / 4),
            }
        }
        opcodes::IALOAD..=opcodes::SALOAD => match instruction.opcode {
            opcodes::AALOAD => Effect::ArrayElementLoad,
            opcode => Effect::PopAndPush {
                pop_count: 2,
                push: array_load_type(opcode),
            },
        },
        opcodes::ISTORE..=opcodes::ASTORE => Effect::StoreLocal(LocalSlot::OperandU8),
        opcodes::ISTORE_0..=opcodes::ASTORE_3 => {
            let relative = instruction.opcode - opcodes::ISTORE_0;
            Effect::StoreLocal(LocalSlot::Fixed(usize::from(relative % 4)))
        }
        opcodes::IASTORE..=opcodes::SASTORE => Effect::Pop(3),
        opcodes::POP => Effect::PopWords(1),
        opcodes::POP2 => Effect::PopWords(2),
        opcodes::DUP => Effect::Dup {
            copy_words: 1,
            skip_words: 0,
        },
        opcodes::DUP_X1 => Effect::Dup {
            copy_words: 1,
            skip_words: 1,
        },
        opcodes::DUP_X2 => Effect::Dup {
            copy_words: 1,
            skip_words: 2,
        },
        opcodes::DUP2 => Effect::Dup {
            copy_words: 2,
            skip_words: 0,
        },
        opcodes::DUP2_X1 => Effect::Dup {
            copy_words: 2,
            skip_words: 1,
        },
        opcodes::DUP2_X2 => Effect::Dup {
            copy_words: 2,
            skip_words: 2,
        },
        opcodes::SWAP => Effect::Swap,
        // Binary arithmetic cycles through int, long, float, double.
        opcodes::IADD..=opcodes::DREM => Effect::PopAndPush {
            pop_count: 2,
            push: numeric_type((instruction.opcode - opcodes::IADD) % 4),
        },
        opcodes::INEG..=opcodes::DNEG => Effect::PopAndPush {
            pop_count: 1,
            push: numeric_type(instruction.opcode - opcodes::INEG),
        },
        // Shifts and bitwise operations alternate int and long.
        opcodes::ISHL..=opcodes::LXOR => Effect::PopAndPush {
            pop_count: 2,
            push: if (instruction.opcode - opcodes::ISHL) % 2 == 0 {
                "I"
            } else {
                "J"
            },
        },
        opcodes::IINC => Effect::Noop,
        opcodes::I2L..=opcodes::I2S => Effect::PopAndPush {
            pop_count: 1,
            push: conversion_type(instruction.opcode),
        },
        opcodes::LCMP..=opcodes::DCMPG => Effect::PopAndPush {
            pop_count: 2,
            push: "I",
        },
        opcodes::IFEQ..=opcodes::IFLE | opcodes::IFNULL | opcodes::IFNONNULL => Effect::Branch {
            pop_count: 1,
            conditional: true,
        },
        opcodes::IF_ICMPEQ..=opcodes::IF_ACMPNE => Effect::Branch {
            pop_count: 2,
            conditional: true,
        },
        opcodes::GOTO | opcodes::GOTO_W => Effect::Branch {
            pop_count: 0,
            conditional: false,
        },
        opcodes::JSR | opcodes::JSR_W => Effect::Jsr,
        opcodes::RET => Effect::Exit { pop_count: 0 },
        opcodes::TABLESWITCH | opcodes::LOOKUPSWITCH => Effect::Switch,
        opcodes::IRETURN..=opcodes::ARETURN | opcodes::ATHROW => Effect::Exit { pop_count: 1 },
        opcodes::RETURN => Effect::Exit { pop_count: 0 },
        opcodes::GETSTATIC => Effect::GetStatic,
        opcodes::PUTSTATIC => Effect::Pop(1),
        opcodes::GETFIELD => Effect::GetField,
        opcodes::PUTFIELD => Effect::Pop(2),
        opcodes::INVOKEVIRTUAL
        | opcodes::INVOKESPECIAL
        | opcodes::INVOKESTATIC
        | opcodes::INVOKEINTERFACE => Effect::Invoke,
        opcodes::INVOKEDYNAMIC => Effect::InvokeDynamic,
        opcodes::NEW => Effect::New,
        opcodes::NEWARRAY => Effect::NewArray,
        opcodes::ANEWARRAY => Effect::ANewArray,
        opcodes::ARRAYLENGTH | opcodes::INSTANCEOF => Effect::PopAndPush {
            pop_count: 1,
            push: "I",
        },
        opcodes::CHECKCAST => Effect::CheckCast,
        opcodes::MONITORENTER | opcodes::MONITOREXIT => Effect::Pop(1),
        opcodes::MULTIANEWARRAY => Effect::MultiANewArray,
        opcodes::WIDE => decode_wide(method, instruction)?,
        _ => return None,
    };
    Some(effect)
}

fn decode_wide(method: &Method, instruction: &Instruction) -> Option<Effect> {
    let inner = method
        .bytecode
        .get(instruction.offset as usize + 1)
        .copied()?;
    let effect = match inner {
        opcodes::ILOAD..=opcodes::ALOAD => Effect::LoadLocal {
            slot: LocalSlot::OperandWide,
            fallback: load_type(inner - opcodes::ILOAD),
        },
        opcodes::ISTORE..=opcodes::ASTORE => Effect::StoreLocal(LocalSlot::OperandWide),
        opcodes::IINC => Effect::Noop,
        opcodes::RET => Effect::Exit { pop_count: 0 },
        _ => return None,
    };
    Some(effect)
}

fn load_type(kind: u8) -> &'static str {
    match kind {
        0 => "I",
        1 => "J",
        2 => "F",
        3 => "D",
        _ => OBJECT_SIGNATURE,
    }
}

fn numeric_type(kind: u8) -> &'static str {
    match kind {
        0 => "I",
        1 => "J",
        2 => "F",
        _ => "D",
    }
}

fn array_load_type(opcode: u8) -> &'static str {
    match opcode - opcodes::IALOAD {
        1 => "J",
        2 => "F",
        3 => "D",
        _ => "I",
    }
}

fn conversion_type(opcode: u8) -> &'static str {
    // i2l i2f i2d l2i l2f l2d f2i f2l f2d d2i d2l d2f i2b i2c i2s
    const TARGETS: [&str; 15] = [
        "J", "F", "D", "I", "F", "D", "I", "J", "D", "I", "J", "F", "I", "I", "I",
    ];
    TARGETS
        .get(usize::from(opcode - opcodes::I2L))
        .copied()
        .unwrap_or("I")
}

fn local_index(method: &Method, offset: usize, slot: LocalSlot) -> Option<usize> {
    match slot {
        LocalSlot::OperandU8 => method.bytecode.get(offset + 1).map(|index| usize::from(*index)),
        LocalSlot::OperandWide => read_u16(&method.bytecode, offset + 2)
            .ok()
            .map(usize::from),
        LocalSlot::Fixed(index) => Some(index),
    }
}

fn branch_target(method: &Method, instruction: &Instruction) -> Option<u32> {
    let offset = instruction.offset as usize;
    let relative = match instruction.opcode {
        opcodes::GOTO_W | opcodes::JSR_W => read_u32(&method.bytecode, offset + 1).ok()? as i32 as i64,
        _ => read_u16(&method.bytecode, offset + 1).ok()? as i16 as i64,
    };
    u32::try_from(i64::from(instruction.offset) + relative).ok()
}

fn switch_targets(method: &Method, offset: usize) -> Option<Vec<u32>> {
    let code = &method.bytecode;
    let base = offset + 1 + padding(offset);
    let target = |relative: u32| u32::try_from(offset as i64 + i64::from(relative as i32)).ok();
    let mut targets = vec![target(read_u32(code, base).ok()?)?];
    match code.get(offset).copied()? {
        opcodes::TABLESWITCH => {
            let low = read_u32(code, base + 4).ok()? as i32;
            let high = read_u32(code, base + 8).ok()? as i32;
            let count = usize::try_from(i64::from(high) - i64::from(low) + 1).ok()?;
            for index in 0..count {
                targets.push(target(read_u32(code, base + 12 + index * 4).ok()?)?);
            }
        }
        _ => {
            let pairs = usize::try_from(read_u32(code, base + 4).ok()? as i32).ok()?;
            for index in 0..pairs {
                targets.push(target(read_u32(code, base + 8 + index * 8 + 4).ok()?)?);
            }
        }
    }
    Some(targets)
}
