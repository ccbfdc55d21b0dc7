use crate::dataflow::opcode_semantics::{ApplyOutcome, SemanticsHooks};
use crate::dataflow::provenance::ProvenanceTag;
use crate::dataflow::stack_machine::OperandStack;
use crate::descriptor::{MethodSignature, STRING_SIGNATURE, method_signature};
use crate::impersonation::tables::RuleTables;
use crate::impersonation::{Diagnostic, DiagnosticKind, DiagnosticSink};
use crate::ir::{CallKind, Instruction, InstructionKind, Method, OpcodeCategory};

const STRING_TYPE: &str = "java/lang/String";
const TO_STRING: &str = "toString";
const TO_STRING_DESCRIPTOR: &str = "()Ljava/lang/String;";

/// Call being evaluated by the current instruction.
struct CallSiteDescriptor<'a> {
    owner: &'a str,
    name: &'a str,
    descriptor: &'a str,
    signature: MethodSignature,
    kind: CallKind,
}

impl<'a> CallSiteDescriptor<'a> {
    /// `None` for non-call instructions and for descriptors that do not parse.
    fn resolve(instruction: &'a Instruction) -> Option<Self> {
        let InstructionKind::Invoke(call) = &instruction.kind else {
            return None;
        };
        let signature = method_signature(&call.descriptor).ok()?;
        Some(Self {
            owner: &call.owner,
            name: &call.name,
            descriptor: &call.descriptor,
            signature,
            kind: call.kind,
        })
    }

    /// Stack depth of the receiver before the call executes.
    fn receiver_depth(&self) -> usize {
        self.signature.param_count()
    }

    fn is_to_string(&self) -> bool {
        self.name == TO_STRING && self.descriptor == TO_STRING_DESCRIPTOR
    }
}

/// Rule evaluation for one method, run as hooks around the stack simulation.
///
/// Rules read the stack before each instruction; a tag computed there is written onto the
/// value the instruction produced.
pub(crate) struct PatternScanner<'a, S: DiagnosticSink> {
    tables: &'a RuleTables,
    class_name: &'a str,
    sink: &'a mut S,
    pending_tag: Option<ProvenanceTag>,
}

impl<'a, S: DiagnosticSink> PatternScanner<'a, S> {
    pub(crate) fn new(tables: &'a RuleTables, class_name: &'a str, sink: &'a mut S) -> Self {
        Self {
            tables,
            class_name,
            sink,
            pending_tag: None,
        }
    }

    fn report(&mut self, kind: DiagnosticKind, method: &Method, instruction: &Instruction) {
        self.sink.report(Diagnostic {
            kind,
            class_name: self.class_name.to_string(),
            method_name: method.name.clone(),
            method_descriptor: method.descriptor.clone(),
            offset: instruction.offset,
            line: method.line_for_offset(instruction.offset),
        });
    }

    fn check_virtual_call(
        &mut self,
        stack: &OperandStack,
        method: &Method,
        instruction: &Instruction,
        call: &CallSiteDescriptor<'_>,
    ) {
        let is_builder = self.tables.is_builder_type(call.owner);
        if call.is_to_string() {
            self.pending_tag = if is_builder {
                stack.peek(0).and_then(|receiver| receiver.tag)
            } else {
                Some(ProvenanceTag::ToStringResult)
            };
        } else if is_builder && call.name == "append" {
            self.pending_tag = append_tag(stack, call);
        } else if call.owner == STRING_TYPE && self.tables.is_string_parse_method(call.name) {
            let Some(receiver) = stack.peek(call.receiver_depth()) else {
                return;
            };
            if receiver.field_origin.is_some()
                || receiver.tag == Some(ProvenanceTag::DerivedFromField)
            {
                self.report(DiagnosticKind::StringParsingAField, method, instruction);
            }
        }
    }

    fn check_interface_call(
        &mut self,
        stack: &OperandStack,
        method: &Method,
        instruction: &Instruction,
        call: &CallSiteDescriptor<'_>,
    ) {
        let tables = self.tables;
        let Some(spec) = tables.collection_method(call.owner, call.name, call.descriptor) else {
            return;
        };
        if spec.is_empty() {
            return;
        }
        let Some(receiver) = stack.peek(call.receiver_depth()) else {
            return;
        };
        if receiver.field_origin.is_none() {
            return;
        }
        let stores_to_string = spec.argument_depths().any(|depth| {
            stack
                .peek(depth)
                .is_some_and(|slot| slot.tag == Some(ProvenanceTag::ToStringResult))
        });
        if stores_to_string {
            self.report(DiagnosticKind::ToStringStoredInField, method, instruction);
        }
        if spec.tags_result() {
            self.pending_tag = Some(ProvenanceTag::DerivedFromField);
        }
    }

    fn check_field_store(&mut self, stack: &OperandStack, method: &Method, instruction: &Instruction) {
        let stored = stack.peek(0).and_then(|slot| slot.tag);
        if stored == Some(ProvenanceTag::ToStringResult) {
            self.report(DiagnosticKind::ToStringStoredInField, method, instruction);
        }
    }
}

/// Tag carried by a builder after `append`.
///
/// The appended value's own tag is consulted before the non-string check, so a builder fed
/// an already tagged string keeps that tag.
fn append_tag(stack: &OperandStack, call: &CallSiteDescriptor<'_>) -> Option<ProvenanceTag> {
    let receiver_tag = stack
        .peek(call.receiver_depth())
        .and_then(|receiver| receiver.tag);
    if receiver_tag.is_some() {
        return receiver_tag;
    }
    let appended = stack.peek(call.receiver_depth().checked_sub(1)?)?;
    if appended.tag.is_some() {
        return appended.tag;
    }
    (appended.signature != STRING_SIGNATURE).then_some(ProvenanceTag::ToStringResult)
}

impl<S: DiagnosticSink> SemanticsHooks for PatternScanner<'_, S> {
    fn before_effect(&mut self, stack: &OperandStack, method: &Method, instruction: &Instruction) {
        self.pending_tag = None;
        match instruction.category() {
            OpcodeCategory::VirtualCall | OpcodeCategory::InterfaceCall => {
                let Some(call) = CallSiteDescriptor::resolve(instruction) else {
                    return;
                };
                match call.kind {
                    CallKind::Virtual => self.check_virtual_call(stack, method, instruction, &call),
                    CallKind::Interface => {
                        self.check_interface_call(stack, method, instruction, &call)
                    }
                    CallKind::Special | CallKind::Static => {}
                }
            }
            OpcodeCategory::FieldStore => self.check_field_store(stack, method, instruction),
            OpcodeCategory::Other => {}
        }
    }

    fn after_effect(
        &mut self,
        stack: &mut OperandStack,
        _method: &Method,
        _instruction: &Instruction,
        outcome: ApplyOutcome,
    ) {
        let Some(tag) = self.pending_tag.take() else {
            return;
        };
        if outcome == ApplyOutcome::Produced {
            stack.set_tag_on_top(tag);
        }
    }
}
