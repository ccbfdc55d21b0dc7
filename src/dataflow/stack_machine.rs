use std::collections::BTreeMap;

use crate::dataflow::provenance::ProvenanceTag;
use crate::descriptor::{is_wide, method_signature, object_signature};
use crate::ir::{FieldRef, Method};

/// One simulated operand stack entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct StackSlot {
    pub(crate) signature: String,
    /// Set only when the value was loaded straight from a field.
    pub(crate) field_origin: Option<FieldRef>,
    pub(crate) tag: Option<ProvenanceTag>,
}

impl StackSlot {
    pub(crate) fn of_type(signature: impl Into<String>) -> Self {
        Self {
            signature: signature.into(),
            field_origin: None,
            tag: None,
        }
    }

    pub(crate) fn from_field(field: &FieldRef) -> Self {
        Self {
            signature: field.descriptor.clone(),
            field_origin: Some(field.clone()),
            tag: None,
        }
    }

    fn words(&self) -> usize {
        if is_wide(&self.signature) { 2 } else { 1 }
    }

    fn join(&self, other: &StackSlot) -> StackSlot {
        let field_origin = if self.field_origin == other.field_origin {
            self.field_origin.clone()
        } else {
            None
        };
        StackSlot {
            signature: self.signature.clone(),
            field_origin,
            tag: ProvenanceTag::join(self.tag, other.tag),
        }
    }
}

/// Operand stack and local variables of a single method under simulation.
///
/// Built fresh for every method and dropped when the method is done, so no state
/// leaks between methods.
#[derive(Clone, Debug, Default)]
pub(crate) struct OperandStack {
    slots: Vec<StackSlot>,
    locals: Vec<Option<StackSlot>>,
    jump_entries: BTreeMap<u32, Vec<StackSlot>>,
    reachable: bool,
}

impl OperandStack {
    /// Empty stack with locals seeded from the method descriptor.
    pub(crate) fn for_method(class_name: &str, method: &Method) -> Self {
        let mut stack = Self {
            reachable: true,
            ..Self::default()
        };
        if !method.access.is_static {
            stack.locals.push(Some(StackSlot::of_type(object_signature(class_name))));
        }
        if let Ok(signature) = method_signature(&method.descriptor) {
            for parameter in signature.parameters {
                let wide = is_wide(&parameter);
                stack.locals.push(Some(StackSlot::of_type(parameter)));
                if wide {
                    stack.locals.push(None);
                }
            }
        }
        stack
    }

    pub(crate) fn depth(&self) -> usize {
        self.slots.len()
    }

    /// Slot `depth_from_top` entries below the top; `None` when the stack is too shallow.
    pub(crate) fn peek(&self, depth_from_top: usize) -> Option<&StackSlot> {
        let index = self.slots.len().checked_sub(depth_from_top + 1)?;
        self.slots.get(index)
    }

    /// Pops `pop_count` values, then pushes the produced value if any.
    ///
    /// Returns whether a value was pushed.
    pub(crate) fn apply_effect(&mut self, pop_count: usize, pushed: Option<StackSlot>) -> bool {
        self.pop_n(pop_count);
        match pushed {
            Some(slot) => {
                self.slots.push(slot);
                true
            }
            None => false,
        }
    }

    /// Overwrites the provenance tag of the top slot.
    pub(crate) fn set_tag_on_top(&mut self, tag: ProvenanceTag) {
        if let Some(top) = self.slots.last_mut() {
            top.tag = Some(tag);
        }
    }

    pub(crate) fn push(&mut self, slot: StackSlot) {
        self.slots.push(slot);
    }

    pub(crate) fn pop(&mut self) -> Option<StackSlot> {
        self.slots.pop()
    }

    pub(crate) fn pop_n(&mut self, count: usize) {
        let keep = self.slots.len().saturating_sub(count);
        self.slots.truncate(keep);
    }

    /// Pops values until `words` stack words are consumed (`pop`, `pop2`).
    pub(crate) fn pop_words(&mut self, words: usize) {
        let count = self.values_spanning(words);
        self.pop_n(count);
    }

    /// Copies the top `copy_words` words and inserts them below the next `skip_words`
    /// words, covering every `dup` form.
    pub(crate) fn dup_words(&mut self, copy_words: usize, skip_words: usize) {
        let copy_count = self.values_spanning(copy_words);
        let skip_count = self.values_spanning_from(copy_count, skip_words);
        if copy_count == 0 || copy_count + skip_count > self.slots.len() {
            return;
        }
        let len = self.slots.len();
        let copies: Vec<StackSlot> = self.slots[len - copy_count..].to_vec();
        let insert_at = len - copy_count - skip_count;
        self.slots.splice(insert_at..insert_at, copies);
    }

    pub(crate) fn swap(&mut self) {
        let len = self.slots.len();
        if len >= 2 {
            self.slots.swap(len - 1, len - 2);
        }
    }

    pub(crate) fn clear(&mut self) {
        self.slots.clear();
    }

    /// Value held by a local; loading never carries a field origin.
    pub(crate) fn load_local(&self, index: usize) -> Option<StackSlot> {
        self.locals.get(index).cloned().flatten()
    }

    pub(crate) fn store_local(&mut self, index: usize, mut slot: StackSlot) {
        slot.field_origin = None;
        if index >= self.locals.len() {
            self.locals.resize(index + 1, None);
        }
        let wide = slot.words() == 2;
        self.locals[index] = Some(slot);
        if wide && index + 1 < self.locals.len() {
            self.locals[index + 1] = None;
        }
    }

    /// Records the current stack as the entry state of a branch target.
    pub(crate) fn record_jump(&mut self, target: u32) {
        let slots = self.slots.clone();
        self.record_jump_with(target, slots);
    }

    pub(crate) fn record_jump_with(&mut self, target: u32, slots: Vec<StackSlot>) {
        match self.jump_entries.get_mut(&target) {
            Some(existing) if existing.len() == slots.len() => {
                for (current, incoming) in existing.iter_mut().zip(&slots) {
                    *current = current.join(incoming);
                }
            }
            Some(_) => {}
            None => {
                self.jump_entries.insert(target, slots);
            }
        }
    }

    /// Control does not fall through to the next instruction.
    pub(crate) fn mark_unreachable(&mut self) {
        self.reachable = false;
    }

    /// Establishes the stack at the start of the instruction at `offset`.
    ///
    /// `handler_type` is the caught type when `offset` starts an exception handler.
    pub(crate) fn enter(&mut self, offset: u32, handler_type: Option<&str>) {
        let recorded = self.jump_entries.remove(&offset);
        if let Some(caught) = handler_type {
            self.slots = vec![StackSlot::of_type(object_signature(caught))];
        } else if !self.reachable {
            self.slots = recorded.unwrap_or_default();
        } else if let Some(recorded) = recorded {
            if recorded.len() == self.slots.len() {
                for (current, incoming) in self.slots.iter_mut().zip(&recorded) {
                    *current = current.join(incoming);
                }
            }
        }
        self.reachable = true;
    }

    fn values_spanning(&self, words: usize) -> usize {
        self.values_spanning_from(0, words)
    }

    fn values_spanning_from(&self, skip_values: usize, words: usize) -> usize {
        let mut remaining = words;
        let mut count = 0;
        for slot in self.slots.iter().rev().skip(skip_values) {
            if remaining == 0 {
                break;
            }
            remaining = remaining.saturating_sub(slot.words());
            count += 1;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::MethodAccess;

    fn method(descriptor: &str, is_static: bool) -> Method {
        Method {
            name: "methodX".to_string(),
            descriptor: descriptor.to_string(),
            access: MethodAccess { is_static },
            bytecode: Vec::new(),
            instructions: Vec::new(),
            line_numbers: Vec::new(),
            exception_handlers: Vec::new(),
        }
    }

    fn field() -> FieldRef {
        FieldRef {
            owner: "com/example/ClassA".to_string(),
            name: "varOne".to_string(),
            descriptor: "Ljava/lang/String;".to_string(),
        }
    }

    fn signatures(stack: &OperandStack) -> Vec<String> {
        (0..stack.depth())
            .rev()
            .filter_map(|depth| stack.peek(depth))
            .map(|slot| slot.signature.clone())
            .collect()
    }

    #[test]
    fn peek_is_relative_to_top_and_guards_depth() {
        let mut stack = OperandStack::default();
        stack.push(StackSlot::of_type("I"));
        stack.push(StackSlot::of_type("Ljava/lang/String;"));

        assert_eq!(stack.peek(0).map(|slot| slot.signature.as_str()), Some("Ljava/lang/String;"));
        assert_eq!(stack.peek(1).map(|slot| slot.signature.as_str()), Some("I"));
        assert!(stack.peek(2).is_none());
    }

    #[test]
    fn apply_effect_pops_then_pushes_and_tags_top() {
        let mut stack = OperandStack::default();
        stack.push(StackSlot::from_field(&field()));
        stack.push(StackSlot::of_type("I"));

        assert!(stack.apply_effect(2, Some(StackSlot::of_type("Ljava/lang/String;"))));
        stack.set_tag_on_top(ProvenanceTag::ToStringResult);

        assert_eq!(stack.depth(), 1);
        let top = stack.peek(0).expect("top");
        assert_eq!(top.tag, Some(ProvenanceTag::ToStringResult));
        assert!(top.field_origin.is_none());
        assert!(!stack.apply_effect(1, None));
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn underflow_is_absorbed() {
        let mut stack = OperandStack::default();
        stack.pop_n(3);
        stack.swap();
        stack.dup_words(1, 1);
        stack.set_tag_on_top(ProvenanceTag::DerivedFromField);
        assert_eq!(stack.depth(), 0);
        assert!(stack.pop().is_none());
    }

    #[test]
    fn dup_forms_respect_wide_values() {
        let mut stack = OperandStack::default();
        stack.push(StackSlot::of_type("I"));
        stack.push(StackSlot::of_type("J"));
        // dup2 on a long copies one value.
        stack.dup_words(2, 0);
        assert_eq!(signatures(&stack), vec!["I", "J", "J"]);

        let mut stack = OperandStack::default();
        stack.push(StackSlot::of_type("I"));
        stack.push(StackSlot::of_type("F"));
        stack.push(StackSlot::of_type("Ljava/lang/Object;"));
        // dup_x2 with three narrow values.
        stack.dup_words(1, 2);
        assert_eq!(
            signatures(&stack),
            vec!["Ljava/lang/Object;", "I", "F", "Ljava/lang/Object;"]
        );

        stack.pop_words(2);
        assert_eq!(signatures(&stack), vec!["Ljava/lang/Object;", "I"]);
    }

    #[test]
    fn locals_drop_field_origin_but_keep_tags() {
        let mut stack = OperandStack::default();
        let mut slot = StackSlot::from_field(&field());
        slot.tag = Some(ProvenanceTag::ToStringResult);
        stack.store_local(3, slot);

        let loaded = stack.load_local(3).expect("local");
        assert!(loaded.field_origin.is_none());
        assert_eq!(loaded.tag, Some(ProvenanceTag::ToStringResult));
        assert!(stack.load_local(1).is_none());
    }

    #[test]
    fn locals_are_seeded_from_descriptor() {
        let stack = OperandStack::for_method(
            "com/example/ClassA",
            &method("(JLjava/lang/String;)V", false),
        );

        assert_eq!(
            stack.load_local(0).map(|slot| slot.signature),
            Some("Lcom/example/ClassA;".to_string())
        );
        assert_eq!(stack.load_local(1).map(|slot| slot.signature), Some("J".to_string()));
        assert!(stack.load_local(2).is_none());
        assert_eq!(
            stack.load_local(3).map(|slot| slot.signature),
            Some("Ljava/lang/String;".to_string())
        );
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn unreachable_code_resumes_from_recorded_branch_state() {
        let mut stack = OperandStack::for_method("com/example/ClassA", &method("()V", true));
        stack.push(StackSlot::of_type("Ljava/lang/String;"));
        stack.record_jump(20);
        stack.mark_unreachable();

        stack.enter(10, None);
        assert_eq!(stack.depth(), 0);

        stack.mark_unreachable();
        stack.enter(20, None);
        assert_eq!(signatures(&stack), vec!["Ljava/lang/String;"]);
    }

    #[test]
    fn merge_joins_tags_and_keeps_only_shared_field_origin() {
        let mut stack = OperandStack::for_method("com/example/ClassA", &method("()V", true));
        let mut tagged = StackSlot::from_field(&field());
        tagged.tag = Some(ProvenanceTag::ToStringResult);
        stack.push(tagged);
        stack.record_jump(30);
        stack.clear();
        stack.push(StackSlot::of_type("Ljava/lang/String;"));

        stack.enter(30, None);

        let top = stack.peek(0).expect("top");
        assert_eq!(top.tag, Some(ProvenanceTag::ToStringResult));
        assert!(top.field_origin.is_none());
    }

    #[test]
    fn handler_entry_holds_caught_exception() {
        let mut stack = OperandStack::for_method("com/example/ClassA", &method("()V", true));
        stack.push(StackSlot::of_type("I"));
        stack.mark_unreachable();
        stack.enter(40, Some("java/io/IOException"));

        assert_eq!(signatures(&stack), vec!["Ljava/io/IOException;"]);
    }
}
