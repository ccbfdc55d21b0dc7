use std::str::FromStr;

use anyhow::{Context, Result};
use jdescriptor::{MethodDescriptor, TypeDescriptor};

pub(crate) const STRING_SIGNATURE: &str = "Ljava/lang/String;";
pub(crate) const OBJECT_SIGNATURE: &str = "Ljava/lang/Object;";

/// Parameter and return signatures of a JVM method descriptor.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct MethodSignature {
    pub(crate) parameters: Vec<String>,
    /// `None` for `void` methods.
    pub(crate) return_type: Option<String>,
}

impl MethodSignature {
    pub(crate) fn param_count(&self) -> usize {
        self.parameters.len()
    }
}

/// Parse a JVM method descriptor into ordered parameter signatures.
pub(crate) fn method_signature(descriptor: &str) -> Result<MethodSignature> {
    let descriptor =
        MethodDescriptor::from_str(descriptor).context("parse method descriptor")?;
    let parameters = descriptor
        .parameter_types()
        .iter()
        .map(type_signature)
        .collect();
    let return_type = match descriptor.return_type() {
        TypeDescriptor::Void => None,
        other => Some(type_signature(other)),
    };
    Ok(MethodSignature {
        parameters,
        return_type,
    })
}

fn type_signature(ty: &TypeDescriptor) -> String {
    match ty {
        TypeDescriptor::Byte => "B".to_string(),
        TypeDescriptor::Char => "C".to_string(),
        TypeDescriptor::Double => "D".to_string(),
        TypeDescriptor::Float => "F".to_string(),
        TypeDescriptor::Integer => "I".to_string(),
        TypeDescriptor::Long => "J".to_string(),
        TypeDescriptor::Short => "S".to_string(),
        TypeDescriptor::Boolean => "Z".to_string(),
        TypeDescriptor::Void => "V".to_string(),
        TypeDescriptor::Object(class) => object_signature(class),
        TypeDescriptor::Array(inner, dims) => {
            format!("{}{}", "[".repeat(*dims as usize), type_signature(inner))
        }
    }
}

/// Signature for an internal class name; array names are already signatures.
pub(crate) fn object_signature(class_name: &str) -> String {
    if class_name.starts_with('[') {
        class_name.to_string()
    } else {
        format!("L{class_name};")
    }
}

/// Long and double values occupy two operand stack words.
pub(crate) fn is_wide(signature: &str) -> bool {
    matches!(signature, "J" | "D")
}
