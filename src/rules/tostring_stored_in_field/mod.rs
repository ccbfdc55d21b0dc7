use anyhow::Result;
use serde_sarif::sarif::Result as SarifResult;

use crate::engine::AnalysisContext;
use crate::impersonation::{DiagnosticKind, scan_classes};
use crate::rules::{Rule, RuleMetadata, method_location_with_line, result_message};

/// Rule that detects `toString()` results kept in fields or field-held collections.
#[derive(Default)]
pub(crate) struct ToStringStoredInFieldRule;

crate::register_rule!(ToStringStoredInFieldRule);

impl Rule for ToStringStoredInFieldRule {
    fn metadata(&self) -> RuleMetadata {
        RuleMetadata {
            id: DiagnosticKind::ToStringStoredInField.code(),
            name: "toString() result stored in field",
            description: "String representations of objects stored in fields or used as keys and values of field collections",
        }
    }

    fn run(&self, context: &AnalysisContext) -> Result<Vec<SarifResult>> {
        let mut results = Vec::new();
        for findings in scan_classes(context, DiagnosticKind::ToStringStoredInField) {
            for diagnostic in &findings.diagnostics {
                let message = result_message(format!(
                    "{}.{}{} stores a toString() result in a field at {}; store the object itself instead of its string form.",
                    diagnostic.class_name,
                    diagnostic.method_name,
                    diagnostic.method_descriptor,
                    diagnostic.position()
                ));
                let location = method_location_with_line(
                    &diagnostic.class_name,
                    &diagnostic.method_name,
                    &diagnostic.method_descriptor,
                    findings.artifact_uri.as_deref(),
                    diagnostic.line,
                );
                results.push(
                    SarifResult::builder()
                        .message(message)
                        .locations(vec![location])
                        .build(),
                );
            }
        }
        Ok(results)
    }
}
