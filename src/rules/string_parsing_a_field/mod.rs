use anyhow::Result;
use serde_sarif::sarif::Result as SarifResult;

use crate::engine::AnalysisContext;
use crate::impersonation::{DiagnosticKind, scan_classes};
use crate::rules::{Rule, RuleMetadata, method_location_with_line, result_message};

/// Rule that detects string parsing applied to a value read from a field.
#[derive(Default)]
pub(crate) struct StringParsingAFieldRule;

crate::register_rule!(StringParsingAFieldRule);

impl Rule for StringParsingAFieldRule {
    fn metadata(&self) -> RuleMetadata {
        RuleMetadata {
            id: DiagnosticKind::StringParsingAField.code(),
            name: "String parsing a field",
            description: "Fields holding a string that is later parsed with indexOf, substring, split and similar calls",
        }
    }

    fn run(&self, context: &AnalysisContext) -> Result<Vec<SarifResult>> {
        let mut results = Vec::new();
        for findings in scan_classes(context, DiagnosticKind::StringParsingAField) {
            for diagnostic in &findings.diagnostics {
                let message = result_message(format!(
                    "{}.{}{} parses a string read from a field at {}; keep the parsed parts as separate typed fields instead.",
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
