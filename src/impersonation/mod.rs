//! Detection of strings standing in for the objects they were derived from.
//!
//! A method body is simulated once with a fresh [`OperandStack`](crate::dataflow::stack_machine::OperandStack);
//! the [`scanner`] inspects call and field-store instructions against the
//! [`tables`] and reports into a [`DiagnosticSink`].

pub(crate) mod scanner;
pub(crate) mod tables;

use opentelemetry::KeyValue;
use rayon::prelude::*;
use tracing::debug;

use crate::dataflow::opcode_semantics::{
    SemanticsCoverage, SemanticsDebugConfig, emit_opcode_semantics_summary_event,
    opcode_semantics_debug_enabled, simulate_method,
};
use crate::engine::AnalysisContext;
use crate::ir::Method;

use self::scanner::PatternScanner;
use self::tables::RuleTables;

/// Kinds of findings produced by the scanner.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) enum DiagnosticKind {
    /// A string parsing call on a value that came from a field.
    StringParsingAField,
    /// A `toString()` result kept in a field or a field-held collection.
    ToStringStoredInField,
}

impl DiagnosticKind {
    pub(crate) fn code(self) -> &'static str {
        match self {
            DiagnosticKind::StringParsingAField => "STRING_PARSING_A_FIELD",
            DiagnosticKind::ToStringStoredInField => "TOSTRING_STORED_IN_FIELD",
        }
    }
}

/// One finding, located by class, method and bytecode offset.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Diagnostic {
    pub(crate) kind: DiagnosticKind,
    pub(crate) class_name: String,
    pub(crate) method_name: String,
    pub(crate) method_descriptor: String,
    pub(crate) offset: u32,
    pub(crate) line: Option<u32>,
}

impl Diagnostic {
    /// Source line when the method has a line table, bytecode offset otherwise.
    pub(crate) fn position(&self) -> String {
        match self.line {
            Some(line) => format!("line {line}"),
            None => format!("bytecode offset {}", self.offset),
        }
    }
}

/// Receiver of scanner findings.
pub(crate) trait DiagnosticSink {
    fn report(&mut self, diagnostic: Diagnostic);
}

impl DiagnosticSink for Vec<Diagnostic> {
    fn report(&mut self, diagnostic: Diagnostic) {
        self.push(diagnostic);
    }
}

/// Scans one method body and reports every finding into `sink`.
pub(crate) fn scan_method<S>(
    tables: &RuleTables,
    class_name: &str,
    method: &Method,
    sink: &mut S,
    coverage: &mut SemanticsCoverage,
    debug_config: SemanticsDebugConfig,
) where
    S: DiagnosticSink,
{
    let mut scanner = PatternScanner::new(tables, class_name, sink);
    simulate_method(class_name, method, &mut scanner, coverage, debug_config);
}

/// Findings of one kind for one scanned class.
pub(crate) struct ClassFindings {
    pub(crate) artifact_uri: Option<String>,
    pub(crate) diagnostics: Vec<Diagnostic>,
}

/// Sink keeping only the findings of a single kind.
struct KindFilter<'a> {
    kind: DiagnosticKind,
    diagnostics: &'a mut Vec<Diagnostic>,
}

impl DiagnosticSink for KindFilter<'_> {
    fn report(&mut self, diagnostic: Diagnostic) {
        if diagnostic.kind == self.kind {
            self.diagnostics.push(diagnostic);
        }
    }
}

/// Scans every class in parallel, keeping findings of `kind`.
///
/// Classes come back in input order; classes without findings are dropped.
pub(crate) fn scan_classes(
    context: &AnalysisContext,
    kind: DiagnosticKind,
) -> Vec<ClassFindings> {
    let debug_config = SemanticsDebugConfig {
        enabled: opcode_semantics_debug_enabled(),
        rule_id: kind.code(),
    };
    let classes = &context.classes;
    let scanned: Vec<(ClassFindings, SemanticsCoverage)> = classes
        .par_iter()
        .map(|class| {
            let artifact_uri = context.class_artifact_uri(class);
            let mut attributes = vec![KeyValue::new("cislint.class", class.name.clone())];
            if let Some(uri) = &artifact_uri {
                attributes.push(KeyValue::new("cislint.artifact_uri", uri.clone()));
            }
            context.with_span("class", &attributes, || {
                let mut diagnostics = Vec::new();
                let mut coverage = SemanticsCoverage::default();
                let mut sink = KindFilter {
                    kind,
                    diagnostics: &mut diagnostics,
                };
                for method in &class.methods {
                    scan_method(
                        &context.rule_tables,
                        &class.name,
                        method,
                        &mut sink,
                        &mut coverage,
                        debug_config,
                    );
                }
                let findings = ClassFindings {
                    artifact_uri,
                    diagnostics,
                };
                (findings, coverage)
            })
        })
        .collect();

    let mut rule_coverage = SemanticsCoverage::default();
    let mut findings = Vec::new();
    for (class_findings, coverage) in scanned {
        rule_coverage.merge_from(&coverage);
        if !class_findings.diagnostics.is_empty() {
            findings.push(class_findings);
        }
    }
    if debug_config.enabled && rule_coverage.fallback_not_handled > 0 {
        emit_opcode_semantics_summary_event(kind.code(), &rule_coverage);
    }
    debug!(
        rule = kind.code(),
        classes = classes.len(),
        fallbacks = rule_coverage.fallback_not_handled,
        "impersonation scan finished"
    );
    findings
}
