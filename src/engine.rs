use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use opentelemetry::KeyValue;
use serde_sarif::sarif::Artifact;
use serde_sarif::sarif::{MultiformatMessageString, ReportingDescriptor, Result as SarifResult};

use crate::impersonation::tables::RuleTables;
use crate::ir::Class;
use crate::rules::{Rule, RuleMetadata, all_rules};
use crate::telemetry::{Telemetry, with_span};

/// Inputs shared by analysis rules.
pub(crate) struct AnalysisContext {
    pub(crate) classes: Vec<Class>,
    /// Built once per run; every scanner borrows it.
    pub(crate) rule_tables: RuleTables,
    artifact_uris: BTreeMap<i64, String>,
    telemetry: Option<Arc<Telemetry>>,
}

/// Analysis engine that executes registered rules.
pub(crate) struct Engine {
    rules: Vec<Box<dyn Rule + Sync>>,
}

impl Engine {
    pub(crate) fn new() -> Self {
        let mut rules = all_rules();
        rules.sort_by(|a, b| a.metadata().id.cmp(b.metadata().id));
        Self { rules }
    }

    pub(crate) fn analyze(&self, context: AnalysisContext) -> Result<EngineOutput> {
        let mut rules = Vec::new();
        let mut results = Vec::new();

        for rule in &self.rules {
            let metadata = rule.metadata();
            rules.push(rule_descriptor(&metadata));
            let rule_span_attributes = [KeyValue::new("cislint.rule_id", metadata.id)];
            let mut rule_results = with_span(
                context.telemetry(),
                &format!("rule:{}", metadata.id),
                &rule_span_attributes,
                || rule.run(&context),
            )
            .with_context(|| format!("rule {} failed", metadata.id))?;
            for result in &mut rule_results {
                if result.rule_id.is_none() {
                    result.rule_id = Some(metadata.id.to_string());
                }
            }
            results.extend(rule_results);
        }

        results.sort_by(|left, right| {
            let left_id = left.rule_id.as_deref().unwrap_or("");
            let right_id = right.rule_id.as_deref().unwrap_or("");
            let left_msg = left.message.text.as_deref().unwrap_or("");
            let right_msg = right.message.text.as_deref().unwrap_or("");
            left_id.cmp(right_id).then(left_msg.cmp(right_msg))
        });

        Ok(EngineOutput { rules, results })
    }
}

/// Aggregated SARIF payload from rule execution.
pub(crate) struct EngineOutput {
    pub(crate) rules: Vec<ReportingDescriptor>,
    pub(crate) results: Vec<SarifResult>,
}

pub(crate) fn build_context(
    classes: Vec<Class>,
    artifacts: &[Artifact],
    telemetry: Option<Arc<Telemetry>>,
) -> Result<AnalysisContext> {
    let rule_tables = RuleTables::jdk().context("build rule tables")?;
    let artifact_uris = with_span(
        telemetry.as_deref(),
        "artifact_analysis",
        &[KeyValue::new("cislint.phase", "artifact_analysis")],
        || collect_artifact_uris(artifacts),
    );
    Ok(AnalysisContext {
        classes,
        rule_tables,
        artifact_uris,
        telemetry,
    })
}

fn rule_descriptor(metadata: &RuleMetadata) -> ReportingDescriptor {
    ReportingDescriptor::builder()
        .id(metadata.id)
        .name(metadata.name)
        .short_description(
            MultiformatMessageString::builder()
                .text(metadata.description)
                .build(),
        )
        .build()
}

impl AnalysisContext {
    pub(crate) fn telemetry(&self) -> Option<&Telemetry> {
        self.telemetry.as_deref()
    }

    pub(crate) fn with_span<T, F>(&self, name: &str, attributes: &[KeyValue], f: F) -> T
    where
        F: FnOnce() -> T,
    {
        with_span(self.telemetry(), name, attributes, f)
    }

    fn artifact_uri(&self, index: i64) -> Option<&str> {
        self.artifact_uris.get(&index).map(|value| value.as_str())
    }

    /// URI of the class file itself; classes inside a jar get a `jar:` URI.
    pub(crate) fn class_artifact_uri(&self, class: &Class) -> Option<String> {
        let uri = self.artifact_uri(class.artifact_index)?;
        if uri.ends_with(".class") {
            return Some(uri.to_string());
        }
        if uri.ends_with(".jar") {
            return Some(format!("jar:{}!/{}.class", uri, class.name));
        }
        None
    }
}

/// Artifact URIs by SARIF artifact index.
fn collect_artifact_uris(artifacts: &[Artifact]) -> BTreeMap<i64, String> {
    artifacts
        .iter()
        .enumerate()
        .filter_map(|(index, artifact)| {
            let uri = artifact.location.as_ref()?.uri.as_ref()?;
            Some((index as i64, uri.clone()))
        })
        .collect()
}
