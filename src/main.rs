mod dataflow;
mod descriptor;
mod engine;
mod impersonation;
mod ir;
mod opcodes;
mod rules;
mod scan;
mod telemetry;
#[cfg(test)]
mod test_harness;

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use opentelemetry::KeyValue;
use serde_json::json;
use serde_sarif::sarif::{
    Artifact, Invocation, PropertyBag, ReportingDescriptor, Result as SarifResult, Run,
    SCHEMA_URL, Sarif, Tool, ToolComponent,
};
use tracing::info;

use crate::engine::{Engine, build_context};
use crate::scan::scan_inputs;
use crate::telemetry::{Telemetry, init_logging, with_span};

/// CLI arguments for cislint execution.
#[derive(Parser, Debug)]
#[command(
    name = "cislint",
    about = "Finds strings standing in for objects in JVM class files and JAR files, reported as SARIF.",
    version
)]
struct Cli {
    #[arg(long, value_name = "PATH")]
    input: PathBuf,
    /// Output file; `-` or absent writes to stdout.
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,
    /// OTLP HTTP endpoint receiving trace spans.
    #[arg(long, value_name = "URL")]
    otel: Option<String>,
    #[arg(long)]
    quiet: bool,
    #[arg(long)]
    timing: bool,
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    run(cli)
}

fn run(cli: Cli) -> Result<()> {
    let telemetry = match cli.otel.as_deref() {
        Some(endpoint) => Some(Arc::new(
            Telemetry::new(endpoint.to_string()).context("initialize telemetry")?,
        )),
        None => None,
    };
    let result = with_span(
        telemetry.as_deref(),
        "cislint",
        &[KeyValue::new(
            "cislint.input",
            cli.input.display().to_string(),
        )],
        || analyze(&cli, telemetry.clone()),
    );
    if let Some(telemetry) = telemetry {
        telemetry.shutdown()?;
    }
    result
}

fn analyze(cli: &Cli, telemetry: Option<Arc<Telemetry>>) -> Result<()> {
    let started_at = Instant::now();
    let scan = with_span(
        telemetry.as_deref(),
        "scan",
        &[KeyValue::new("cislint.phase", "scan")],
        || scan_inputs(&cli.input, telemetry.as_deref()),
    )?;
    let scan_duration_ms = started_at.elapsed().as_millis();

    let invocation_stats = InvocationStats {
        scan_duration_ms,
        class_count: scan.class_count,
        artifact_count: scan.artifacts.len(),
        skipped_method_count: scan.skipped_method_count(),
        skipped_file_count: scan.skipped_file_count,
    };
    if invocation_stats.skipped_method_count > 0 || invocation_stats.skipped_file_count > 0 {
        info!(
            skipped_methods = invocation_stats.skipped_method_count,
            skipped_files = invocation_stats.skipped_file_count,
            "some inputs could not be decoded and were not analyzed"
        );
    }

    let analysis_started_at = Instant::now();
    let context = build_context(scan.classes, &scan.artifacts, telemetry.clone())?;
    let output = with_span(
        telemetry.as_deref(),
        "analysis",
        &[KeyValue::new("cislint.phase", "analysis")],
        || Engine::new().analyze(context),
    )?;
    let analysis_duration_ms = analysis_started_at.elapsed().as_millis();

    let invocation = build_invocation(&invocation_stats);
    let sarif = build_sarif(scan.artifacts, invocation, output.rules, output.results);

    let mut writer = output_writer(cli.output.as_deref())?;
    serde_json::to_writer_pretty(&mut writer, &sarif)
        .context("failed to serialize SARIF output")?;
    writer
        .write_all(b"\n")
        .context("failed to write SARIF output")?;

    if cli.timing && !cli.quiet {
        eprintln!(
            "timing: total_ms={} scan_ms={} analysis_ms={} classes={} artifacts={}",
            started_at.elapsed().as_millis(),
            scan_duration_ms,
            analysis_duration_ms,
            invocation_stats.class_count,
            invocation_stats.artifact_count
        );
    }

    Ok(())
}

fn output_writer(output: Option<&Path>) -> Result<Box<dyn Write>> {
    match output {
        Some(path) if path == Path::new("-") => Ok(Box::new(io::stdout())),
        Some(path) => Ok(Box::new(
            File::create(path).with_context(|| format!("failed to open {}", path.display()))?,
        )),
        None => Ok(Box::new(io::stdout())),
    }
}

/// Metadata captured for SARIF invocation properties.
struct InvocationStats {
    scan_duration_ms: u128,
    class_count: usize,
    artifact_count: usize,
    skipped_method_count: usize,
    skipped_file_count: usize,
}

fn build_invocation(stats: &InvocationStats) -> Invocation {
    let arguments: Vec<String> = std::env::args().collect();
    let command_line = arguments.join(" ");
    let mut properties = BTreeMap::new();
    properties.insert("cislint.scan_ms".to_string(), json!(stats.scan_duration_ms));
    properties.insert("cislint.class_count".to_string(), json!(stats.class_count));
    properties.insert(
        "cislint.artifact_count".to_string(),
        json!(stats.artifact_count),
    );
    properties.insert(
        "cislint.skipped_method_count".to_string(),
        json!(stats.skipped_method_count),
    );
    properties.insert(
        "cislint.skipped_file_count".to_string(),
        json!(stats.skipped_file_count),
    );

    Invocation::builder()
        .execution_successful(true)
        .arguments(arguments)
        .command_line(command_line)
        .properties(PropertyBag::builder().additional_properties(properties).build())
        .build()
}

fn build_sarif(
    artifacts: Vec<Artifact>,
    invocation: Invocation,
    rules: Vec<ReportingDescriptor>,
    results: Vec<SarifResult>,
) -> Sarif {
    let driver = ToolComponent::builder()
        .name("cislint")
        .version(env!("CARGO_PKG_VERSION"))
        .rules(rules)
        .build();
    let tool = Tool {
        driver,
        extensions: None,
        properties: None,
    };
    let run = if artifacts.is_empty() {
        Run::builder()
            .tool(tool)
            .invocations(vec![invocation])
            .results(results)
            .build()
    } else {
        Run::builder()
            .tool(tool)
            .invocations(vec![invocation])
            .results(results)
            .artifacts(artifacts)
            .build()
    };

    Sarif::builder()
        .schema(SCHEMA_URL)
        .runs(vec![run])
        .version(json!("2.1.0"))
        .build()
}
