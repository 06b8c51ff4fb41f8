//! Run command - execute a manifest across worker processes

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Args;
use console::style;
use tracing::info;

use gantry_core::{ExecutionConfig, Isolation};
use gantry_engine::{
    HookError, ListenerRegistry, Orchestrator, RunReport, RunStatus, SuiteEvent, SuiteListener,
};

use super::ExecutionArgs;
use crate::cli::output::{self, plural};
use crate::cli::{Cli, OutputFormat};
use crate::exit_codes;

/// Run the units of a manifest
#[derive(Debug, Args)]
pub struct RunCommand {
    #[command(flatten)]
    pub execution: ExecutionArgs,

    /// Write the JSON report to this file
    #[arg(long)]
    pub report: Option<PathBuf>,
}

impl RunCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<i32> {
        let cwd = std::env::current_dir()?;
        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(self.run(cli, &cwd))
    }

    async fn run(&self, cli: &Cli, cwd: &Path) -> anyhow::Result<i32> {
        info!(manifest = %self.execution.manifest.display(), "executing run command");
        let prepared = self.execution.prepare(cwd)?;

        let mut listeners = ListenerRegistry::new();
        if cli.shows_text() {
            listeners.register(ConsoleListener::new(cli.verbose));
        }
        let orchestrator = Orchestrator::new(prepared.execution).with_listeners(listeners);
        let plan = orchestrator.plan(prepared.units)?;

        if cli.shows_text() {
            println!();
            output::info(&format!(
                "{} in {} on {}",
                plural(plan.unit_count(), "unit"),
                plural(plan.partitions.len(), "partition"),
                workers_label(orchestrator.config())
            ));
            if cli.verbose {
                println!();
                print!("{}", plan.describe());
            } else {
                for warning in plan.graph.warnings() {
                    output::warning(warning);
                }
            }
            println!();
        }

        let report = orchestrator.execute(&plan).await?;

        if let Some(path) = &self.report {
            let path = cwd.join(path);
            std::fs::write(&path, report.to_json()?)
                .with_context(|| format!("Failed to write report to {}", path.display()))?;
            if cli.shows_text() {
                output::success(&format!(
                    "Report written to {}",
                    output::partition_style().apply_to(path.display())
                ));
            }
        }

        match cli.format {
            OutputFormat::Json => println!("{}", report.to_json()?),
            OutputFormat::Text if !cli.quiet => print_report(&report, cli.verbose),
            OutputFormat::Text => {}
        }

        Ok(exit_codes::for_status(report.status))
    }
}

fn workers_label(config: &ExecutionConfig) -> String {
    if config.max_workers.is_disabled() {
        return "the current process".to_string();
    }
    match config.max_workers.resolve() {
        n if config.isolation == Isolation::None => format!("{} in-process", plural(n, "worker")),
        n => plural(n, "worker"),
    }
}

/// Per-unit results in report order, then the totals
fn print_report(report: &RunReport, verbose: bool) {
    println!();
    println!("{}", output::header("Results"));
    for record in &report.records {
        if record.status.is_passed() && !verbose {
            continue;
        }
        let mut line = format!(
            "  {} {} {} {}",
            output::status_symbol(record.status),
            output::status_style(record.status).apply_to(&record.unit_id),
            style(record.status).dim(),
            style(output::seconds(record.duration)).dim()
        );
        if let Some(detail) = &record.error_detail {
            let first = detail.lines().next().unwrap_or_default();
            line.push_str(&format!(" {}", style(first).dim()));
        }
        println!("{}", line);
    }

    let totals = &report.totals;
    let marker = match report.status {
        RunStatus::Success => style("✓").green().bold(),
        RunStatus::Failure | RunStatus::Aborted => style("✗").red().bold(),
    };
    println!();
    println!(
        "  {} {}: {} passed, {} failed, {} skipped, {} errors ({})",
        marker,
        report.status,
        totals.passed,
        totals.failed,
        totals.skipped(),
        totals.errors(),
        output::seconds(report.duration)
    );
}

/// Prints partition progress as workers pick them up
struct ConsoleListener {
    verbose: bool,
}

impl ConsoleListener {
    fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl SuiteListener for ConsoleListener {
    fn on_event(&self, event: &SuiteEvent) -> Result<(), HookError> {
        match event {
            SuiteEvent::BeforeSuite { partition, worker } => {
                println!(
                    "  {} {} {}",
                    style("▸").dim(),
                    output::partition_style().apply_to(partition),
                    style(format!("(worker {})", worker)).dim()
                );
            }
            SuiteEvent::AfterSuite {
                partition,
                worker,
                results,
            } => {
                let passed = results.iter().filter(|r| r.status.is_passed()).count();
                println!(
                    "  {} {} {}/{} passed {}",
                    style("─").dim(),
                    partition,
                    passed,
                    results.len(),
                    style(format!("(worker {})", worker)).dim()
                );
                if self.verbose {
                    for record in results {
                        println!(
                            "      {} {}",
                            output::status_symbol(record.status),
                            record.unit_id
                        );
                    }
                }
            }
            SuiteEvent::WorkerCrashed {
                partition,
                worker,
                detail,
            } => {
                output::error(&format!(
                    "Worker {} crashed running {}: {}",
                    worker, partition, detail
                ));
            }
        }
        Ok(())
    }
}
