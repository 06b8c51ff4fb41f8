//! Plan command - show stages and partitions without running

use clap::Args;
use console::style;
use tracing::info;

use gantry_core::ExecutionConfig;
use gantry_engine::{ExecutionPlan, Orchestrator};

use super::ExecutionArgs;
use crate::cli::output::{self, plural};
use crate::cli::{Cli, OutputFormat};
use crate::exit_codes;

/// Show the execution plan for a manifest
#[derive(Debug, Args)]
pub struct PlanCommand {
    #[command(flatten)]
    pub execution: ExecutionArgs,
}

impl PlanCommand {
    /// Execute the plan command
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<i32> {
        info!(manifest = %self.execution.manifest.display(), "executing plan command");
        let cwd = std::env::current_dir()?;
        let prepared = self.execution.prepare(&cwd)?;

        let orchestrator = Orchestrator::new(prepared.execution);
        let plan = orchestrator.plan(prepared.units)?;

        match cli.format {
            OutputFormat::Json => {
                let value = plan_json(&plan, orchestrator.config());
                println!("{}", serde_json::to_string_pretty(&value)?);
            }
            OutputFormat::Text if !cli.quiet => {
                println!("{}", output::header("Execution plan"));
                if let Some(path) = &prepared.config_path {
                    println!("{}", output::key_value("Config", &path.display().to_string()));
                }
                println!(
                    "{}",
                    output::key_value("Workers", &orchestrator.config().max_workers.to_string())
                );
                println!(
                    "{}",
                    output::key_value(
                        "Units",
                        &format!(
                            "{} in {}",
                            plural(plan.unit_count(), "unit"),
                            plural(plan.partitions.len(), "partition")
                        )
                    )
                );
                println!();
                print!("{}", plan.describe());
                if plan.unit_count() == 0 {
                    println!("{}", style("Nothing to run.").dim());
                }
            }
            OutputFormat::Text => {}
        }

        Ok(exit_codes::SUCCESS)
    }
}

/// Machine-readable plan
pub(crate) fn plan_json(plan: &ExecutionPlan, config: &ExecutionConfig) -> serde_json::Value {
    let mut filtered: Vec<&str> = plan.filtered.iter().map(String::as_str).collect();
    filtered.sort_unstable();

    serde_json::json!({
        "units": plan.unit_count(),
        "workers": config.max_workers.to_string(),
        "mode": config.mode.to_string(),
        "stages": plan.schedule.stages().iter().map(|stage| {
            serde_json::json!({
                "stage": stage.index,
                "units": stage.units,
            })
        }).collect::<Vec<_>>(),
        "partitions": plan.partitions.iter().map(|partition| {
            serde_json::json!({
                "key": partition.key,
                "units": partition.units,
            })
        }).collect::<Vec<_>>(),
        "filtered": filtered,
        "warnings": plan.graph.warnings(),
    })
}
