//! CLI definition and command handling

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};

use commands::{PlanCommand, RunCommand};

/// Gantry - parallel test orchestration
#[derive(Debug, Parser)]
#[command(name = "gantry")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Working directory
    #[arg(short = 'C', long, global = true)]
    pub directory: Option<std::path::PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Output format for CLI
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output
    #[default]
    Text,
    /// JSON output
    Json,
}

/// Available commands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the units of a manifest
    Run(RunCommand),

    /// Show the execution plan without running anything
    Plan(PlanCommand),
}

impl Cli {
    /// Execute the CLI command and return the process exit code
    pub fn execute(self) -> anyhow::Result<i32> {
        if let Some(dir) = &self.directory {
            std::env::set_current_dir(dir)?;
        }

        match self.command {
            Commands::Run(ref cmd) => cmd.execute(&self),
            Commands::Plan(ref cmd) => cmd.execute(&self),
        }
    }

    /// Whether human-readable progress should be printed
    pub fn shows_text(&self) -> bool {
        !self.quiet && self.format == OutputFormat::Text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_flags() {
        let cli = Cli::try_parse_from([
            "gantry",
            "--format",
            "json",
            "run",
            "units.json",
            "--workers",
            "3",
            "--tag",
            "smoke",
            "--tag",
            "api",
            "--service",
            "auth*",
            "--abort-on-crash",
            "--unit-timeout",
            "30",
            "--report",
            "report.json",
        ])
        .unwrap();

        assert_eq!(cli.format, OutputFormat::Json);
        let Commands::Run(run) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(run.execution.manifest, std::path::PathBuf::from("units.json"));
        assert_eq!(run.execution.workers, Some(gantry_core::WorkerCount::from(3)));
        assert_eq!(run.execution.tag, vec!["smoke", "api"]);
        assert!(run.execution.abort_on_crash);
        assert_eq!(run.execution.unit_timeout, Some(30));
        assert_eq!(run.report, Some(std::path::PathBuf::from("report.json")));
    }

    #[test]
    fn test_parse_plan_with_keywords() {
        let cli = Cli::try_parse_from([
            "gantry",
            "plan",
            "units.yaml",
            "--workers",
            "disabled",
            "--parallel-mode",
            "test",
            "--isolation",
            "none",
        ])
        .unwrap();

        let Commands::Plan(plan) = cli.command else {
            panic!("expected plan command");
        };
        assert_eq!(plan.execution.workers, Some(gantry_core::WorkerCount::Disabled));
        assert_eq!(
            plan.execution.parallel_mode.map(gantry_core::ParallelMode::from),
            Some(gantry_core::ParallelMode::Test)
        );
    }

    #[test]
    fn test_invalid_worker_count_rejected() {
        let result = Cli::try_parse_from(["gantry", "run", "units.json", "--workers", "many"]);
        assert!(result.is_err());
    }
}
