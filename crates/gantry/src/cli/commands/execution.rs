//! Execution flags shared by `run` and `plan`

use std::path::{Path, PathBuf};

use clap::{Args, ValueEnum};
use tracing::{debug, info};

use gantry_core::config::{load_config_or_default, validate_execution};
use gantry_core::{
    load_manifest, ExecutionConfig, FilteredDependencyPolicy, Isolation, ParallelMode, TestUnit,
    WorkerCount,
};

/// Manifest and execution overrides
#[derive(Debug, Args)]
pub struct ExecutionArgs {
    /// Unit manifest (JSON, YAML or TOML)
    pub manifest: PathBuf,

    /// Worker count: a number, "auto" or "disabled"
    #[arg(long, short = 'w')]
    pub workers: Option<WorkerCount>,

    /// Partition granularity
    #[arg(long)]
    pub parallel_mode: Option<ModeArg>,

    /// Worker isolation
    #[arg(long)]
    pub isolation: Option<IsolationArg>,

    /// Only run units with this tag (can be repeated)
    #[arg(long)]
    pub tag: Vec<String>,

    /// Skip units with this tag (can be repeated)
    #[arg(long)]
    pub exclude_tag: Vec<String>,

    /// Only run partitions matching this glob (can be repeated)
    #[arg(long)]
    pub service: Vec<String>,

    /// Abort the whole run when a worker crashes
    #[arg(long)]
    pub abort_on_crash: bool,

    /// Per-unit timeout in seconds
    #[arg(long)]
    pub unit_timeout: Option<u64>,

    /// Per-partition timeout in seconds
    #[arg(long)]
    pub partition_timeout: Option<u64>,

    /// What to do with dependencies removed by filtering
    #[arg(long)]
    pub filtered_dependency: Option<PolicyArg>,

    /// Path to the gantry-worker executable
    #[arg(long)]
    pub worker_program: Option<PathBuf>,
}

/// Settings and units ready for planning
#[derive(Debug)]
pub struct Prepared {
    pub execution: ExecutionConfig,
    pub units: Vec<TestUnit>,
    pub config_path: Option<PathBuf>,
}

impl ExecutionArgs {
    /// Load config from `dir`, apply the flags and read the manifest
    pub fn prepare(&self, dir: &Path) -> anyhow::Result<Prepared> {
        let (config, config_path) = load_config_or_default(dir)?;
        if let Some(path) = &config_path {
            debug!(path = %path.display(), "using configuration file");
        }

        let execution = self.apply(config.execution);
        validate_execution(&execution)?;

        let units = load_manifest(&dir.join(&self.manifest))?;
        info!(
            units = units.len(),
            workers = %execution.max_workers,
            mode = %execution.mode,
            "execution settings resolved"
        );

        Ok(Prepared {
            execution,
            units,
            config_path,
        })
    }

    /// Layer the flags over configured settings. Repeated flags replace the
    /// configured list rather than extending it.
    pub fn apply(&self, mut execution: ExecutionConfig) -> ExecutionConfig {
        if let Some(workers) = self.workers {
            execution.max_workers = workers;
        }
        if let Some(mode) = self.parallel_mode {
            execution.mode = mode.into();
        }
        if let Some(isolation) = self.isolation {
            execution.isolation = isolation.into();
        }
        if !self.tag.is_empty() {
            execution.tag_include = self.tag.iter().cloned().collect();
        }
        if !self.exclude_tag.is_empty() {
            execution.tag_exclude = self.exclude_tag.iter().cloned().collect();
        }
        if !self.service.is_empty() {
            execution.services = self.service.clone();
        }
        if self.abort_on_crash {
            execution.abort_on_crash = true;
        }
        if self.unit_timeout.is_some() {
            execution.unit_timeout = self.unit_timeout;
        }
        if self.partition_timeout.is_some() {
            execution.partition_timeout = self.partition_timeout;
        }
        if let Some(policy) = self.filtered_dependency {
            execution.filtered_dependency = policy.into();
        }
        if let Some(program) = &self.worker_program {
            execution.worker_program = Some(program.clone());
        }
        execution
    }
}

/// `--parallel-mode` values
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    /// One partition per service
    Service,
    /// One partition per unit (not supported)
    Test,
}

impl From<ModeArg> for ParallelMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Service => Self::Service,
            ModeArg::Test => Self::Test,
        }
    }
}

/// `--isolation` values
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum IsolationArg {
    /// One worker process per partition
    Process,
    /// Run workers inside this process
    None,
}

impl From<IsolationArg> for Isolation {
    fn from(isolation: IsolationArg) -> Self {
        match isolation {
            IsolationArg::Process => Self::Process,
            IsolationArg::None => Self::None,
        }
    }
}

/// `--filtered-dependency` values
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PolicyArg {
    /// Treat it as satisfied
    Satisfied,
    /// Skip the dependent
    Skip,
    /// Fail planning
    Reject,
}

impl From<PolicyArg> for FilteredDependencyPolicy {
    fn from(policy: PolicyArg) -> Self {
        match policy {
            PolicyArg::Satisfied => Self::Satisfied,
            PolicyArg::Skip => Self::Skip,
            PolicyArg::Reject => Self::Reject,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::GantryError;
    use tempfile::TempDir;

    fn args(manifest: &str) -> ExecutionArgs {
        ExecutionArgs {
            manifest: PathBuf::from(manifest),
            workers: None,
            parallel_mode: None,
            isolation: None,
            tag: Vec::new(),
            exclude_tag: Vec::new(),
            service: Vec::new(),
            abort_on_crash: false,
            unit_timeout: None,
            partition_timeout: None,
            filtered_dependency: None,
            worker_program: None,
        }
    }

    const MANIFEST: &str = r#"{"units": [
        {"id": "auth::login", "partition_key": "auth", "executable": {"kind": "shell", "command": "true"}}
    ]}"#;

    #[test]
    fn test_flags_override_config() {
        let mut configured = ExecutionConfig::default();
        configured.tag_exclude.insert("slow".to_string());
        configured.unit_timeout = Some(60);

        let mut flags = args("units.json");
        flags.workers = Some(WorkerCount::from(2));
        flags.isolation = Some(IsolationArg::None);
        flags.exclude_tag = vec!["flaky".to_string()];
        flags.abort_on_crash = true;
        flags.filtered_dependency = Some(PolicyArg::Reject);

        let execution = flags.apply(configured);
        assert_eq!(execution.max_workers, WorkerCount::from(2));
        assert_eq!(execution.isolation, Isolation::None);
        assert!(execution.tag_exclude.contains("flaky"));
        assert!(!execution.tag_exclude.contains("slow"));
        assert!(execution.abort_on_crash);
        assert_eq!(execution.unit_timeout, Some(60));
        assert_eq!(execution.filtered_dependency, FilteredDependencyPolicy::Reject);
    }

    #[test]
    fn test_prepare_reads_config_and_manifest() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("gantry.toml"),
            "[execution]\nmax_workers = 3\nservices = [\"auth*\"]\n",
        )
        .unwrap();
        std::fs::write(temp.path().join("units.json"), MANIFEST).unwrap();

        let prepared = args("units.json").prepare(temp.path()).unwrap();
        assert_eq!(prepared.execution.max_workers, WorkerCount::from(3));
        assert_eq!(prepared.execution.services, vec!["auth*"]);
        assert_eq!(prepared.units.len(), 1);
        assert_eq!(prepared.config_path, Some(temp.path().join("gantry.toml")));
    }

    #[test]
    fn test_prepare_rejects_conflicting_tags() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("units.json"), MANIFEST).unwrap();

        let mut flags = args("units.json");
        flags.tag = vec!["smoke".to_string()];
        flags.exclude_tag = vec!["smoke".to_string()];

        let err = flags.prepare(temp.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GantryError>(),
            Some(GantryError::Config(_))
        ));
    }

    #[test]
    fn test_prepare_missing_manifest() {
        let temp = TempDir::new().unwrap();
        let err = args("missing.json").prepare(temp.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GantryError>(),
            Some(GantryError::Manifest(_))
        ));
    }
}
