//! CLI commands

mod execution;
mod plan;
mod run;

pub use execution::ExecutionArgs;
pub use plan::PlanCommand;
pub use run::RunCommand;
