//! Exit codes for the CLI

use gantry_core::GantryError;
use gantry_engine::{EngineError, RunStatus};

/// Every unit passed or was skipped
pub const SUCCESS: i32 = 0;

/// At least one unit failed, timed out or lost its worker
pub const FAILURE: i32 = 1;

/// The run was aborted after a worker crash
pub const ABORTED: i32 = 2;

/// Planning or validation error; nothing ran
pub const PLANNING_ERROR: i32 = 3;

/// Configuration error
pub const CONFIG_ERROR: i32 = 4;

/// Exit code for a finished run
pub fn for_status(status: RunStatus) -> i32 {
    match status {
        RunStatus::Success => SUCCESS,
        RunStatus::Failure => FAILURE,
        RunStatus::Aborted => ABORTED,
    }
}

/// Exit code for a run that never produced a report
pub fn for_error(err: &anyhow::Error) -> i32 {
    if let Some(engine) = err.downcast_ref::<EngineError>() {
        return if engine.is_planning_error() {
            PLANNING_ERROR
        } else {
            FAILURE
        };
    }
    match err.downcast_ref::<GantryError>() {
        Some(GantryError::Config(_)) => CONFIG_ERROR,
        Some(GantryError::Manifest(_)) => PLANNING_ERROR,
        _ => FAILURE,
    }
}
