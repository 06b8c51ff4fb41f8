//! Worker side of the protocol: receives units and runs them

use std::process::Stdio;
use std::time::Instant;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::Command as ProcessCommand;
use tracing::{debug, info, warn};

use gantry_core::{Executable, Invocation};

use crate::error::WorkerError;

use super::protocol::{read_message, write_message, Command, Outcome, Reply};

/// Environment variable carrying the worker slot number
pub const ENV_WORKER_ID: &str = "GANTRY_WORKER_ID";
/// Environment variable carrying the assignment sequence number
pub const ENV_ASSIGNMENT: &str = "GANTRY_ASSIGNMENT";
/// Environment variable carrying the partition key
pub const ENV_PARTITION: &str = "GANTRY_PARTITION";
/// Environment variable carrying the unit id
pub const ENV_UNIT_ID: &str = "GANTRY_UNIT_ID";

/// Lines of stderr kept in a failure detail
const STDERR_TAIL_LINES: usize = 20;

/// Identity of the assignment a worker is serving
#[derive(Debug, Clone)]
struct Assignment {
    worker_id: usize,
    sequence: u64,
    partition: String,
}

/// Serve one assignment over a reader/writer pair.
///
/// Expects `assign` first, answers `ready`, then runs units one at a time
/// until `shutdown` or end of input.
pub async fn serve<R, W>(reader: R, mut writer: W) -> Result<(), WorkerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(reader).lines();

    let assignment = match read_message(&mut lines).await? {
        Some(Command::Assign {
            worker_id,
            sequence,
            partition,
        }) => Assignment {
            worker_id,
            sequence,
            partition,
        },
        Some(Command::Shutdown) | None => return Ok(()),
        Some(other) => {
            return Err(WorkerError::Protocol(format!(
                "expected assign, got {:?}",
                other
            )))
        }
    };

    info!(
        worker = assignment.worker_id,
        sequence = assignment.sequence,
        partition = %assignment.partition,
        "assignment accepted"
    );
    write_message(
        &mut writer,
        &Reply::Ready {
            worker_id: assignment.worker_id,
            pid: std::process::id(),
        },
    )
    .await?;

    while let Some(command) = read_message(&mut lines).await? {
        match command {
            Command::Run {
                unit_id,
                executable,
            } => {
                let start = Instant::now();
                let outcome = run_unit(&assignment, &unit_id, &executable).await;
                let duration_ms = start.elapsed().as_millis() as u64;
                debug!(unit = %unit_id, ?outcome, duration_ms, "unit finished");
                write_message(
                    &mut writer,
                    &Reply::Finished {
                        unit_id,
                        outcome,
                        duration_ms,
                    },
                )
                .await?;
            }
            Command::Shutdown => break,
            Command::Assign { .. } => {
                return Err(WorkerError::Protocol(
                    "worker already has an assignment".to_string(),
                ))
            }
        }
    }

    debug!(worker = assignment.worker_id, "worker shutting down");
    Ok(())
}

/// Invoke a unit and classify the result
async fn run_unit(assignment: &Assignment, unit_id: &str, executable: &Executable) -> Outcome {
    let mut command = match &executable.invocation {
        Invocation::Shell { command } => {
            let mut cmd = ProcessCommand::new("sh");
            cmd.arg("-c").arg(command);
            cmd
        }
        Invocation::Program { program, args } => {
            let mut cmd = ProcessCommand::new(program);
            cmd.args(args);
            cmd
        }
    };

    command
        .envs(&executable.env)
        .env(ENV_WORKER_ID, assignment.worker_id.to_string())
        .env(ENV_ASSIGNMENT, assignment.sequence.to_string())
        .env(ENV_PARTITION, &assignment.partition)
        .env(ENV_UNIT_ID, unit_id)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &executable.cwd {
        command.current_dir(cwd);
    }

    debug!(unit = %unit_id, command = %executable.describe(), "running unit");
    let output = match command.output().await {
        Ok(output) => output,
        Err(e) => {
            warn!(unit = %unit_id, error = %e, "failed to spawn unit");
            return Outcome::Failed {
                detail: format!("failed to spawn '{}': {}", executable.describe(), e),
            };
        }
    };

    if output.status.success() {
        return Outcome::Passed;
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let tail = stderr_tail(&stderr);
    let status = match output.status.code() {
        Some(code) => format!("exit code {}", code),
        None => "terminated by signal".to_string(),
    };
    Outcome::Failed {
        detail: if tail.is_empty() {
            status
        } else {
            format!("{}: {}", status, tail)
        },
    }
}

fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.trim_end().lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}
