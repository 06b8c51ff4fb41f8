//! JSON-lines wire protocol between the supervisor and a worker

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, Lines};

use gantry_core::Executable;

use crate::error::WorkerError;

/// Supervisor to worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Bind the worker to one partition assignment
    Assign {
        worker_id: usize,
        sequence: u64,
        partition: String,
    },
    /// Execute one unit
    Run {
        unit_id: String,
        executable: Executable,
    },
    /// Exit cleanly
    Shutdown,
}

/// Worker to supervisor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    /// Assignment accepted
    Ready { worker_id: usize, pid: u32 },
    /// A unit finished executing
    Finished {
        unit_id: String,
        outcome: Outcome,
        duration_ms: u64,
    },
}

/// Result of invoking a unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Outcome {
    Passed,
    Failed { detail: String },
}

/// Write one message followed by a newline
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), WorkerError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the next message, `None` at end of stream. Blank lines are ignored.
pub async fn read_message<R, T>(lines: &mut Lines<R>) -> Result<Option<T>, WorkerError>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        return Ok(Some(serde_json::from_str(&line)?));
    }
    Ok(None)
}
