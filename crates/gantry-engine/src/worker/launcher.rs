//! Supervisor side of a worker: launching, talking to and killing it

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader, Lines};
use tokio::process::{Child, Command as ProcessCommand};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::WorkerError;

use super::protocol::{read_message, write_message, Command, Reply};
use super::runtime::serve;

/// Name of the worker executable
pub const WORKER_PROGRAM: &str = "gantry-worker";

/// Environment variable overriding the worker executable
pub const WORKER_BIN_ENV: &str = "GANTRY_WORKER_BIN";

/// How long a worker may take to exit after `shutdown`
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// In-memory pipe capacity for in-process workers
const DUPLEX_CAPACITY: usize = 64 * 1024;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// How workers are started
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerLauncher {
    /// A fresh OS process per assignment
    Process { program: PathBuf },
    /// A tokio task in the caller's process
    InProcess,
}

impl WorkerLauncher {
    /// Launcher for separate worker processes, locating the program first
    pub fn process(configured: Option<&Path>) -> Result<Self, WorkerError> {
        Ok(Self::Process {
            program: resolve_worker_program(configured)?,
        })
    }

    /// Start a worker
    pub async fn launch(&self) -> Result<WorkerHandle, WorkerError> {
        match self {
            Self::Process { program } => WorkerHandle::spawn_process(program),
            Self::InProcess => Ok(WorkerHandle::spawn_task()),
        }
    }
}

/// Locate the worker executable.
///
/// Order: explicit configuration, `GANTRY_WORKER_BIN`, next to the current
/// executable (or one level up, where test harnesses live), then `PATH`.
pub fn resolve_worker_program(configured: Option<&Path>) -> Result<PathBuf, WorkerError> {
    if let Some(path) = configured {
        return find_program(path).ok_or_else(|| {
            WorkerError::ProgramNotFound(path.display().to_string())
        });
    }

    if let Some(path) = std::env::var_os(WORKER_BIN_ENV) {
        let path = PathBuf::from(path);
        return find_program(&path).ok_or_else(|| {
            WorkerError::ProgramNotFound(format!("{}={}", WORKER_BIN_ENV, path.display()))
        });
    }

    let file_name = format!("{}{}", WORKER_PROGRAM, std::env::consts::EXE_SUFFIX);
    if let Ok(exe) = std::env::current_exe() {
        for dir in exe.ancestors().skip(1).take(2) {
            let candidate = dir.join(&file_name);
            if candidate.is_file() {
                debug!(path = %candidate.display(), "worker program found next to executable");
                return Ok(candidate);
            }
        }
    }

    which::which(WORKER_PROGRAM).map_err(|_| WorkerError::ProgramNotFound(WORKER_PROGRAM.to_string()))
}

fn find_program(path: &Path) -> Option<PathBuf> {
    if path.is_file() {
        return Some(path.to_path_buf());
    }
    which::which(path).ok()
}

enum Backend {
    Process(Child),
    Task(JoinHandle<Result<(), WorkerError>>),
}

/// Connection to one running worker
pub struct WorkerHandle {
    writer: BoxedWriter,
    lines: Lines<BufReader<BoxedReader>>,
    backend: Backend,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("pid", &self.pid())
            .finish()
    }
}

impl WorkerHandle {
    fn spawn_process(program: &Path) -> Result<Self, WorkerError> {
        let mut command = ProcessCommand::new(program);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        // Unit processes inherit the group, so one signal reaches all of them
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|source| WorkerError::Spawn {
                program: program.to_path_buf(),
                source,
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(WorkerError::Startup(
                "worker pipes were not captured".to_string(),
            ));
        };

        debug!(pid = ?child.id(), program = %program.display(), "worker process spawned");
        Ok(Self {
            writer: Box::new(stdin),
            lines: BufReader::new(Box::new(stdout) as BoxedReader).lines(),
            backend: Backend::Process(child),
        })
    }

    fn spawn_task() -> Self {
        let (supervisor_out, worker_in) = tokio::io::duplex(DUPLEX_CAPACITY);
        let (worker_out, supervisor_in) = tokio::io::duplex(DUPLEX_CAPACITY);
        let task = tokio::spawn(serve(worker_in, worker_out));

        debug!("in-process worker started");
        Self {
            writer: Box::new(supervisor_out),
            lines: BufReader::new(Box::new(supervisor_in) as BoxedReader).lines(),
            backend: Backend::Task(task),
        }
    }

    /// OS process id, `None` for in-process workers
    pub fn pid(&self) -> Option<u32> {
        match &self.backend {
            Backend::Process(child) => child.id(),
            Backend::Task(_) => None,
        }
    }

    /// Hand the worker its assignment and wait for the handshake
    pub async fn assign(
        &mut self,
        worker_id: usize,
        sequence: u64,
        partition: &str,
    ) -> Result<(), WorkerError> {
        self.send(&Command::Assign {
            worker_id,
            sequence,
            partition: partition.to_string(),
        })
        .await
        .map_err(|e| WorkerError::Startup(e.to_string()))?;

        match self.recv().await {
            Ok(Some(Reply::Ready { worker_id: id, pid })) if id == worker_id => {
                info!(worker = worker_id, sequence, pid, partition, "worker ready");
                Ok(())
            }
            Ok(Some(other)) => Err(WorkerError::Startup(format!(
                "unexpected handshake reply: {:?}",
                other
            ))),
            Ok(None) => Err(WorkerError::Startup(
                "worker exited before the handshake".to_string(),
            )),
            Err(e) => Err(WorkerError::Startup(e.to_string())),
        }
    }

    /// Send a command
    pub async fn send(&mut self, command: &Command) -> Result<(), WorkerError> {
        write_message(&mut self.writer, command).await
    }

    /// Receive the next reply, `None` when the worker closed its output
    pub async fn recv(&mut self) -> Result<Option<Reply>, WorkerError> {
        read_message(&mut self.lines).await
    }

    /// Forcefully terminate the worker and every process it started
    pub async fn kill(&mut self) {
        match &mut self.backend {
            Backend::Process(child) => {
                kill_process_group(child);
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "failed to kill worker process");
                }
            }
            Backend::Task(task) => task.abort(),
        }
    }

    /// Ask the worker to exit, killing it if it does not within the grace period
    pub async fn shutdown(mut self) {
        if let Err(e) = self.send(&Command::Shutdown).await {
            debug!(error = %e, "worker already gone at shutdown");
        }

        let exited = match &mut self.backend {
            Backend::Process(child) => tokio::time::timeout(SHUTDOWN_GRACE, child.wait())
                .await
                .map(|status| debug!(?status, "worker process exited"))
                .is_ok(),
            Backend::Task(task) => match tokio::time::timeout(SHUTDOWN_GRACE, task).await {
                Ok(Ok(Err(e))) => {
                    warn!(error = %e, "in-process worker ended with an error");
                    true
                }
                Ok(_) => true,
                Err(_) => false,
            },
        };

        if !exited {
            warn!("worker ignored shutdown, killing it");
            self.kill().await;
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if let Backend::Process(child) = &self.backend {
            kill_process_group(child);
        }
    }
}

/// SIGKILL the worker's process group. A reaped worker has no id and is
/// left alone, so a recycled group id is never signalled.
#[cfg(unix)]
fn kill_process_group(child: &Child) {
    let Some(pid) = child.id() else {
        return;
    };
    // The worker leads its own group, so its pid is the group id
    let result = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
    if result != 0 {
        let error = std::io::Error::last_os_error();
        if error.raw_os_error() != Some(libc::ESRCH) {
            warn!(pid, %error, "failed to kill worker process group");
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &Child) {}
