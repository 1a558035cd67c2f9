//! Process execution under a hard wall-clock budget.
//!
//! - Arguments are handed over as a discrete list, never through a shell
//! - The child gets its own process group so a timeout kills its descendants too
//! - Timed-out and cancelled children are killed and reaped, pipes are closed
//! - The budget covers the child itself; leftovers in its group are killed once it exits

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const PIPE_DRAIN: Duration = Duration::from_millis(250);

/// Result of a child that ran to completion.
#[derive(Debug, Clone)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[derive(Debug, Clone)]
pub enum ProcessOutcome {
    /// The process ran and exited (successfully or not).
    Exited(ExitInfo),
    /// The process could not be started at all.
    SpawnFailed(String),
    /// The process exceeded its budget and was killed.
    TimedOut { elapsed: Duration },
}

/// Stateless executor shared by sensor sources and alert handlers.
pub struct ProcessExecutor;

impl ProcessExecutor {
    /// Runs `command` with `args`, waiting at most `timeout`.
    ///
    /// Dropping the returned future before completion kills the child as well.
    pub async fn run(command: impl AsRef<Path>, args: &[String], timeout: Duration) -> ProcessOutcome {
        let command = command.as_ref();
        let start = Instant::now();
        debug!(command = %command.display(), ?args, ?timeout, "spawning process");

        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                debug!(command = %command.display(), error = %e, "process spawn failed");
                return ProcessOutcome::SpawnFailed(e.to_string());
            }
        };
        let mut guard = GroupGuard::new(&child);

        // Pipes are read concurrently so a chatty child never blocks on a full buffer.
        let stdout = tokio::spawn(read_pipe(child.stdout.take()));
        let stderr = tokio::spawn(read_pipe(child.stderr.take()));

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                // background children may still hold the pipes open
                guard.kill_group();
                guard.disarm();
                let (stdout, stderr) = tokio::join!(collect_pipe(stdout), collect_pipe(stderr));
                ProcessOutcome::Exited(ExitInfo {
                    code: status.code(),
                    stdout,
                    stderr,
                    elapsed: start.elapsed(),
                })
            }
            Ok(Err(e)) => {
                reap(&mut child, &mut guard).await;
                stdout.abort();
                stderr.abort();
                ProcessOutcome::SpawnFailed(e.to_string())
            }
            Err(_) => {
                warn!(command = %command.display(), ?timeout, "process timed out, killing it");
                reap(&mut child, &mut guard).await;
                stdout.abort();
                stderr.abort();
                ProcessOutcome::TimedOut { elapsed: start.elapsed() }
            }
        }
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Output of an exited child; gives up after `PIPE_DRAIN` if the pipe stays open.
async fn collect_pipe(reader: JoinHandle<String>) -> String {
    let abort = reader.abort_handle();
    match tokio::time::timeout(PIPE_DRAIN, reader).await {
        Ok(output) => output.unwrap_or_default(),
        Err(_) => {
            abort.abort();
            debug!("pipe still open after exit, output truncated");
            String::new()
        }
    }
}

async fn reap(child: &mut Child, guard: &mut GroupGuard) {
    guard.kill_group();
    guard.disarm();
    // kill() also waits, so no zombie is left behind
    if let Err(e) = child.kill().await {
        debug!(error = %e, "child already gone");
    }
}

/// Kills the child's whole process group unless disarmed.
///
/// Armed while the child may still be running, so that cancellation of the
/// `run` future also takes down grandchildren that `kill_on_drop` cannot see.
struct GroupGuard {
    pgid: Option<u32>,
}

impl GroupGuard {
    fn new(child: &Child) -> Self {
        Self { pgid: child.id() }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }

    fn kill_group(&self) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;
            if let Some(pgid) = self.pgid {
                let _ = killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL);
            }
        }
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        self.kill_group();
    }
}
