//! Process launcher for stdio tool servers.
//!
//! A tool server is an ordinary executable that reads newline-delimited
//! JSON on stdin and writes it on stdout. [`launch`] starts one from a
//! [`ServerConfig`] and hands back a [`ProcessHandle`] owning the child and
//! all three of its pipes.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use curio_core::ServerConfig;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use crate::error::{McpError, TransportError};

/// How long output readers may keep draining once the process has exited.
pub const DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Everything a process produced before it exited.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    /// Termination status.
    pub status: ExitStatus,
    /// Captured stdout, lossily decoded as UTF-8.
    pub stdout: String,
    /// Captured stderr, lossily decoded as UTF-8.
    pub stderr: String,
}

/// Exclusive owner of a running tool server process.
///
/// The child is killed when the handle is dropped.
#[derive(Debug)]
pub struct ProcessHandle {
    /// Command the process was started from, for diagnostics.
    command: String,
    /// Process id, which is also the process group id on Unix.
    pid: u32,
    /// The child process.
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
}

/// Start the program described by `config`.
///
/// Environment overrides are merged over the inherited host environment.
/// Fails with [`McpError::Launch`] if the executable cannot be started.
pub fn launch(config: &ServerConfig) -> Result<ProcessHandle, McpError> {
    debug!(
        command = %config.command,
        args = ?config.args,
        "Launching tool server process"
    );

    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args)
        .envs(&config.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // Own process group, so descendants can be signalled together.
    #[cfg(unix)]
    cmd.process_group(0);

    if let Some(ref dir) = config.working_dir {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn().map_err(|source| McpError::Launch {
        command: config.command.clone(),
        source,
    })?;

    let pid = child.id().ok_or_else(|| McpError::Launch {
        command: config.command.clone(),
        source: std::io::Error::new(std::io::ErrorKind::Other, "process exited during spawn"),
    })?;

    debug!(command = %config.command, pid = pid, "Tool server process launched");

    Ok(ProcessHandle {
        command: config.command.clone(),
        pid,
        stdin: child.stdin.take(),
        stdout: child.stdout.take(),
        stderr: child.stderr.take(),
        child,
    })
}

impl ProcessHandle {
    /// Get the process ID, if the process has not been reaped yet.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Command this process was launched from.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Take ownership of the stdin pipe.
    pub fn take_stdin(&mut self) -> Result<ChildStdin, TransportError> {
        self.stdin.take().ok_or(TransportError::MissingPipe("stdin"))
    }

    /// Take ownership of the stdout pipe.
    pub fn take_stdout(&mut self) -> Result<ChildStdout, TransportError> {
        self.stdout.take().ok_or(TransportError::MissingPipe("stdout"))
    }

    /// Take ownership of the stderr pipe.
    pub fn take_stderr(&mut self) -> Result<ChildStderr, TransportError> {
        self.stderr.take().ok_or(TransportError::MissingPipe("stderr"))
    }

    /// Write `bytes` to stdin, then close it so the child sees end of input.
    pub async fn write_and_close(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut stdin = self.take_stdin()?;
        stdin.write_all(bytes).await.map_err(TransportError::WriteError)?;
        stdin.flush().await.map_err(TransportError::WriteError)?;
        Ok(())
    }

    /// Wait for the process to exit, capturing stdout and stderr.
    ///
    /// Both streams are read concurrently with the wait so a chatty stderr
    /// cannot block a child that is still writing stdout. Once the child has
    /// exited, the readers get [`DRAIN_GRACE`] to reach end of stream; a
    /// background descendant still holding a pipe open does not hold up the
    /// result.
    pub async fn collect_output(&mut self) -> Result<ProcessOutput, TransportError> {
        let (stdout_pipe, stderr_pipe) = (self.stdout.take(), self.stderr.take());
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        let status = {
            let (stdout_buf, stderr_buf) = (&mut stdout, &mut stderr);
            let reads = async move {
                tokio::try_join!(
                    read_into(stdout_pipe, stdout_buf),
                    read_into(stderr_pipe, stderr_buf)
                )
            };
            tokio::pin!(reads);

            let exited = tokio::select! {
                read = &mut reads => {
                    read?;
                    None
                }
                status = self.child.wait() => {
                    Some(status.map_err(TransportError::TerminateFailed)?)
                }
            };

            match exited {
                Some(status) => {
                    match tokio::time::timeout(DRAIN_GRACE, &mut reads).await {
                        Ok(read) => {
                            read?;
                        }
                        Err(_) => debug!(
                            command = %self.command,
                            "Output still open after exit, keeping what was captured"
                        ),
                    }
                    status
                }
                None => self
                    .child
                    .wait()
                    .await
                    .map_err(TransportError::TerminateFailed)?,
            }
        };

        Ok(ProcessOutput {
            status,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    /// Forcibly kill the process and its process group, and reap it.
    ///
    /// Safe to call after the process exited on its own; that only clears
    /// out descendants it left behind.
    pub async fn kill(&mut self) -> Result<(), TransportError> {
        debug!(command = %self.command, pid = self.pid, "Killing tool server process group");

        #[cfg(unix)]
        self.signal_group(nix::sys::signal::Signal::SIGKILL);

        if let Ok(Some(_)) = self.child.try_wait() {
            return Ok(());
        }
        self.child.kill().await.map_err(TransportError::TerminateFailed)
    }

    /// Ask the process group to exit, escalating to a kill after `grace`.
    pub async fn terminate(&mut self, grace: Duration) -> Result<(), TransportError> {
        if let Ok(Some(status)) = self.child.try_wait() {
            debug!(command = %self.command, ?status, "Tool server already exited");
            return self.kill().await;
        }

        // On Unix, send SIGTERM. On Windows, just kill.
        #[cfg(unix)]
        {
            let pid = self.pid;
            debug!(pid = pid, "Sending SIGTERM to tool server");
            self.signal_group(nix::sys::signal::Signal::SIGTERM);

            tokio::select! {
                _ = self.child.wait() => {
                    debug!(pid = pid, "Tool server exited gracefully");
                }
                _ = tokio::time::sleep(grace) => {
                    warn!(pid = pid, "Tool server did not exit gracefully, killing");
                }
            }
        }

        // Reaps the leader and clears any stragglers left in the group.
        self.kill().await
    }

    /// Send `signal` to every process in the child's group.
    #[cfg(unix)]
    fn signal_group(&self, signal: nix::sys::signal::Signal) {
        use nix::sys::signal::killpg;
        use nix::unistd::Pid;

        // The group outlives a reaped leader only while members remain, so
        // the id cannot be recycled underneath us.
        if let Err(e) = killpg(Pid::from_raw(self.pid as i32), signal) {
            tracing::trace!(pid = self.pid, ?signal, error = %e, "Process group not signalled");
        }
    }
}

/// Read `reader` to end of stream, appending to `buf` as data arrives so a
/// cancelled read keeps what it already received.
async fn read_into<R>(reader: Option<R>, buf: &mut Vec<u8>) -> Result<(), TransportError>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok(());
    };

    let mut chunk = [0u8; 8192];
    loop {
        let n = reader
            .read(&mut chunk)
            .await
            .map_err(TransportError::ReadError)?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}
