//! Remote command execution in pods.
//!
//! Two modes are supported:
//!
//! - **Interactive**: the local terminal is put into raw mode and bound to a
//!   TTY in the container. Terminal resizes are forwarded for the lifetime of
//!   the session. A non-zero exit of the remote shell is not an error.
//! - **Buffered**: stdin, stdout and stderr are exposed as in-process pipes.
//!   A worker task owns the remote stream, closes all three pipes when it
//!   ends and reports the terminal result once on a oneshot channel.

use std::future::Future;

use futures::SinkExt;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{AttachParams, TerminalSize};
use kube::ResourceExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::kubectl::client::ClusterClient;

/// Buffer size of each in-process pipe.
const PIPE_CAPACITY: usize = 64 * 1024;

/// A running buffered exec session.
pub struct ExecSession {
    /// Write end of the remote stdin. Drop or shut it down to send EOF.
    pub stdin: DuplexStream,
    /// Read end of the remote stdout.
    pub stdout: DuplexStream,
    /// Read end of the remote stderr.
    pub stderr: DuplexStream,
    done: oneshot::Receiver<Result<()>>,
}

impl ExecSession {
    /// Wait for the remote command to finish and return its result.
    ///
    /// All three pipes are closed first, so output that was not read yet is
    /// discarded instead of stalling the worker.
    ///
    /// # Errors
    /// Returns the stream's terminal error, or a stream error if the worker
    /// task went away without reporting.
    pub async fn wait(self) -> Result<()> {
        let Self {
            stdin,
            stdout,
            stderr,
            done,
        } = self;
        drop((stdin, stdout, stderr));

        done.await
            .unwrap_or_else(|_| Err(Error::Stream("exec worker exited without a result".into())))
    }

    /// Close stdin, drain stdout and stderr completely, then wait for the
    /// remote command.
    ///
    /// Each stream is drained by its own task; the buffers are only returned
    /// once both drains have finished.
    ///
    /// # Errors
    /// Returns the stream's terminal error, including
    /// [`Error::NonZeroExit`] for failed commands.
    pub async fn collect(self) -> Result<(Vec<u8>, Vec<u8>)> {
        let Self {
            mut stdin,
            stdout,
            stderr,
            done,
        } = self;
        stdin.shutdown().await.ok();
        drain(stdout, stderr, done).await
    }
}

/// Drain both output pipes on their own tasks, join them, then wait for the
/// terminal result.
async fn drain(
    stdout: DuplexStream,
    stderr: DuplexStream,
    done: oneshot::Receiver<Result<()>>,
) -> Result<(Vec<u8>, Vec<u8>)> {
    let (stdout, stderr) = tokio::join!(spawn_drain(stdout), spawn_drain(stderr));
    let stdout = join_drain(stdout)?;
    let stderr = join_drain(stderr)?;

    done.await
        .unwrap_or_else(|_| Err(Error::Stream("exec worker exited without a result".into())))?;

    Ok((stdout, stderr))
}

fn spawn_drain(mut reader: DuplexStream) -> JoinHandle<std::io::Result<Vec<u8>>> {
    tokio::spawn(async move {
        let mut buffer = Vec::new();
        reader.read_to_end(&mut buffer).await?;
        Ok(buffer)
    })
}

fn join_drain(
    result: std::result::Result<std::io::Result<Vec<u8>>, tokio::task::JoinError>,
) -> Result<Vec<u8>> {
    match result {
        Ok(Ok(buffer)) => Ok(buffer),
        Ok(Err(e)) => Err(Error::Io(e)),
        Err(e) => Err(Error::Stream(format!("drain task failed: {e}"))),
    }
}

/// Start a worker that pumps a remote stream through three local pipes.
///
/// `status` resolves once the remote side has finished; its result is sent
/// on the session's completion channel after stdout and stderr have been
/// fully copied and all pipes have been closed.
pub fn spawn_stream<I, O, E, S>(
    remote_stdin: Option<I>,
    remote_stdout: Option<O>,
    remote_stderr: Option<E>,
    status: S,
) -> ExecSession
where
    I: AsyncWrite + Unpin + Send + 'static,
    O: AsyncRead + Unpin + Send + 'static,
    E: AsyncRead + Unpin + Send + 'static,
    S: Future<Output = Result<()>> + Send + 'static,
{
    let (stdin, mut stdin_pipe) = tokio::io::duplex(PIPE_CAPACITY);
    let (stdout, mut stdout_pipe) = tokio::io::duplex(PIPE_CAPACITY);
    let (stderr, mut stderr_pipe) = tokio::io::duplex(PIPE_CAPACITY);
    let (done_tx, done) = oneshot::channel();

    tokio::spawn(async move {
        let stdin_pump = remote_stdin.map(|mut remote| {
            tokio::spawn(async move {
                if let Err(e) = tokio::io::copy(&mut stdin_pipe, &mut remote).await {
                    debug!(error = %e, "stdin pump stopped");
                }
                remote.shutdown().await.ok();
            })
        });

        let stdout_pump = async {
            if let Some(mut remote) = remote_stdout {
                pump(&mut remote, &mut stdout_pipe, "stdout").await;
            }
            stdout_pipe.shutdown().await.ok();
        };
        let stderr_pump = async {
            if let Some(mut remote) = remote_stderr {
                pump(&mut remote, &mut stderr_pipe, "stderr").await;
            }
            stderr_pipe.shutdown().await.ok();
        };
        tokio::join!(stdout_pump, stderr_pump);

        let result = status.await;

        if let Some(handle) = stdin_pump {
            handle.abort();
        }
        drop(stdout_pipe);
        drop(stderr_pipe);

        if done_tx.send(result).is_err() {
            debug!("exec session dropped before completion");
        }
    });

    ExecSession {
        stdin,
        stdout,
        stderr,
        done,
    }
}

/// Copy a remote stream into a pipe. If the reader of the pipe has gone away
/// the remote stream is still drained so the remote side can finish.
async fn pump<R, W>(remote: &mut R, pipe: &mut W, name: &str)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if let Err(e) = tokio::io::copy(remote, pipe).await {
        debug!(stream = name, error = %e, "pipe closed, discarding remaining output");
        tokio::io::copy(remote, &mut tokio::io::sink()).await.ok();
    }
}

/// Map the final status of a remote command to a result.
pub(crate) fn status_to_result(status: Option<Status>) -> Result<()> {
    let Some(status) = status else {
        return Ok(());
    };

    if status.status.as_deref() == Some("Success") {
        return Ok(());
    }

    if status.reason.as_deref() == Some("NonZeroExitCode") {
        let code = status
            .details
            .as_ref()
            .and_then(|d| d.causes.as_ref())
            .and_then(|causes| {
                causes
                    .iter()
                    .find(|c| c.reason.as_deref() == Some("ExitCode"))
            })
            .and_then(|c| c.message.as_deref())
            .and_then(|m| m.parse::<i32>().ok())
            .unwrap_or(1);
        return Err(Error::NonZeroExit { code });
    }

    Err(Error::Stream(
        status
            .message
            .unwrap_or_else(|| "remote command failed".to_string()),
    ))
}

/// Restores the terminal from raw mode when dropped.
struct RawModeGuard;

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = crossterm::terminal::disable_raw_mode() {
            warn!(error = %e, "Failed to restore terminal mode");
        }
    }
}

/// Put the local terminal into raw mode if stdin is a terminal.
fn setup_tty() -> Option<RawModeGuard> {
    use crossterm::tty::IsTty;

    if !std::io::stdin().is_tty() {
        info!("Unable to use a TTY - input is not a terminal or the right kind of file");
        return None;
    }

    match crossterm::terminal::enable_raw_mode() {
        Ok(()) => Some(RawModeGuard),
        Err(e) => {
            info!(error = %e, "Unable to switch terminal to raw mode");
            None
        }
    }
}

fn local_terminal_size() -> Option<TerminalSize> {
    crossterm::terminal::size()
        .ok()
        .map(|(width, height)| TerminalSize { width, height })
}

/// Forward local terminal size changes until the remote side stops listening.
async fn monitor_terminal_size(mut sizes: futures::channel::mpsc::Sender<TerminalSize>) {
    if let Some(size) = local_terminal_size() {
        if sizes.send(size).await.is_err() {
            return;
        }
    }

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let Ok(mut resized) = signal(SignalKind::window_change()) else {
            return;
        };
        while resized.recv().await.is_some() {
            if let Some(size) = local_terminal_size() {
                if sizes.send(size).await.is_err() {
                    break;
                }
            }
        }
    }
}

impl ClusterClient {
    /// Run a command attached to the local terminal and block until it exits.
    ///
    /// # Errors
    /// Returns an error if the session cannot be established or the
    /// transport fails. A non-zero exit code of the command is not an error.
    pub async fn exec_interactive(&self, pod: &Pod, container: &str, command: &[String]) -> Result<()> {
        let namespace = pod.namespace().unwrap_or_default();
        let name = pod.name_any();
        let raw = setup_tty();

        let params = if raw.is_some() {
            AttachParams::interactive_tty().container(container)
        } else {
            AttachParams::default()
                .container(container)
                .stdin(true)
                .stdout(true)
                .stderr(true)
        };

        debug!(pod = %name, container, ?command, tty = raw.is_some(), "Starting terminal session");
        let mut attached = self
            .pods(&namespace)
            .exec(&name, command.to_vec(), &params)
            .await?;

        let resize = if raw.is_some() {
            attached.terminal_size().map(|sizes| tokio::spawn(monitor_terminal_size(sizes)))
        } else {
            None
        };

        let remote_stdin = attached.stdin();
        let remote_stdout = attached.stdout();
        let remote_stderr = attached.stderr();
        let status = attached.take_status();

        let stdin_pump = remote_stdin.map(|mut remote| {
            tokio::spawn(async move {
                let mut local = tokio::io::stdin();
                tokio::io::copy(&mut local, &mut remote).await.ok();
            })
        });
        let stdout_pump = async {
            if let Some(mut remote) = remote_stdout {
                let mut local = tokio::io::stdout();
                tokio::io::copy(&mut remote, &mut local).await.ok();
                local.flush().await.ok();
            }
        };
        let stderr_pump = async {
            if let Some(mut remote) = remote_stderr {
                let mut local = tokio::io::stderr();
                tokio::io::copy(&mut remote, &mut local).await.ok();
            }
        };

        tokio::join!(stdout_pump, stderr_pump);
        let status = match status {
            Some(status) => status.await,
            None => None,
        };

        if let Some(handle) = stdin_pump {
            handle.abort();
        }
        if let Some(handle) = resize {
            handle.abort();
        }
        drop(raw);

        attached
            .join()
            .await
            .map_err(|e| Error::Stream(e.to_string()))?;

        match status_to_result(status) {
            Err(Error::NonZeroExit { code }) => {
                debug!(code, "Terminal session exited with non-zero code");
                Ok(())
            }
            other => other,
        }
    }

    /// Start a command with buffered stdin/stdout/stderr.
    ///
    /// # Errors
    /// Returns an error if the exec request cannot be established.
    pub async fn exec_stream(&self, pod: &Pod, container: &str, command: &[String]) -> Result<ExecSession> {
        let namespace = pod.namespace().unwrap_or_default();
        let name = pod.name_any();
        let params = AttachParams::default()
            .container(container)
            .stdin(true)
            .stdout(true)
            .stderr(true);

        debug!(pod = %name, container, ?command, "Starting buffered exec");
        let mut attached = self
            .pods(&namespace)
            .exec(&name, command.to_vec(), &params)
            .await?;

        let stdin = attached.stdin();
        let stdout = attached.stdout();
        let stderr = attached.stderr();
        let status = attached.take_status();

        let finished = async move {
            let status = match status {
                Some(status) => status.await,
                None => None,
            };
            attached
                .join()
                .await
                .map_err(|e| Error::Stream(e.to_string()))?;
            status_to_result(status)
        };

        Ok(spawn_stream(stdin, stdout, stderr, finished))
    }

    /// Run a command to completion, feeding it `input` on stdin, and return
    /// its stdout and stderr.
    ///
    /// # Errors
    /// Returns an error if the exec fails or the command exits non-zero.
    pub async fn exec_buffered(
        &self,
        pod: &Pod,
        container: &str,
        command: &[String],
        input: Option<Vec<u8>>,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let ExecSession {
            mut stdin,
            stdout,
            stderr,
            done,
        } = self.exec_stream(pod, container, command).await?;

        let feed = async move {
            if let Some(input) = input {
                stdin.write_all(&input).await?;
            }
            stdin.shutdown().await
        };
        let (fed, output) = tokio::join!(feed, drain(stdout, stderr, done));
        if let Err(e) = fed {
            debug!(error = %e, "stdin closed before all input was written");
        }

        output
    }
}
