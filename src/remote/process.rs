use std::io;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::process::{Child, Command};

use crate::error::{HostwardenError, Result};
use crate::remote::{BoxedReader, BoxedWriter, RemoteExit, RemoteSession, RemoteStreams};

type CommandBuilder = Box<dyn Fn(&str) -> Command + Send + Sync>;

/// Bytes of client stderr kept for classifying transport failures.
const STDERR_TAIL_BYTES: usize = 4096;

/// A session driven by a local client process, one child per started
/// command.
pub struct ProcessSession {
    host: String,
    build: CommandBuilder,
    /// Exit code the client uses for its own failures (ssh: 255).
    transport_failure_code: Option<i32>,
    /// Client stderr text that marks a transport failure as an
    /// authentication failure.
    auth_failure_markers: &'static [&'static str],
    stderr_tail: Arc<Mutex<Vec<u8>>>,
    child: Option<Child>,
}

impl ProcessSession {
    pub fn new(
        host: impl Into<String>,
        build: impl Fn(&str) -> Command + Send + Sync + 'static,
    ) -> Self {
        Self {
            host: host.into(),
            build: Box::new(build),
            transport_failure_code: None,
            auth_failure_markers: &[],
            stderr_tail: Arc::default(),
            child: None,
        }
    }

    pub fn with_transport_failure_code(mut self, code: i32) -> Self {
        self.transport_failure_code = Some(code);
        self
    }

    pub fn with_auth_failure_markers(mut self, markers: &'static [&'static str]) -> Self {
        self.auth_failure_markers = markers;
        self
    }

    fn transport_error(&self, code: i32) -> HostwardenError {
        let tail = match self.stderr_tail.lock() {
            Ok(tail) => String::from_utf8_lossy(&tail).into_owned(),
            Err(_) => String::new(),
        };
        match self
            .auth_failure_markers
            .iter()
            .find(|marker| tail.contains(**marker))
        {
            Some(marker) => HostwardenError::Auth {
                host: self.host.clone(),
                message: format!("{} (client exited with {})", marker, code),
            },
            None => self.network_error(format!("connection lost (client exited with {})", code)),
        }
    }

    fn network_error(&self, message: impl Into<String>) -> HostwardenError {
        HostwardenError::Network {
            host: self.host.clone(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl RemoteSession for ProcessSession {
    async fn start(&mut self, command: &str) -> Result<RemoteStreams> {
        if self.child.is_some() {
            return Err(HostwardenError::Config(format!(
                "a command is already running on {}",
                self.host
            )));
        }

        let mut child = (self.build)(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    HostwardenError::Config(format!("transport client not installed: {}", e))
                } else {
                    self.network_error(format!("failed to start session: {}", e))
                }
            })?;

        tracing::info!(host = %self.host, pid = ?child.id(), command, "Running command");

        if let Ok(mut tail) = self.stderr_tail.lock() {
            tail.clear();
        }
        let stderr_tail = self.stderr_tail.clone();

        let streams = RemoteStreams {
            stdin: child.stdin.take().map(|s| Box::new(s) as BoxedWriter),
            stdout: child.stdout.take().map(|s| Box::new(s) as BoxedReader),
            stderr: child.stderr.take().map(|s| {
                Box::new(TailReader {
                    inner: s,
                    tail: stderr_tail,
                }) as BoxedReader
            }),
        };
        self.child = Some(child);
        Ok(streams)
    }

    async fn wait(&mut self) -> Result<RemoteExit> {
        let status = match self.child.as_mut() {
            Some(child) => child.wait().await,
            None => return Err(self.network_error("session is closed")),
        };
        self.child = None;

        let status = status.map_err(|e| self.network_error(e.to_string()))?;
        match status.code() {
            Some(code) if Some(code) == self.transport_failure_code => {
                Err(self.transport_error(code))
            }
            code => Ok(RemoteExit { code }),
        }
    }

    async fn close(&mut self) {
        if let Some(mut child) = self.child.take() {
            tracing::debug!(host = %self.host, pid = ?child.id(), "Killing session process");
            if let Err(e) = child.kill().await {
                tracing::debug!(host = %self.host, error = %e, "Session process already gone");
            }
        }
    }
}

/// Passes reads through while remembering the last bytes seen.
struct TailReader<R> {
    inner: R,
    tail: Arc<Mutex<Vec<u8>>>,
}

impl<R: AsyncRead + Unpin> AsyncRead for TailReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let fresh = &buf.filled()[before..];
            if let Ok(mut tail) = self.tail.lock() {
                tail.extend_from_slice(fresh);
                if tail.len() > STDERR_TAIL_BYTES {
                    let excess = tail.len() - STDERR_TAIL_BYTES;
                    tail.drain(..excess);
                }
            }
        }
        poll
    }
}
