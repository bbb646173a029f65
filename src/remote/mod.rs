//! Remote execution channels.
//!
//! A [`SessionConnector`] opens a [`RemoteSession`] to a claimed host; the
//! session runs one command at a time and hands back its stdio streams so the
//! supervisor can copy them concurrently while waiting for the exit.
//!
//! All built-in transports drive a local client process through
//! `tokio::process`:
//!
//! - [`ssh`]: the OpenSSH client, key-file authentication
//! - [`winrm`]: the `winrm` command-line client, user/password authentication
//! - [`local`]: `sh -c` on the worker itself

pub mod local;
pub mod process;
pub mod ssh;
pub mod winrm;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{HostwardenError, Result};
use crate::inventory::{HostEntry, TransportKind};

pub use process::ProcessSession;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Stdio of a started remote command. Each stream is handed out once.
#[derive(Default)]
pub struct RemoteStreams {
    pub stdin: Option<BoxedWriter>,
    pub stdout: Option<BoxedReader>,
    pub stderr: Option<BoxedReader>,
}

/// How a remote command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteExit {
    /// `None` when the process was ended by a signal.
    pub code: Option<i32>,
}

impl RemoteExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// An open command channel to one host.
#[async_trait]
pub trait RemoteSession: Send {
    /// Start `command` on the host.
    async fn start(&mut self, command: &str) -> Result<RemoteStreams>;

    /// Block until the started command exits.
    ///
    /// A broken channel is reported as `HostwardenError::Network`, or `Auth`
    /// when the client says the login was refused, distinct from the command
    /// exiting on its own. Cancel-safe.
    async fn wait(&mut self) -> Result<RemoteExit>;

    /// Tear the session down, aborting any running command and unblocking
    /// pending stream reads. Idempotent.
    async fn close(&mut self);
}

/// Opens sessions to hosts.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    /// `env` is injected into the remote command's environment.
    ///
    /// Fails with `Config` for unusable credentials, and with `Network`
    /// when the host cannot be reached.
    async fn open(
        &self,
        host: &HostEntry,
        env: &BTreeMap<String, String>,
    ) -> Result<Box<dyn RemoteSession>>;
}

/// Picks the transport from each host's inventory entry.
#[derive(Debug, Clone)]
pub struct TransportConnector {
    connect_timeout: Duration,
}

impl TransportConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl SessionConnector for TransportConnector {
    async fn open(
        &self,
        host: &HostEntry,
        env: &BTreeMap<String, String>,
    ) -> Result<Box<dyn RemoteSession>> {
        host.validate()?;
        tracing::info!(
            host = %host.name,
            endpoint = %host.endpoint(),
            transport = %host.transport,
            user = ?host.credentials.user,
            "Connecting to host"
        );

        let session = match host.transport {
            TransportKind::SecureShell => {
                probe(host, self.connect_timeout).await?;
                ssh::session(host, env, self.connect_timeout)
            }
            TransportKind::WindowsRemote => {
                winrm::check_env(host, env)?;
                probe(host, self.connect_timeout).await?;
                winrm::session(host, env)
            }
            TransportKind::Local => local::session(host, env),
        };
        Ok(Box::new(session))
    }
}

/// Fail fast with a network error when the endpoint does not accept TCP
/// connections.
async fn probe(host: &HostEntry, timeout: Duration) -> Result<()> {
    let endpoint = host.endpoint();
    match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(&endpoint)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(HostwardenError::Network {
            host: host.name.clone(),
            message: format!("failed to dial {}: {}", endpoint, e),
        }),
        Err(_) => Err(HostwardenError::Network {
            host: host.name.clone(),
            message: format!("timed out dialing {} after {:?}", endpoint, timeout),
        }),
    }
}
