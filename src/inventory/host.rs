use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::error::{HostwardenError, Result};

/// Remote execution channel used to reach a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransportKind {
    SecureShell,
    WindowsRemote,
    /// Run on the worker itself.
    Local,
}

impl TransportKind {
    pub fn default_port(&self, use_tls: bool) -> u16 {
        match self {
            TransportKind::SecureShell => 22,
            TransportKind::WindowsRemote if use_tls => 5986,
            TransportKind::WindowsRemote => 5985,
            TransportKind::Local => 0,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::SecureShell => write!(f, "ssh"),
            TransportKind::WindowsRemote => write!(f, "winrm"),
            TransportKind::Local => write!(f, "local"),
        }
    }
}

/// Connection parameters. Which fields are required depends on the
/// transport, see [`HostEntry::validate`].
#[derive(Clone, Default)]
pub struct Credentials {
    pub user: Option<String>,
    pub private_key_file: Option<PathBuf>,
    pub password: Option<String>,
}

// Keep secrets out of logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("private_key_file", &self.private_key_file)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// One claimable target host.
#[derive(Debug, Clone)]
pub struct HostEntry {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub credentials: Credentials,
    pub transport: TransportKind,
    /// WinRM over HTTPS.
    pub use_tls: bool,
    /// Variables injected into the remote process.
    pub environment: BTreeMap<String, String>,
}

impl HostEntry {
    pub fn new(name: impl Into<String>, address: impl Into<String>, transport: TransportKind) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            port: transport.default_port(false),
            credentials: Credentials::default(),
            transport,
            use_tls: false,
            environment: BTreeMap::new(),
        }
    }

    /// A host reached through the worker's own shell.
    pub fn local(name: impl Into<String>) -> Self {
        Self::new(name, "localhost", TransportKind::Local)
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(name.into(), value.into());
        self
    }

    /// `address:port`, bracketing IPv6 literals.
    pub fn endpoint(&self) -> String {
        if self.address.contains(':') && !self.address.starts_with('[') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }

    /// Check that the host carries what its transport needs. A failure here
    /// is a configuration error and is never retried.
    pub fn validate(&self) -> Result<()> {
        match self.transport {
            TransportKind::SecureShell => {
                if self.credentials.user.as_deref().unwrap_or("").is_empty() {
                    return Err(HostwardenError::Config(format!(
                        "host {} has no SSH user",
                        self.name
                    )));
                }
                match &self.credentials.private_key_file {
                    None => Err(HostwardenError::Config(format!(
                        "could not find a private key for host {}",
                        self.name
                    ))),
                    Some(path) if !path.is_file() => Err(HostwardenError::Config(format!(
                        "private key {} for host {} does not exist",
                        path.display(),
                        self.name
                    ))),
                    Some(_) => Ok(()),
                }
            }
            TransportKind::WindowsRemote => {
                if self.credentials.user.as_deref().unwrap_or("").is_empty()
                    || self.credentials.password.is_none()
                {
                    return Err(HostwardenError::Config(format!(
                        "host {} needs a user and password for WinRM",
                        self.name
                    )));
                }
                Ok(())
            }
            TransportKind::Local => Ok(()),
        }
    }
}
