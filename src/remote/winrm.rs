//! WinRM transport through the `winrm` command-line client.
//!
//! The password is handed to the client as a flag and is therefore visible
//! in the local process list while the session runs.

use std::collections::BTreeMap;

use tokio::process::Command;

use crate::error::{HostwardenError, Result};
use crate::inventory::HostEntry;
use crate::remote::ProcessSession;

/// Characters `cmd.exe` interprets even inside a quoted `set "K=V"`.
const UNQUOTABLE: &[char] = &['"', '%', '\r', '\n'];

pub fn session(host: &HostEntry, env: &BTreeMap<String, String>) -> ProcessSession {
    let host = host.clone();
    let env = env.clone();
    ProcessSession::new(host.name.clone(), move |command: &str| {
        let mut cmd = Command::new("winrm");
        cmd.args(winrm_args(&host, &env, command));
        cmd
    })
}

/// Arguments for the `winrm` command-line client.
///
/// WinRM has no environment channel, so variables are set by the command
/// itself through `cmd.exe` `set` statements.
pub fn winrm_args(host: &HostEntry, env: &BTreeMap<String, String>, command: &str) -> Vec<String> {
    let mut args = vec![
        "-hostname".to_string(),
        host.address.clone(),
        "-port".to_string(),
        host.port.to_string(),
    ];
    if let Some(user) = &host.credentials.user {
        args.push("-username".to_string());
        args.push(user.clone());
    }
    if let Some(password) = &host.credentials.password {
        args.push("-password".to_string());
        args.push(password.clone());
    }
    if host.use_tls {
        args.push("-https".to_string());
    }
    args.push(with_env(env, command));
    args
}

/// Reject variables that cannot be passed literally through `set "K=V"`.
///
/// Inside the quotes `&`, `|`, `<`, `>`, `^` and parentheses are literal;
/// a quote or `%` would end the quoting or expand another variable.
pub fn check_env(host: &HostEntry, env: &BTreeMap<String, String>) -> Result<()> {
    for (key, value) in env {
        if key.is_empty() || key.contains('=') || key.contains(UNQUOTABLE) {
            return Err(HostwardenError::Config(format!(
                "environment variable name '{}' cannot be set over WinRM on {}",
                key, host.name
            )));
        }
        if value.contains(UNQUOTABLE) {
            return Err(HostwardenError::Config(format!(
                "value of {} cannot be set over WinRM on {}: contains a quote, % or line break",
                key, host.name
            )));
        }
    }
    Ok(())
}

fn with_env(env: &BTreeMap<String, String>, command: &str) -> String {
    let mut parts: Vec<String> = env
        .iter()
        .map(|(k, v)| format!("set \"{}={}\"", k, v))
        .collect();
    parts.push(command.to_string());
    parts.join(" && ")
}
