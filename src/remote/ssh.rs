use std::collections::BTreeMap;
use std::time::Duration;

use tokio::process::Command;

use crate::inventory::HostEntry;
use crate::remote::ProcessSession;

/// OpenSSH reports its own failures (connection, authentication) as 255.
const SSH_FAILURE_CODE: i32 = 255;

/// Client messages for a login the server refused.
const SSH_AUTH_FAILURES: &[&str] = &[
    "Permission denied",
    "Too many authentication failures",
    "Host key verification failed",
];

/// Server keepalive: a dead connection is noticed after roughly
/// `SERVER_ALIVE_INTERVAL_SECS * SERVER_ALIVE_COUNT_MAX` seconds.
const SERVER_ALIVE_INTERVAL_SECS: u64 = 15;
const SERVER_ALIVE_COUNT_MAX: u32 = 3;

pub fn session(
    host: &HostEntry,
    env: &BTreeMap<String, String>,
    connect_timeout: Duration,
) -> ProcessSession {
    let host = host.clone();
    let env = env.clone();
    ProcessSession::new(host.name.clone(), move |command: &str| {
        let mut cmd = Command::new("ssh");
        cmd.args(ssh_args(&host, &env, connect_timeout, command));
        cmd
    })
    .with_transport_failure_code(SSH_FAILURE_CODE)
    .with_auth_failure_markers(SSH_AUTH_FAILURES)
}

/// Arguments for the `ssh` client.
///
/// A pseudo-terminal is forced so the remote process is hung up when the
/// connection drops instead of outliving it. The remote side only accepts
/// variables listed in its sshd `AcceptEnv` setting.
pub fn ssh_args(
    host: &HostEntry,
    env: &BTreeMap<String, String>,
    connect_timeout: Duration,
    command: &str,
) -> Vec<String> {
    let mut args = vec![
        "-tt".to_string(),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=accept-new".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={}", connect_timeout.as_secs().max(1)),
        "-o".to_string(),
        format!("ServerAliveInterval={}", SERVER_ALIVE_INTERVAL_SECS),
        "-o".to_string(),
        format!("ServerAliveCountMax={}", SERVER_ALIVE_COUNT_MAX),
        "-p".to_string(),
        host.port.to_string(),
    ];

    if let Some(key) = &host.credentials.private_key_file {
        args.push("-i".to_string());
        args.push(key.display().to_string());
    }
    if let Some(user) = &host.credentials.user {
        args.push("-l".to_string());
        args.push(user.clone());
    }
    if !env.is_empty() {
        let pairs: Vec<String> = env
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, escape_quoted(v)))
            .collect();
        args.push("-o".to_string());
        args.push(format!("SetEnv={}", pairs.join(" ")));
    }

    args.push(host.address.clone());
    args.push("--".to_string());
    args.push(command.to_string());
    args
}

fn escape_quoted(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
