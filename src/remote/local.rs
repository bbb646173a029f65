use std::collections::BTreeMap;

use tokio::process::Command;

use crate::inventory::HostEntry;
use crate::remote::ProcessSession;

pub fn session(host: &HostEntry, env: &BTreeMap<String, String>) -> ProcessSession {
    let env = env.clone();
    ProcessSession::new(host.name.clone(), move |command: &str| {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command).envs(&env);
        cmd
    })
}
