//! Reader for Ansible INI inventories.
//!
//! Only the subset needed to describe claimable hosts is understood:
//! `[group]`, `[group:vars]` and `[group:children]` sections, `[all:vars]`,
//! and `name key=value ...` host lines. Host variables override group
//! variables, which override the variables of enclosing groups and `all`.
//! As in Ansible, `all` holds every host in the file, grouped or not.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;

use crate::error::{HostwardenError, Result};
use crate::inventory::host::{Credentials, HostEntry, TransportKind};

/// Host variables with this prefix become remote environment variables.
const ENV_VAR_PREFIX: &str = "env_";

type Vars = BTreeMap<String, String>;

#[derive(Debug, Default)]
struct Group {
    hosts: Vec<(String, Vars)>,
    vars: Vars,
    children: Vec<String>,
}

enum Section {
    Hosts(String),
    Vars(String),
    Children(String),
}

/// Parse `text` and return the hosts of `group`, in file order.
pub fn parse(text: &str, group: &str) -> Result<Vec<HostEntry>> {
    let groups = parse_groups(text)?;
    if !groups.contains_key(group) {
        return Err(HostwardenError::Inventory(format!(
            "host group [{}] not found in inventory",
            group
        )));
    }

    let base = groups.get("all").map(|g| g.vars.clone()).unwrap_or_default();
    let mut resolved = Vec::new();
    let mut seen_hosts = HashSet::new();
    let mut visiting = HashSet::new();
    resolve_group(
        &groups,
        group,
        &base,
        &mut visiting,
        &mut seen_hosts,
        &mut resolved,
    )?;

    if resolved.is_empty() {
        return Err(HostwardenError::Inventory(format!(
            "host group [{}] has no hosts",
            group
        )));
    }

    resolved
        .into_iter()
        .map(|(name, vars)| host_from_vars(name, &vars))
        .collect()
}

fn group_mut<'a>(
    groups: &'a mut HashMap<String, Group>,
    order: &mut Vec<String>,
    name: &str,
) -> &'a mut Group {
    if !groups.contains_key(name) {
        order.push(name.to_string());
    }
    groups.entry(name.to_string()).or_default()
}

fn parse_groups(text: &str) -> Result<HashMap<String, Group>> {
    let mut groups: HashMap<String, Group> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    // Hosts listed before any header belong to the implicit "ungrouped".
    let mut section = Section::Hosts("ungrouped".to_string());

    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if let Some(header) = line.strip_prefix('[') {
            let header = header.strip_suffix(']').ok_or_else(|| {
                HostwardenError::Inventory(format!(
                    "line {}: unterminated section header",
                    lineno + 1
                ))
            })?;
            section = match header.split_once(':') {
                Some((name, "vars")) => Section::Vars(name.to_string()),
                Some((name, "children")) => Section::Children(name.to_string()),
                Some((_, other)) => {
                    return Err(HostwardenError::Inventory(format!(
                        "line {}: unknown section kind '{}'",
                        lineno + 1,
                        other
                    )))
                }
                None => Section::Hosts(header.to_string()),
            };
            let name = match &section {
                Section::Hosts(n) | Section::Vars(n) | Section::Children(n) => n.clone(),
            };
            group_mut(&mut groups, &mut order, &name);
            continue;
        }

        match &section {
            Section::Hosts(group) => {
                let tokens = tokenize(line);
                let Some((name, rest)) = tokens.split_first() else {
                    continue;
                };
                let vars = parse_assignments(rest, lineno)?;
                group_mut(&mut groups, &mut order, group)
                    .hosts
                    .push((name.clone(), vars));
            }
            Section::Vars(group) => {
                let tokens = tokenize(line);
                let vars = parse_assignments(&tokens, lineno)?;
                group_mut(&mut groups, &mut order, group).vars.extend(vars);
            }
            Section::Children(group) => {
                group_mut(&mut groups, &mut order, group)
                    .children
                    .push(line.to_string());
            }
        }
    }

    // Every group is implicitly a child of `all`.
    let all = groups.entry("all".to_string()).or_default();
    for name in order.into_iter().filter(|g| g != "all") {
        if !all.children.contains(&name) {
            all.children.push(name);
        }
    }

    Ok(groups)
}

fn resolve_group(
    groups: &HashMap<String, Group>,
    name: &str,
    inherited: &Vars,
    visiting: &mut HashSet<String>,
    seen_hosts: &mut HashSet<String>,
    out: &mut Vec<(String, Vars)>,
) -> Result<()> {
    let Some(group) = groups.get(name) else {
        return Err(HostwardenError::Inventory(format!(
            "child group [{}] is not defined",
            name
        )));
    };
    if !visiting.insert(name.to_string()) {
        return Err(HostwardenError::Inventory(format!(
            "group [{}] is its own descendant",
            name
        )));
    }

    let mut vars = inherited.clone();
    vars.extend(group.vars.clone());

    for (host, host_vars) in &group.hosts {
        if !seen_hosts.insert(host.clone()) {
            continue;
        }
        let mut merged = vars.clone();
        merged.extend(host_vars.clone());
        out.push((host.clone(), merged));
    }

    for child in &group.children {
        resolve_group(groups, child, &vars, visiting, seen_hosts, out)?;
    }

    visiting.remove(name);
    Ok(())
}

fn host_from_vars(name: String, vars: &Vars) -> Result<HostEntry> {
    let get = |keys: &[&str]| keys.iter().find_map(|k| vars.get(*k).cloned());

    let transport = match get(&["ansible_connection"]).as_deref() {
        None | Some("ssh") | Some("smart") | Some("paramiko") => TransportKind::SecureShell,
        Some("winrm") => TransportKind::WindowsRemote,
        Some("local") => TransportKind::Local,
        Some(other) => {
            return Err(HostwardenError::Inventory(format!(
                "host {} uses unsupported connection '{}'",
                name, other
            )))
        }
    };
    let use_tls = get(&["ansible_winrm_scheme"]).as_deref() == Some("https");

    let port = match get(&["ansible_port", "ansible_ssh_port"]) {
        Some(p) => p.parse::<u16>().map_err(|_| {
            HostwardenError::Inventory(format!("host {} has invalid port '{}'", name, p))
        })?,
        None => transport.default_port(use_tls),
    };

    let address = get(&["ansible_host", "ansible_ssh_host"]).unwrap_or_else(|| name.clone());

    let credentials = Credentials {
        user: get(&["ansible_user", "ansible_ssh_user"]),
        private_key_file: get(&["ansible_ssh_private_key_file", "ansible_private_key_file"])
            .map(|p| PathBuf::from(expand_home(&p))),
        password: get(&["ansible_password", "ansible_ssh_pass"]),
    };

    let environment = vars
        .iter()
        .filter_map(|(k, v)| {
            k.strip_prefix(ENV_VAR_PREFIX)
                .filter(|name| !name.is_empty())
                .map(|name| (name.to_string(), v.clone()))
        })
        .collect();

    Ok(HostEntry {
        name,
        address,
        port,
        credentials,
        transport,
        use_tls,
        environment,
    })
}

fn expand_home(path: &str) -> String {
    match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path.to_string(),
    }
}

fn parse_assignments(tokens: &[String], lineno: usize) -> Result<Vars> {
    tokens
        .iter()
        .map(|token| {
            token
                .split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| {
                    HostwardenError::Inventory(format!(
                        "line {}: expected key=value, got '{}'",
                        lineno + 1,
                        token
                    ))
                })
        })
        .collect()
}

/// Split on whitespace, keeping quoted values together and dropping the
/// quotes.
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in line.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => quote = Some(c),
            None if c.is_whitespace() => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            None => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}
