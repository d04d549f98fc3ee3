//! Load config from file and environment.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use handoff_core::{PeerEntry, PeerId, Settings, StaticPeerDirectory};
use serde::Deserialize;

/// Daemon configuration. File: `--config <path>`, else ~/.config/handoff/config.toml or
/// /etc/handoff/config.toml. Env overrides: HANDOFF_LISTEN_PORT, HANDOFF_DOWNLOAD_PATH,
/// HANDOFF_MAX_CONCURRENT.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Id other peers know this host by (default: hostname).
    #[serde(default = "default_peer_id")]
    pub peer_id: String,
    #[serde(default = "default_name")]
    pub name: String,
    /// TCP listen port (default 45680).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Files dropped in `<outbox>/<peer-id>/` are offered to that peer.
    #[serde(default = "default_outbox")]
    pub outbox: PathBuf,
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    /// Request encryption for outbox batches (default true).
    #[serde(default = "default_encrypt")]
    pub encrypt: bool,
    #[serde(default)]
    pub transfer: Settings,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Where to dial the peer. Peers without one can only be reached after they connect.
    pub addr: Option<SocketAddr>,
    #[serde(default)]
    pub trusted: bool,
    #[serde(default)]
    pub blocked: bool,
}

fn default_peer_id() -> String {
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "handoff-linux".to_string())
}
fn default_name() -> String {
    default_peer_id()
}
fn default_listen_port() -> u16 {
    45680
}
fn default_outbox() -> PathBuf {
    PathBuf::from("outbox")
}
fn default_state_file() -> PathBuf {
    PathBuf::from("handoff-tasks.json")
}
fn default_encrypt() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            peer_id: default_peer_id(),
            name: default_name(),
            listen_port: default_listen_port(),
            outbox: default_outbox(),
            state_file: default_state_file(),
            encrypt: default_encrypt(),
            transfer: Settings::default(),
            peers: Vec::new(),
        }
    }
}

impl Config {
    pub fn directory(&self) -> StaticPeerDirectory {
        let mut directory = StaticPeerDirectory::new();
        for p in &self.peers {
            let name = if p.name.is_empty() { p.id.clone() } else { p.name.clone() };
            directory.insert(
                PeerId::new(p.id.clone()),
                PeerEntry {
                    name,
                    trusted: p.trusted,
                    blocked: p.blocked,
                },
            );
        }
        directory
    }

    /// Every configured peer with its dial address, if any.
    pub fn peer_addrs(&self) -> HashMap<PeerId, Option<SocketAddr>> {
        self.peers
            .iter()
            .map(|p| (PeerId::new(p.id.clone()), p.addr))
            .collect()
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers
            .iter()
            .filter(|p| !p.blocked)
            .map(|p| PeerId::new(p.id.clone()))
            .collect()
    }
}

/// Load config: explicit path, else the first existing default path, else defaults; then env vars.
pub fn load(path: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match path {
        Some(p) => load_file(p)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(p) => load_file(&p)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    Ok(c)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = var("HANDOFF_LISTEN_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.listen_port = p;
    }
    if let Some(s) = var("HANDOFF_DOWNLOAD_PATH").filter(|s| !s.is_empty()) {
        c.transfer.download_path = PathBuf::from(s);
    }
    if let Some(n) = var("HANDOFF_MAX_CONCURRENT").and_then(|s| s.parse::<usize>().ok()) {
        c.transfer.max_concurrent_tasks = n;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/handoff/config.toml"));
    }
    out.push(PathBuf::from("/etc/handoff/config.toml"));
    out
}

fn load_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
peer_id = "desk"
name = "Desk"
listen_port = 5000
outbox = "/srv/outbox"

[transfer]
download_path = "/srv/in"
max_concurrent_tasks = 2
encryption = "aes-gcm"
blocked_extensions = ["exe"]

[transfer.cleanup]
completed = true

[[peers]]
id = "laptop"
name = "Laptop"
addr = "192.168.1.20:45680"
trusted = true

[[peers]]
id = "phone"
"#;

    #[test]
    fn parses_file() {
        let c: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(c.peer_id, "desk");
        assert_eq!(c.listen_port, 5000);
        assert_eq!(c.transfer.max_concurrent_tasks, 2);
        assert_eq!(c.transfer.encryption, handoff_core::EncryptionType::AesGcm);
        assert!(c.transfer.cleanup.completed);
        assert_eq!(c.transfer.cleanup.delay_secs, 5);
        assert_eq!(c.state_file, default_state_file());
        assert!(c.encrypt);

        let addrs = c.peer_addrs();
        assert!(addrs[&PeerId::from("laptop")].is_some());
        assert!(addrs[&PeerId::from("phone")].is_none());
        let dir = c.directory();
        use handoff_core::PeerDirectory;
        assert!(dir.is_trusted(&PeerId::from("laptop")));
        assert_eq!(dir.display_name(&PeerId::from("phone")).as_deref(), Some("phone"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 1").is_err());
    }

    #[test]
    fn env_overrides() {
        let mut c: Config = toml::from_str(SAMPLE).unwrap();
        apply_env(&mut c, |key| match key {
            "HANDOFF_LISTEN_PORT" => Some("6000".into()),
            "HANDOFF_DOWNLOAD_PATH" => Some("/tmp/in".into()),
            "HANDOFF_MAX_CONCURRENT" => Some("not a number".into()),
            _ => None,
        });
        assert_eq!(c.listen_port, 6000);
        assert_eq!(c.transfer.download_path, PathBuf::from("/tmp/in"));
        assert_eq!(c.transfer.max_concurrent_tasks, 2);
    }
}
