//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;

/// Daemon configuration. File: ~/.config/burrow/config.toml or
/// /etc/burrow/config.toml. Env overrides: BURROW_PASSWORD,
/// BURROW_SUPERNODE_HOST, BURROW_SUPERNODE_PORT, BURROW_LISTEN_PORT.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Shared overlay password.
    #[serde(default)]
    pub password: String,
    /// Supernode host name or address.
    #[serde(default = "default_supernode_host")]
    pub supernode_host: String,
    /// Supernode UDP port (default 9527).
    #[serde(default = "default_supernode_port")]
    pub supernode_port: u16,
    /// Local UDP listen port (default 9528).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// TUN interface name (default burrow0).
    #[serde(default = "default_interface")]
    pub interface: String,
    /// TUN MTU (default 1400, leaving room for the seal overhead).
    #[serde(default = "default_mtu")]
    pub mtu: u16,
}

fn default_supernode_host() -> String {
    "127.0.0.1".to_string()
}
fn default_supernode_port() -> u16 {
    9527
}
fn default_listen_port() -> u16 {
    9528
}
fn default_interface() -> String {
    "burrow0".to_string()
}
fn default_mtu() -> u16 {
    1400
}

impl Default for Config {
    fn default() -> Self {
        Self {
            password: String::new(),
            supernode_host: default_supernode_host(),
            supernode_port: default_supernode_port(),
            listen_port: default_listen_port(),
            interface: default_interface(),
            mtu: default_mtu(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_else(Config::default);
    if let Ok(s) = std::env::var("BURROW_PASSWORD") {
        c.password = s;
    }
    if let Ok(s) = std::env::var("BURROW_SUPERNODE_HOST") {
        c.supernode_host = s;
    }
    if let Ok(s) = std::env::var("BURROW_SUPERNODE_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.supernode_port = p;
        }
    }
    if let Ok(s) = std::env::var("BURROW_LISTEN_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.listen_port = p;
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/burrow/config.toml"));
    }
    out.push(PathBuf::from("/etc/burrow/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                if let Ok(c) = toml::from_str::<Config>(&s) {
                    return Some(c);
                }
            }
            break;
        }
    }
    None
}
