//! Load config from file and environment.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use ring_core::RingConfig;

/// Node configuration. File: ~/.config/ringchat/config.toml or /etc/ringchat/config.toml.
/// Env overrides: RINGCHAT_HOST, RINGCHAT_RENDEZVOUS, RINGCHAT_TICK_MS, RINGCHAT_PORT_MIN,
/// RINGCHAT_PORT_MAX.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Interface to bind and advertise (default 127.0.0.1).
    #[serde(default = "default_host")]
    pub host: IpAddr,
    /// Rendezvous server address (default 127.0.0.1:5000).
    #[serde(default = "default_rendezvous")]
    pub rendezvous: SocketAddr,
    /// First port tried when binding (default 9000).
    #[serde(default = "default_port_min")]
    pub port_min: u16,
    /// Last port tried when binding (default 9999).
    #[serde(default = "default_port_max")]
    pub port_max: u16,
    /// Milliseconds per protocol tick (default 500).
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default)]
    pub protocol: ProtocolConfig,
}

/// Optional `[protocol]` table; anything unset keeps the protocol default.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProtocolConfig {
    pub max_attempts: Option<u32>,
    pub join_step_timeout_ticks: Option<u64>,
    pub join_wait_ticks: Option<u64>,
    pub checkup_after_ticks: Option<u64>,
    pub resend_after_ticks: Option<u64>,
    pub sweep_timeout_ticks: Option<u64>,
    /// 0 disables periodic sweeps.
    pub sweep_interval_ticks: Option<u64>,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}
fn default_rendezvous() -> SocketAddr {
    SocketAddr::new(default_host(), 5000)
}
fn default_port_min() -> u16 {
    9000
}
fn default_port_max() -> u16 {
    9999
}
fn default_tick_ms() -> u64 {
    500
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            rendezvous: default_rendezvous(),
            port_min: default_port_min(),
            port_max: default_port_max(),
            tick_ms: default_tick_ms(),
            protocol: ProtocolConfig::default(),
        }
    }
}

impl Config {
    /// Protocol constants with file overrides applied.
    pub fn ring_config(&self) -> RingConfig {
        let mut rc = RingConfig::default();
        let p = &self.protocol;
        if let Some(v) = p.max_attempts {
            rc.max_attempts = v;
        }
        if let Some(v) = p.join_step_timeout_ticks {
            rc.join_step_timeout_ticks = v;
        }
        if let Some(v) = p.join_wait_ticks {
            rc.join_wait_ticks = v;
        }
        if let Some(v) = p.checkup_after_ticks {
            rc.checkup_after_ticks = v;
        }
        if let Some(v) = p.resend_after_ticks {
            rc.resend_after_ticks = v;
        }
        if let Some(v) = p.sweep_timeout_ticks {
            rc.sweep_timeout_ticks = v;
        }
        if let Some(v) = p.sweep_interval_ticks {
            rc.sweep_interval_ticks = (v > 0).then_some(v);
        }
        rc
    }
}

/// Load config: merge default, then config file (explicit path or first found), then env vars.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(path) => parse_file(path)?,
        None => load_file().unwrap_or_default(),
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    Ok(c)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("RINGCHAT_HOST") {
        if let Ok(h) = s.parse::<IpAddr>() {
            c.host = h;
        }
    }
    if let Some(s) = var("RINGCHAT_RENDEZVOUS") {
        if let Ok(a) = s.parse::<SocketAddr>() {
            c.rendezvous = a;
        }
    }
    if let Some(s) = var("RINGCHAT_TICK_MS") {
        if let Ok(t) = s.parse::<u64>() {
            c.tick_ms = t.max(1);
        }
    }
    if let Some(s) = var("RINGCHAT_PORT_MIN") {
        if let Ok(p) = s.parse::<u16>() {
            c.port_min = p;
        }
    }
    if let Some(s) = var("RINGCHAT_PORT_MAX") {
        if let Ok(p) = s.parse::<u16>() {
            c.port_max = p;
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/ringchat/config.toml"));
    }
    out.push(PathBuf::from("/etc/ringchat/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match parse_file(&p) {
                Ok(c) => return Some(c),
                Err(e) => tracing::warn!(path = %p.display(), "ignoring config file: {e:#}"),
            }
            break;
        }
    }
    None
}

fn parse_file(path: &Path) -> anyhow::Result<Config> {
    use anyhow::Context;
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let c = toml::from_str::<Config>(&s).with_context(|| format!("parsing {}", path.display()))?;
    Ok(c)
}
