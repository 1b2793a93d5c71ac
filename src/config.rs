use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct P2pConfig {
    /// local address the session's UDP socket binds to
    pub bind_addr: SocketAddr,

    /// a tracked send that is not acknowledged within this window is declared failed
    pub ack_timeout: Duration,
    /// period of the sweep that fails expired pending sends
    pub watchdog_interval: Duration,

    /// number of times an application level operation is re-issued after a timeout before
    ///  it is reported as failed. 0 means 'no retries', i.e. a single send per timeout window.
    pub operation_retries: u32,

    /// bomb lifetime for a new game, sent as `bombtime` in START and PASS_BOMB
    pub bomb_time_millis: i32,
    /// maximum number of remote peers in a game
    pub peer_capacity: usize,
}

impl P2pConfig {
    pub fn new(bind_addr: SocketAddr) -> P2pConfig {
        P2pConfig {
            bind_addr,
            ack_timeout: Duration::from_secs(300),
            watchdog_interval: Duration::from_secs(1),
            operation_retries: 0,
            bomb_time_millis: 5000,
            peer_capacity: 8,
        }
    }

    pub fn for_port(local_port: u16) -> P2pConfig {
        Self::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), local_port))
    }

    pub fn local_port(&self) -> u16 {
        self.bind_addr.port()
    }

    /// Rejects settings the watchdog cannot work with: a zero sweep period or ack timeout
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ack_timeout.is_zero() {
            anyhow::bail!("ack timeout must be positive");
        }
        if self.watchdog_interval.is_zero() {
            anyhow::bail!("watchdog interval must be positive");
        }
        Ok(())
    }

    pub fn from_toml_str(s: &str) -> anyhow::Result<P2pConfig> {
        let file: ConfigFile = toml::from_str(s)
            .context("invalid configuration")?;
        let config: P2pConfig = file.into();
        config.validate()
            .context("invalid configuration")?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<P2pConfig> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration file {}", path.display()))?;
        Self::from_toml_str(&s)
    }
}

/// on-disk representation - durations are given in milliseconds
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    bind_ip: IpAddr,
    local_port: u16,
    ack_timeout_ms: u64,
    watchdog_interval_ms: u64,
    operation_retries: u32,
    bomb_time_ms: i32,
    peer_capacity: usize,
}
impl Default for ConfigFile {
    fn default() -> Self {
        let defaults = P2pConfig::for_port(0);
        ConfigFile {
            bind_ip: defaults.bind_addr.ip(),
            local_port: defaults.bind_addr.port(),
            ack_timeout_ms: defaults.ack_timeout.as_millis() as u64,
            watchdog_interval_ms: defaults.watchdog_interval.as_millis() as u64,
            operation_retries: defaults.operation_retries,
            bomb_time_ms: defaults.bomb_time_millis,
            peer_capacity: defaults.peer_capacity,
        }
    }
}
impl From<ConfigFile> for P2pConfig {
    fn from(value: ConfigFile) -> Self {
        P2pConfig {
            bind_addr: SocketAddr::new(value.bind_ip, value.local_port),
            ack_timeout: Duration::from_millis(value.ack_timeout_ms),
            watchdog_interval: Duration::from_millis(value.watchdog_interval_ms),
            operation_retries: value.operation_retries,
            bomb_time_millis: value.bomb_time_ms,
            peer_capacity: value.peer_capacity,
        }
    }
}
