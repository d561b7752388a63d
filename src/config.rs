use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Advertised in option 54 on every reply.
    pub server_ip: Ipv4Addr,
    /// Address the DHCP socket binds to (port 67).
    pub listen_ip: Ipv4Addr,
    pub interface_index: Option<u32>,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub failover: FailoverConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub redis_url: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub listen: SocketAddr,
    /// When set, the daemon resolves leases through this resolution service
    /// instead of talking to the store directly.
    pub url: Option<String>,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Active,
    Standby,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    pub role: Role,
    /// Lets a standby that has taken over create new dynamic bindings.
    pub allow_standby_allocation: bool,
    /// `host:port` of the active peer's heartbeat service.
    pub peer: Option<String>,
    pub heartbeat_listen: SocketAddr,
    pub probe_timeout_ms: u64,
    /// Reuse the last probe verdict for this long. Zero probes every packet.
    pub debounce_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379/0".to_string(),
            timeout_ms: 1000,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            url: None,
            timeout_ms: 2000,
        }
    }
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            role: Role::Active,
            allow_standby_allocation: false,
            peer: None,
            heartbeat_listen: SocketAddr::from(([0, 0, 0, 0], 8079)),
            probe_timeout_ms: 500,
            debounce_ms: 0,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_ip: Ipv4Addr::new(192, 168, 1, 1),
            listen_ip: Ipv4Addr::UNSPECIFIED,
            interface_index: None,
            store: StoreConfig::default(),
            api: ApiConfig::default(),
            failover: FailoverConfig::default(),
        }
    }
}

impl Config {
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_ip.is_unspecified() || self.server_ip.is_broadcast() {
            return Err(Error::InvalidConfig(format!(
                "server_ip {} cannot be used as a server identifier",
                self.server_ip
            )));
        }

        if self.store.timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "store.timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.api.timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "api.timeout_ms must be greater than 0".to_string(),
            ));
        }

        if let Some(ref url) = self.api.url
            && !(url.starts_with("http://") || url.starts_with("https://"))
        {
            return Err(Error::InvalidConfig(format!(
                "api.url {} must be an http:// or https:// URL",
                url
            )));
        }

        if self.failover.probe_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "failover.probe_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.failover.role == Role::Standby && self.failover.peer.is_none() {
            return Err(Error::InvalidConfig(
                "failover.peer is required in standby role".to_string(),
            ));
        }

        Ok(())
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store.timeout_ms)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_millis(self.api.timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.failover.probe_timeout_ms)
    }
}
