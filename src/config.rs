//! Configuration for the bridge.
//!
//! Values are layered with figment: built-in defaults, then the TOML file,
//! then `HOSTBRIDGE_*` environment variables, then command line overrides.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "hostbridge.toml";
pub const ENV_PREFIX: &str = "HOSTBRIDGE_";
pub const DEFAULT_PORT: u16 = 13337;
pub const DEFAULT_PORT_ATTEMPTS: u16 = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Loopback IP to bind / connect to. Hostnames are not accepted.
    pub host: IpAddr,
    /// Primary port. `0` asks the OS for an ephemeral port.
    pub port: u16,
    /// How many consecutive ports to try, starting at `port`.
    pub port_attempts: u16,
    pub request_timeout_secs: u64,
    pub max_body_bytes: usize,
    pub shutdown_grace_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PORT,
            port_attempts: DEFAULT_PORT_ATTEMPTS,
            request_timeout_secs: 30,
            max_body_bytes: 16 * 1024 * 1024,
            shutdown_grace_ms: 2000,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("host {0} is not a loopback address")]
    NotLoopback(IpAddr),
    #[error("{field} must be at least 1")]
    Zero { field: &'static str },
}

impl AppConfig {
    /// Load from `hostbridge.toml` in the working directory, the environment
    /// and optional CLI overrides.
    pub fn new<T: Serialize>(overrides: Option<&T>) -> Result<Self, ConfigError> {
        Self::load(Path::new(DEFAULT_CONFIG_FILE), overrides)
    }

    /// Like [`new`](Self::new) but reading the given TOML file. A missing
    /// file is not an error.
    pub fn load<T: Serialize>(path: &Path, overrides: Option<&T>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        let config: AppConfig = figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.host.is_loopback() {
            return Err(ConfigError::NotLoopback(self.host));
        }
        if self.port_attempts == 0 {
            return Err(ConfigError::Zero {
                field: "port_attempts",
            });
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Zero {
                field: "request_timeout_secs",
            });
        }
        if self.max_body_bytes == 0 {
            return Err(ConfigError::Zero {
                field: "max_body_bytes",
            });
        }
        Ok(())
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host,
            port: self.port,
            port_attempts: self.port_attempts,
            max_body_bytes: self.max_body_bytes,
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            host: self.host,
            port: self.port,
            port_attempts: self.port_attempts,
            timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

/// Ports tried in order: `port`, `port + 1`, ... `attempts` in total.
/// Port 0 (ephemeral) yields a single candidate.
pub fn candidate_ports(port: u16, attempts: u16) -> Vec<u16> {
    if port == 0 {
        return vec![0];
    }
    (0..attempts.max(1))
        .map_while(|offset| port.checked_add(offset))
        .collect()
}

/// Settings for [`RpcServer`](crate::rpc::RpcServer).
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
    pub port_attempts: u16,
    pub max_body_bytes: usize,
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        AppConfig::default().server_config()
    }
}

impl ServerConfig {
    pub fn candidate_addrs(&self) -> Vec<SocketAddr> {
        candidate_ports(self.port, self.port_attempts)
            .into_iter()
            .map(|port| SocketAddr::new(self.host, port))
            .collect()
    }
}

/// Settings for [`RpcClient`](crate::rpc::RpcClient).
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub host: IpAddr,
    pub port: u16,
    pub port_attempts: u16,
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        AppConfig::default().client_config()
    }
}

impl ClientConfig {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn candidate_addrs(&self) -> Vec<SocketAddr> {
        candidate_ports(self.port, self.port_attempts)
            .into_iter()
            .map(|port| SocketAddr::new(self.host, port))
            .collect()
    }
}
