use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::auth_filter::AuthFilterConfig;
use crate::client_ip::ClientIpConfig;
use crate::snowflake::{MAX_DATACENTER_ID, MAX_WORKER_ID};
use crate::token::parse_algorithm;

/// Gateway node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub blacklist: BlacklistConfig,
    #[serde(default)]
    pub id_generator: IdGeneratorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Route/blacklist management API
    pub admin_addr: String,
    /// Client-facing listener
    pub gateway_addr: String,
    /// Reverse-proxy engine that receives non-HTTP (`lb://`) routes
    pub upstream: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            admin_addr: "127.0.0.1:9091".to_string(),
            gateway_addr: "0.0.0.0:8080".to_string(),
            upstream: "http://127.0.0.1:9000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database file, or ":memory:"
    pub database_path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: "aegis-gateway.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// NATS server; unset means single-node in-process broadcast
    pub nats_url: Option<String>,
    pub subject: String,
    pub reload_interval_secs: u64,
    /// Lock key electing the node that broadcasts the periodic reload
    pub reload_lock_key: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            nats_url: None,
            subject: "aegis.gateway.routes".to_string(),
            reload_interval_secs: 300,
            reload_lock_key: "aegis:gateway:route-reload".to_string(),
        }
    }
}

impl SyncConfig {
    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis/DragonflyDB URL; unset means the in-process lock backend
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// PEM public key for bearer tokens; unset treats every token as invalid
    pub public_key_path: Option<String>,
    pub algorithm: String,
    pub issuer: Option<String>,
    pub leeway_secs: u64,
    pub auth_header: String,
    pub token_cookie: String,
    pub identity_header: String,
    pub proxy_header: String,
    pub forwarded_for_header: String,
    pub gateway_marker: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        let filter = AuthFilterConfig::default();
        Self {
            public_key_path: None,
            algorithm: "RS256".to_string(),
            issuer: None,
            leeway_secs: 30,
            auth_header: filter.auth_header,
            token_cookie: filter.token_cookie,
            identity_header: filter.identity_header,
            proxy_header: filter.client_ip.proxy_header,
            forwarded_for_header: filter.client_ip.forwarded_for_header,
            gateway_marker: filter.gateway_marker,
        }
    }
}

impl AuthConfig {
    pub fn filter_config(&self) -> AuthFilterConfig {
        AuthFilterConfig {
            auth_header: self.auth_header.clone(),
            token_cookie: self.token_cookie.clone(),
            identity_header: self.identity_header.clone(),
            gateway_marker: self.gateway_marker.clone(),
            client_ip: ClientIpConfig {
                proxy_header: self.proxy_header.clone(),
                forwarded_for_header: self.forwarded_for_header.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlacklistConfig {
    /// Inline static entries, used when no static file is set
    pub static_ips: Vec<String>,
    /// Comma-separated static list, re-read every refresh window
    pub static_file: Option<String>,
    /// Read once at startup into the dynamic list
    pub bootstrap_file: String,
    pub refresh_secs: u64,
}

impl Default for BlacklistConfig {
    fn default() -> Self {
        Self {
            static_ips: Vec::new(),
            static_file: None,
            bootstrap_file: "blacklist.txt".to_string(),
            refresh_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdGeneratorConfig {
    pub worker_id: u64,
    pub datacenter_id: u64,
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(&self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.id_generator.worker_id > MAX_WORKER_ID {
            anyhow::bail!(
                "Invalid worker_id {}: must be <= {}",
                self.id_generator.worker_id,
                MAX_WORKER_ID
            );
        }

        if self.id_generator.datacenter_id > MAX_DATACENTER_ID {
            anyhow::bail!(
                "Invalid datacenter_id {}: must be <= {}",
                self.id_generator.datacenter_id,
                MAX_DATACENTER_ID
            );
        }

        if self.sync.reload_interval_secs == 0 {
            anyhow::bail!("Invalid sync reload_interval_secs: must be > 0");
        }

        if self.sync.subject.trim().is_empty() {
            anyhow::bail!("Invalid sync subject: cannot be empty");
        }

        if self.blacklist.refresh_secs == 0 {
            anyhow::bail!("Invalid blacklist refresh_secs: must be > 0");
        }

        parse_algorithm(&self.auth.algorithm)?;

        self.server.admin_addr.parse::<std::net::SocketAddr>().map_err(|e| {
            anyhow::anyhow!("Invalid admin_addr '{}': {}", self.server.admin_addr, e)
        })?;
        self.server.gateway_addr.parse::<std::net::SocketAddr>().map_err(|e| {
            anyhow::anyhow!("Invalid gateway_addr '{}': {}", self.server.gateway_addr, e)
        })?;

        Ok(())
    }
}
