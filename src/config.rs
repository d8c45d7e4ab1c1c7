use crate::error::MimirError;
use serde::Deserialize;
use std::path::Path;
use tracing::level_filters::LevelFilter;

/// Top-level settings loaded from the TOML config file.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub resolv: ResolvSettings,
    pub redis: RedisSettings,
    pub memcache: MemcacheSettings,
    pub log: LogSettings,
    pub cache: CacheSettings,
    pub hosts: HostsSettings,
}

impl Settings {
    /// Load and parse the config file. Any failure here is fatal at startup.
    pub fn load(path: &Path) -> Result<Self, MimirError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| MimirError::Config(format!("{}: {}", path.display(), e)))?;
        toml::from_str(&raw).map_err(|e| MimirError::Config(format!("{}: {}", path.display(), e)))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl ServerSettings {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 53,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResolvSettings {
    #[serde(rename = "resolv-file")]
    pub resolv_file: String,

    /// One or more dnsmasq-style server list files, joined with `;`.
    #[serde(rename = "server-list-file")]
    pub server_list_file: String,

    /// Per-exchange read/write timeout, seconds.
    pub timeout: u64,

    /// Stagger between concurrent upstream exchanges, milliseconds.
    pub interval: u64,

    #[serde(rename = "SetEDNS0")]
    pub set_edns0: bool,
}

impl Default for ResolvSettings {
    fn default() -> Self {
        Self {
            resolv_file: "/etc/resolv.conf".to_string(),
            server_list_file: String::new(),
            timeout: 5,
            interval: 200,
            set_edns0: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    pub host: String,
    pub port: u16,
    pub db: i64,
    pub password: String,
}

impl RedisSettings {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}:{}/{}", self.host, self.port, self.db)
        } else {
            format!(
                "redis://:{}@{}:{}/{}",
                self.password, self.host, self.port, self.db
            )
        }
    }
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            db: 0,
            password: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct MemcacheSettings {
    pub servers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub stdout: bool,
    pub file: String,
    pub level: String,
}

impl LogSettings {
    /// Map the config level onto a tracing filter. NOTICE folds into INFO
    /// since tracing has no such level.
    pub fn level_filter(&self) -> Result<LevelFilter, MimirError> {
        match self.level.as_str() {
            "DEBUG" => Ok(LevelFilter::DEBUG),
            "INFO" | "NOTICE" => Ok(LevelFilter::INFO),
            "WARN" => Ok(LevelFilter::WARN),
            "ERROR" => Ok(LevelFilter::ERROR),
            other => Err(MimirError::Config(format!("invalid log level: {other}"))),
        }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            stdout: true,
            file: String::new(),
            level: "INFO".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// One of `memory`, `memcache`, `redis`.
    pub backend: String,

    /// Positive cache TTL, seconds. The negative cache uses half of it.
    pub expire: u64,

    /// Entry cap for the memory backend; 0 disables the check.
    pub maxcount: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            expire: 600,
            maxcount: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HostsSettings {
    pub enable: bool,

    #[serde(rename = "host-file")]
    pub host_file: String,

    #[serde(rename = "redis-enable")]
    pub redis_enable: bool,

    #[serde(rename = "redis-key")]
    pub redis_key: String,

    pub ttl: u32,

    /// Seconds between snapshot reloads.
    #[serde(rename = "refresh-interval")]
    pub refresh_interval: u64,
}

impl Default for HostsSettings {
    fn default() -> Self {
        Self {
            enable: false,
            host_file: "/etc/hosts".to_string(),
            redis_enable: false,
            redis_key: "mimir:hosts".to_string(),
            ttl: 600,
            refresh_interval: 5,
        }
    }
}
