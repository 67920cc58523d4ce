use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;
use tracing::warn;

use crate::error::{EtudeError, EtudeResult};
use crate::pool::{DEFAULT_MAX_REQUESTS, DEFAULT_WORKERS};

pub const DEFAULT_MAX_CONNECTIONS: usize = 65_536;

/// Server configuration.
///
/// Layered from lowest to highest precedence: built-in defaults, an optional
/// TOML file, `ETUDE_*` environment variables (with `.env` support), then
/// whatever the CLI overrides.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Listen address (default: 0.0.0.0)
    pub host: String,

    /// Listen port (default: 8080)
    pub port: u16,

    /// Directory files are served from (default: /var/www/html)
    pub doc_root: PathBuf,

    /// Worker threads (default: 8)
    pub workers: usize,

    /// Queue bound; tasks beyond it are rejected (default: 10000)
    pub max_requests: usize,

    /// Connection table capacity (default: 65536)
    pub max_connections: usize,

    /// Default tracing filter when RUST_LOG is unset (default: info)
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            doc_root: PathBuf::from("/var/www/html"),
            workers: DEFAULT_WORKERS,
            max_requests: DEFAULT_MAX_REQUESTS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            log_level: "info".to_string(),
        }
    }
}

fn parse_or_keep<T: FromStr + Copy>(key: &str, raw: Option<String>, current: T) -> T {
    match raw {
        Some(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(key, value = %raw, "ignoring unparsable environment value");
                current
            }
        },
        None => current,
    }
}

impl Config {
    /// Loads a TOML file; missing keys keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> EtudeResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
            .map_err(|e| EtudeError::config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml(text: &str) -> EtudeResult<Self> {
        toml::from_str(text).map_err(|e| EtudeError::config(e.to_string()))
    }

    /// Overlays `ETUDE_*` variables from the process environment, loading a
    /// `.env` file first if one is present.
    pub fn apply_env(&mut self) {
        let _ = dotenvy::dotenv();
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Same as [`Config::apply_env`] with an explicit variable lookup.
    pub fn apply_env_from(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(host) = var("ETUDE_HOST") {
            self.host = host;
        }
        self.port = parse_or_keep("ETUDE_PORT", var("ETUDE_PORT"), self.port);
        if let Some(root) = var("ETUDE_DOC_ROOT") {
            self.doc_root = PathBuf::from(root);
        }
        self.workers = parse_or_keep("ETUDE_WORKERS", var("ETUDE_WORKERS"), self.workers);
        self.max_requests = parse_or_keep(
            "ETUDE_MAX_REQUESTS",
            var("ETUDE_MAX_REQUESTS"),
            self.max_requests,
        );
        self.max_connections = parse_or_keep(
            "ETUDE_MAX_CONNECTIONS",
            var("ETUDE_MAX_CONNECTIONS"),
            self.max_connections,
        );
        if let Some(level) = var("ETUDE_LOG_LEVEL") {
            self.log_level = level;
        }
    }

    /// Rejects configurations the server cannot start with.
    pub fn validate(&self) -> EtudeResult<()> {
        if self.workers == 0 {
            return Err(EtudeError::config("workers must be positive"));
        }
        if self.max_requests == 0 {
            return Err(EtudeError::config("max_requests must be positive"));
        }
        if self.max_connections == 0 {
            return Err(EtudeError::config("max_connections must be positive"));
        }
        if !self.doc_root.is_dir() {
            return Err(EtudeError::config(format!(
                "document root {} is not a directory",
                self.doc_root.display()
            )));
        }
        self.socket_addr()?;
        Ok(())
    }

    pub fn socket_addr(&self) -> EtudeResult<SocketAddr> {
        let ip: IpAddr = self.host.parse()?;
        Ok(SocketAddr::new(ip, self.port))
    }
}
