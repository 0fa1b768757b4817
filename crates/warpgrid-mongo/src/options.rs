//! Server options: the configuration map recognized by the driver core.
//!
//! Every field is optional; accessors resolve defaults. Options can be built
//! in code or loaded from a TOML table:
//!
//! ```toml
//! refresh_interval = 10
//! ssl_ca_cert = "/etc/warpgrid/ca.pem"
//! max_pool_size = 8
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Seconds between automatic health checks when unset.
pub const DEFAULT_REFRESH_INTERVAL: u64 = 5;
/// Upper bound on `refresh_interval`: 30 days.
pub const MAX_REFRESH_INTERVAL: u64 = 30 * 24 * 60 * 60;
/// Seconds allowed for TCP connect plus TLS handshake.
pub const DEFAULT_CONNECT_TIMEOUT: f64 = 10.0;
/// Seconds allowed for a single read or write on a connection.
pub const DEFAULT_SOCKET_TIMEOUT: f64 = 30.0;
pub const DEFAULT_MAX_POOL_SIZE: usize = 5;
/// Seconds a checkout waits on an exhausted pool.
pub const DEFAULT_WAIT_QUEUE_TIMEOUT: f64 = 1.0;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerOptions {
    pub refresh_interval: Option<u64>,
    pub ssl: Option<bool>,
    pub ssl_cert: Option<PathBuf>,
    pub ssl_key: Option<PathBuf>,
    pub ssl_verify: Option<bool>,
    pub ssl_ca_cert: Option<PathBuf>,
    pub connect_timeout: Option<f64>,
    pub socket_timeout: Option<f64>,
    pub max_pool_size: Option<usize>,
    pub wait_queue_timeout: Option<f64>,
    pub max_idle_time: Option<f64>,
}

impl ServerOptions {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let options: ServerOptions =
            toml::from_str(s).map_err(|e| Error::Config(format!("invalid server options: {e}")))?;
        options.validate()?;
        Ok(options)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::io(format!("read options file {}", path.display()), e))?;
        Self::from_toml_str(&content)
    }

    /// Reject values that cannot be turned into timeouts or pool bounds.
    pub fn validate(&self) -> Result<()> {
        match self.refresh_interval {
            Some(0) => {
                return Err(Error::Config("refresh_interval must be at least 1 second".to_string()));
            }
            Some(v) if v > MAX_REFRESH_INTERVAL => {
                return Err(Error::Config(format!(
                    "refresh_interval must be at most {MAX_REFRESH_INTERVAL} seconds, got {v}"
                )));
            }
            _ => {}
        }
        if self.max_pool_size == Some(0) {
            return Err(Error::Config("max_pool_size must be at least 1".to_string()));
        }
        for (name, value) in [
            ("connect_timeout", self.connect_timeout),
            ("socket_timeout", self.socket_timeout),
            ("wait_queue_timeout", self.wait_queue_timeout),
            ("max_idle_time", self.max_idle_time),
        ] {
            if let Some(v) = value
                && Duration::try_from_secs_f64(v).is_err()
            {
                return Err(Error::Config(format!("{name} must be a non-negative number of seconds, got {v}")));
            }
        }
        Ok(())
    }

    /// Seconds between health checks.
    pub fn refresh_interval(&self) -> u64 {
        self.refresh_interval.unwrap_or(DEFAULT_REFRESH_INTERVAL)
    }

    /// TLS is on when asked for explicitly or when any TLS material is named.
    pub fn ssl_enabled(&self) -> bool {
        self.ssl.unwrap_or(
            self.ssl_cert.is_some() || self.ssl_ca_cert.is_some() || self.ssl_verify == Some(true),
        )
    }

    pub fn connect_timeout(&self) -> Duration {
        seconds(self.connect_timeout, DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn socket_timeout(&self) -> Duration {
        seconds(self.socket_timeout, DEFAULT_SOCKET_TIMEOUT)
    }

    pub fn max_pool_size(&self) -> usize {
        self.max_pool_size.unwrap_or(DEFAULT_MAX_POOL_SIZE)
    }

    pub fn wait_queue_timeout(&self) -> Duration {
        seconds(self.wait_queue_timeout, DEFAULT_WAIT_QUEUE_TIMEOUT)
    }

    pub fn max_idle_time(&self) -> Option<Duration> {
        self.max_idle_time
            .and_then(|v| Duration::try_from_secs_f64(v).ok())
    }
}

fn seconds(value: Option<f64>, default: f64) -> Duration {
    value
        .and_then(|v| Duration::try_from_secs_f64(v).ok())
        .unwrap_or_else(|| Duration::from_secs_f64(default))
}
