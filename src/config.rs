//! Server configuration from command-line flags.

use crate::replication::DEFAULT_QUEUE_CAPACITY;
use crate::{DEFAULT_HOST, DEFAULT_PORT};
use clap::Parser;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("expected \"<host> <port>\", got {0:?}")]
    InvalidReplicaOf(String),

    #[error("invalid master port {0:?}")]
    InvalidPort(String),
}

/// Address of the master this node replicates from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterAddr {
    pub host: String,
    pub port: u16,
}

impl FromStr for MasterAddr {
    type Err = ConfigError;

    /// Parses `"<host> <port>"`, the form used by `--replicaof`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.split_whitespace();
        match (fields.next(), fields.next(), fields.next()) {
            (Some(host), Some(port), None) => {
                let port = port
                    .parse()
                    .map_err(|_| ConfigError::InvalidPort(port.to_string()))?;
                Ok(Self {
                    host: host.to_string(),
                    port,
                })
            }
            _ => Err(ConfigError::InvalidReplicaOf(s.to_string())),
        }
    }
}

impl fmt::Display for MasterAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// relaykv server options.
#[derive(Parser, Debug, Clone)]
#[command(name = "relaykv", version, about = "Replicated in-memory key-value server")]
pub struct Config {
    /// Host to bind to
    #[arg(long, default_value = DEFAULT_HOST)]
    pub bind: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Run as a replica of the master at "<host> <port>"
    #[arg(long, value_name = "HOST PORT")]
    pub replicaof: Option<MasterAddr>,

    /// Seconds between active expiry sweeps
    #[arg(long, default_value_t = 60, value_parser = clap::value_parser!(u64).range(1..))]
    pub expiry_interval_secs: u64,

    /// Close client connections idle for this many seconds (0 disables)
    #[arg(long, default_value_t = 0)]
    pub timeout: u64,

    /// Writes a replica may fall behind by before it is disconnected
    #[arg(long, default_value_t = DEFAULT_QUEUE_CAPACITY)]
    pub replica_queue_capacity: usize,
}

impl Config {
    /// Returns the bind address as a string
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn expiry_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_interval_secs)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.timeout > 0).then(|| Duration::from_secs(self.timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::try_parse_from(["relaykv"]).unwrap();
        assert_eq!(config.bind_address(), "127.0.0.1:6379");
        assert_eq!(config.replicaof, None);
        assert_eq!(config.expiry_interval(), Duration::from_secs(60));
        assert_eq!(config.idle_timeout(), None);
        assert_eq!(config.replica_queue_capacity, DEFAULT_QUEUE_CAPACITY);
    }

    #[test]
    fn test_replica_flags() {
        let config = Config::try_parse_from([
            "relaykv",
            "--port",
            "6380",
            "--replicaof",
            "localhost 6379",
            "--timeout",
            "30",
        ])
        .unwrap();
        assert_eq!(config.port, 6380);
        assert_eq!(
            config.replicaof,
            Some(MasterAddr {
                host: "localhost".to_string(),
                port: 6379,
            })
        );
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_replicaof_parsing() {
        assert_eq!(
            "10.0.0.1   6379".parse::<MasterAddr>().unwrap().to_string(),
            "10.0.0.1:6379"
        );
        assert_eq!(
            "localhost".parse::<MasterAddr>(),
            Err(ConfigError::InvalidReplicaOf("localhost".to_string()))
        );
        assert_eq!(
            "localhost 6379 extra".parse::<MasterAddr>(),
            Err(ConfigError::InvalidReplicaOf("localhost 6379 extra".to_string()))
        );
        assert_eq!(
            "localhost port".parse::<MasterAddr>(),
            Err(ConfigError::InvalidPort("port".to_string()))
        );
    }

    #[test]
    fn test_rejects_bad_replicaof_flag() {
        assert!(Config::try_parse_from(["relaykv", "--replicaof", "localhost"]).is_err());
        assert!(Config::try_parse_from(["relaykv", "--expiry-interval-secs", "0"]).is_err());
    }
}
