use dotenvy::dotenv;
use std::env;
use thiserror::Error;

use crate::store::couchbase::CouchbaseConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing environment variables: {}", .0.join(","))]
    Missing(Vec<String>),

    #[error("{var} is invalid: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Which flag store the service runs against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreConfig {
    Memory,
    Couchbase(CouchbaseConfig),
}

impl StoreConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            StoreConfig::Memory => "memory",
            StoreConfig::Couchbase(_) => "couchbase",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub store: StoreConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenv().is_ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from any variable source. Every missing variable is
    /// reported, not just the first.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut missing = Vec::new();
        let mut require = |key: &str| match lookup(key).filter(|v| !v.trim().is_empty()) {
            Some(value) => value,
            None => {
                missing.push(key.to_string());
                String::new()
            }
        };

        let port = require("PORT");

        let store = match lookup("FLAG_STORE").as_deref().unwrap_or("memory") {
            "memory" => StoreConfig::Memory,
            "couchbase" => StoreConfig::Couchbase(CouchbaseConfig {
                query_url: require("COUCHBASE_QUERY_URL"),
                bucket: require("COUCHBASE_BUCKET"),
                username: require("COUCHBASE_USERNAME"),
                password: require("COUCHBASE_PASSWORD"),
            }),
            other => {
                return Err(ConfigError::Invalid {
                    var: "FLAG_STORE",
                    reason: format!("unknown store {:?}, expected memory or couchbase", other),
                })
            }
        };

        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        let port = port.parse().map_err(|e: std::num::ParseIntError| ConfigError::Invalid {
            var: "PORT",
            reason: e.to_string(),
        })?;

        Ok(Self { port, store })
    }

    pub fn addr(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }
}
