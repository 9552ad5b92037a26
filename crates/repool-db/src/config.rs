//! Pool-manager configuration loading.
//!
//! The manager reads a TOML file naming the drivers to use, the log
//! sink, and one `[pools.<name>]` table per pool. Numeric options
//! accept either integers or strings; a string that fails to parse is
//! logged and treated as zero so one operator typo does not take the
//! whole manager down.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use repool::PoolParameters;

use crate::error::{DbError, Result};

/// A count option that tolerates being written as a string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum FlexibleCount {
    /// Written as a TOML integer.
    Number(i64),
    /// Written as a TOML string; parsed on use.
    Text(String),
}

impl FlexibleCount {
    /// Resolve to a non-negative count. Negative numbers and
    /// unparseable strings log a warning and resolve to zero.
    pub fn resolve(&self, option: &str, pool: &str) -> u64 {
        match self {
            Self::Number(n) if *n >= 0 => *n as u64,
            Self::Number(n) => {
                tracing::warn!(pool, option, value = n, "negative value, using 0");
                0
            }
            Self::Text(text) => match text.trim().parse::<u64>() {
                Ok(n) => n,
                Err(_) => {
                    tracing::warn!(pool, option, value = %text, "invalid value, using 0");
                    0
                }
            },
        }
    }
}

fn default_cache() -> bool {
    true
}

/// Per-pool options, one `[pools.<name>]` table each.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolSettings {
    /// Database connection URL. Required.
    pub url: String,
    /// Login user.
    #[serde(default)]
    pub user: Option<String>,
    /// Login password (run through the decoder when one is set).
    #[serde(default)]
    pub password: Option<String>,
    /// Soft cap on pooled sessions (0 = unbounded).
    #[serde(default)]
    pub maxpool: Option<FlexibleCount>,
    /// Hard cap on simultaneous sessions (0 = unbounded; raised to
    /// `maxpool` when positive).
    #[serde(default)]
    pub maxconn: Option<FlexibleCount>,
    /// Sessions to create up front (clamped to `[0, maxpool]`).
    #[serde(default)]
    pub init: Option<FlexibleCount>,
    /// Idle expiry in seconds (0 = no expiry).
    #[serde(default)]
    pub expiry: Option<FlexibleCount>,
    /// Registered validator name.
    #[serde(default)]
    pub validator: Option<String>,
    /// Registered password-decoder name.
    #[serde(default)]
    pub decoder: Option<String>,
    /// Statement caching for all three families.
    #[serde(default = "default_cache")]
    pub cache: bool,
    /// Asynchronous destruction.
    #[serde(default, rename = "async")]
    pub async_destroy: bool,
    /// Verbose hit/miss logging.
    #[serde(default)]
    pub debug: bool,
    /// Per-pool log sink.
    #[serde(default)]
    pub logfile: Option<String>,
    /// Per-pool log timestamp format.
    #[serde(default)]
    pub dateformat: Option<String>,
    /// Pass-through driver properties; presence selects the
    /// properties-bag connect path.
    #[serde(default)]
    pub prop: BTreeMap<String, String>,
}

impl PoolSettings {
    /// Resolve the sizing options into pool parameters, logging and
    /// zeroing anything invalid. `expiry` is written in seconds.
    pub fn parameters(&self, pool: &str) -> PoolParameters {
        let pool_size = self
            .maxpool
            .as_ref()
            .map_or(0, |c| c.resolve("maxpool", pool)) as usize;
        let max_size = self
            .maxconn
            .as_ref()
            .map_or(0, |c| c.resolve("maxconn", pool)) as usize;
        let expiry_secs = self
            .expiry
            .as_ref()
            .map_or(0, |c| c.resolve("expiry", pool));
        PoolParameters {
            pool_size,
            max_size,
            expiry: Duration::from_secs(expiry_secs),
        }
    }

    /// Resolve the prepopulation count, clamped to `[0, maxpool]`.
    pub fn init_count(&self, pool: &str) -> usize {
        let init = self.init.as_ref().map_or(0, |c| c.resolve("init", pool)) as usize;
        init.min(self.parameters(pool).pool_size)
    }
}

/// Top-level manager configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ManagerConfig {
    /// Names of drivers that must be registered before pools connect.
    #[serde(default)]
    pub drivers: Vec<String>,
    /// Manager-wide log sink.
    #[serde(default)]
    pub logfile: Option<String>,
    /// Log timestamp format (chrono `strftime`).
    #[serde(default)]
    pub dateformat: Option<String>,
    /// Pool tables, kept raw so one bad pool is skipped without
    /// discarding its siblings.
    #[serde(default)]
    pub pools: BTreeMap<String, toml::Value>,
}

impl ManagerConfig {
    /// Parse a configuration from TOML text.
    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|error| DbError::config(error.to_string()))
    }

    /// Load a configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Decode each pool table, logging and skipping tables that do not
    /// deserialize. A bad pool is fatal to that pool only.
    pub fn pool_settings(&self) -> Vec<(String, PoolSettings)> {
        let mut settings = Vec::new();
        for (name, value) in &self.pools {
            match PoolSettings::deserialize(value.clone()) {
                Ok(pool) => settings.push((name.clone(), pool)),
                Err(error) => {
                    tracing::warn!(pool = %name, %error, "invalid pool definition, skipping");
                }
            }
        }
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let config = ManagerConfig::parse(
            r#"
            drivers = ["memory"]
            logfile = "pools.log"
            dateformat = "%Y-%m-%d %H:%M:%S"

            [pools.main]
            url = "memory:main"
            user = "scott"
            password = "gvtre"
            maxpool = 5
            maxconn = 10
            init = 2
            expiry = 60
            validator = "auto-commit"
            decoder = "rot13"
            cache = false
            async = true
            debug = true

            [pools.main.prop]
            ssl = "true"
            "#,
        )
        .unwrap();

        assert_eq!(config.drivers, ["memory".to_owned()]);
        let pools = config.pool_settings();
        assert_eq!(pools.len(), 1);
        let (name, settings) = &pools[0];
        assert_eq!(name, "main");
        let params = settings.parameters(name);
        assert_eq!(params.pool_size, 5);
        assert_eq!(params.max_size, 10);
        assert_eq!(params.expiry, Duration::from_secs(60));
        assert_eq!(settings.init_count(name), 2);
        assert!(!settings.cache);
        assert!(settings.async_destroy);
        assert!(settings.debug);
        assert_eq!(settings.prop.get("ssl").map(String::as_str), Some("true"));
    }

    #[test]
    fn numeric_options_accept_strings() {
        let config = ManagerConfig::parse(
            r#"
            [pools.p]
            url = "memory:p"
            maxpool = "4"
            expiry = "30"
            "#,
        )
        .unwrap();
        let (name, settings) = &config.pool_settings()[0];
        let params = settings.parameters(name);
        assert_eq!(params.pool_size, 4);
        assert_eq!(params.expiry, Duration::from_secs(30));
    }

    #[test]
    fn invalid_numeric_strings_default_to_zero() {
        let config = ManagerConfig::parse(
            r#"
            [pools.p]
            url = "memory:p"
            maxpool = "plenty"
            maxconn = "-3"
            "#,
        )
        .unwrap();
        let (name, settings) = &config.pool_settings()[0];
        let params = settings.parameters(name);
        assert_eq!(params.pool_size, 0);
        assert_eq!(params.max_size, 0);
    }

    #[test]
    fn init_is_clamped_to_pool_size() {
        let config = ManagerConfig::parse(
            r#"
            [pools.p]
            url = "memory:p"
            maxpool = 2
            init = 10
            "#,
        )
        .unwrap();
        let (name, settings) = &config.pool_settings()[0];
        assert_eq!(settings.init_count(name), 2);
    }

    #[test]
    fn bad_pool_is_skipped_but_siblings_survive() {
        let config = ManagerConfig::parse(
            r#"
            [pools.good]
            url = "memory:good"

            [pools.bad]
            user = "nobody"
            "#,
        )
        .unwrap();
        let pools = config.pool_settings();
        assert_eq!(pools.len(), 1);
        assert_eq!(pools[0].0, "good");
    }

    #[test]
    fn missing_pools_table_is_empty() {
        let config = ManagerConfig::parse("drivers = []").unwrap();
        assert!(config.pool_settings().is_empty());
    }
}
