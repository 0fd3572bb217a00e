//! Configuration for leasehold components

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix for config overrides (`LEASEHOLD__ELECTION__LEASE_TIME_MS=...`)
pub const ENV_PREFIX: &str = "LEASEHOLD";

/// Global configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Identity written into the election table when this process leads.
    /// Must be stable across restarts for a live lease to be resumed.
    pub host: String,

    /// Logging level
    pub log_level: String,

    pub election: ElectionConfig,

    pub store: StoreConfig,

    pub admin: AdminConfig,
}

/// Election timing and the keys this process contends for
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionConfig {
    /// Period of one state machine tick
    pub tick_interval_ms: u64,

    /// Lease length; a row older than this has no leader
    pub lease_time_ms: u64,

    /// Cooldown after a voluntary release, in multiples of the lease
    pub release_cooldown_factor: u32,

    /// Keys started automatically by the node binary
    pub keys: Vec<String>,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 2_000,
            lease_time_ms: 10_000,
            release_cooldown_factor: 3,
            keys: Vec::new(),
        }
    }
}

impl ElectionConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn lease_time(&self) -> Duration {
        Duration::from_millis(self.lease_time_ms)
    }

    /// Lease length expressed in ticks
    pub fn lease_ticks(&self) -> u32 {
        u32::try_from(self.lease_time_ms / self.tick_interval_ms.max(1)).unwrap_or(u32::MAX)
    }

    /// Ticks to sit out after a voluntary release
    pub fn release_tick_limit(&self) -> u32 {
        self.lease_ticks()
            .saturating_mul(self.release_cooldown_factor)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tick_interval_ms == 0 {
            return Err(Error::InvalidConfig("tick_interval_ms must be > 0".into()));
        }
        if self.lease_time_ms < self.tick_interval_ms {
            return Err(Error::InvalidConfig(format!(
                "lease_time_ms ({}) shorter than tick_interval_ms ({})",
                self.lease_time_ms, self.tick_interval_ms
            )));
        }
        if self.lease_time_ms % self.tick_interval_ms != 0 {
            return Err(Error::InvalidConfig(format!(
                "lease_time_ms ({}) must be a multiple of tick_interval_ms ({})",
                self.lease_time_ms, self.tick_interval_ms
            )));
        }
        // The cooldown must outlast the lease being released
        if self.release_cooldown_factor == 0 {
            return Err(Error::InvalidConfig(
                "release_cooldown_factor must be > 0".into(),
            ));
        }
        let lease_ticks = u32::try_from(self.lease_time_ms / self.tick_interval_ms)
            .map_err(|_| Error::InvalidConfig("lease_time_ms too large for tick_interval_ms".into()))?;
        if lease_ticks
            .checked_mul(self.release_cooldown_factor)
            .is_none()
        {
            return Err(Error::InvalidConfig(format!(
                "release cooldown of {} x {} ticks overflows",
                lease_ticks, self.release_cooldown_factor
            )));
        }
        Ok(())
    }
}

/// Election store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database shared by every elector
    pub path: PathBuf,

    /// Connection pool size
    pub pool_size: u32,

    /// Attempts for a transient store failure before giving up
    pub max_retries: u32,

    /// Retry delay grows linearly: base * attempt
    pub retry_base_delay_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./leasehold.db"),
            pool_size: 8,
            max_retries: 20,
            retry_base_delay_ms: 100,
        }
    }
}

/// Admin HTTP API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub enabled: bool,
    pub bind_addr: SocketAddr,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8090)),
        }
    }
}

impl Config {
    /// Load configuration: defaults, then the optional TOML file, then
    /// `LEASEHOLD__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("election.keys")
                    .try_parsing(true),
            )
            .build()?;

        let mut conf: Config = settings.try_deserialize()?;
        if conf.log_level.is_empty() {
            conf.log_level = "info".to_string();
        }
        conf.election.validate()?;
        Ok(conf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_election_defaults() {
        let conf = ElectionConfig::default();
        assert_eq!(conf.tick_interval(), Duration::from_secs(2));
        assert_eq!(conf.lease_time(), Duration::from_secs(10));
        assert_eq!(conf.lease_ticks(), 5);
        assert_eq!(conf.release_tick_limit(), 15);
        assert!(conf.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_timing() {
        let zero = ElectionConfig {
            tick_interval_ms: 0,
            ..Default::default()
        };
        assert!(zero.validate().is_err());

        let short = ElectionConfig {
            tick_interval_ms: 2_000,
            lease_time_ms: 1_000,
            ..Default::default()
        };
        assert!(short.validate().is_err());

        let uneven = ElectionConfig {
            tick_interval_ms: 2_000,
            lease_time_ms: 5_000,
            ..Default::default()
        };
        assert!(uneven.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_missing_cooldown() {
        let no_cooldown = ElectionConfig {
            release_cooldown_factor: 0,
            ..Default::default()
        };
        assert!(matches!(
            no_cooldown.validate(),
            Err(Error::InvalidConfig(_))
        ));

        let minimal = ElectionConfig {
            release_cooldown_factor: 1,
            ..Default::default()
        };
        assert!(minimal.validate().is_ok());
        assert_eq!(minimal.release_tick_limit(), minimal.lease_ticks());
    }

    #[test]
    fn test_validate_rejects_overflowing_timing() {
        let huge_lease = ElectionConfig {
            tick_interval_ms: 1,
            lease_time_ms: u64::from(u32::MAX) + 1,
            ..Default::default()
        };
        assert!(huge_lease.validate().is_err());
        assert_eq!(huge_lease.lease_ticks(), u32::MAX);

        let huge_cooldown = ElectionConfig {
            release_cooldown_factor: u32::MAX,
            ..Default::default()
        };
        assert!(huge_cooldown.validate().is_err());
        assert_eq!(huge_cooldown.release_tick_limit(), u32::MAX);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leasehold.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
host = "node-a"

[election]
tick_interval_ms = 1000
lease_time_ms = 4000
keys = ["job-x", "cache-refresh"]

[store]
path = "/tmp/elect.db"
"#
        )
        .unwrap();

        let conf = Config::load(Some(&path)).unwrap();
        assert_eq!(conf.host, "node-a");
        assert_eq!(conf.log_level, "info");
        assert_eq!(conf.election.lease_ticks(), 4);
        assert_eq!(conf.election.keys, vec!["job-x", "cache-refresh"]);
        assert_eq!(conf.store.path, PathBuf::from("/tmp/elect.db"));
        assert_eq!(conf.store.max_retries, 20);
        assert!(conf.admin.enabled);
    }
}
