//! Pool settings: `dbpool.toml` parsing.
//!
//! ```toml
//! [database]
//! host = "tfb-database"
//! user = "benchmarkdbuser"
//! password = "benchmarkdbpass"
//! database = "hello_world"
//!
//! [pool]
//! max_size = 32
//! acquire_timeout = "5s"
//! validate_on_acquire = true
//! ```
//!
//! Connection parameters may be overridden from the environment with
//! `DBPOOL_HOST`, `DBPOOL_PORT`, `DBPOOL_USER`, `DBPOOL_PASSWORD` and
//! `DBPOOL_DATABASE`.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const DEFAULT_PORT: u16 = 5432;

/// Where the pool connects and as whom. Fixed for the lifetime of a pool.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatabaseConfig {
    /// Hostname or IP literal; resolved once per pool.
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub database: String,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl DatabaseConfig {
    pub fn new(host: &str, user: &str, database: &str) -> Self {
        Self {
            host: host.to_string(),
            port: DEFAULT_PORT,
            user: user.to_string(),
            password: None,
            database: database.to_string(),
        }
    }

    /// Builder method: set the password.
    pub fn with_password(self, password: &str) -> Self {
        Self {
            password: Some(password.to_string()),
            ..self
        }
    }

    /// Builder method: set the port.
    pub fn with_port(self, port: u16) -> Self {
        Self { port, ..self }
    }
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("database", &self.database)
            .finish()
    }
}

/// Pool behaviour knobs.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum checked-out connections. `None` grows without bound.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_size: Option<usize>,
    /// How long `acquire()` waits for a slot when `max_size` is reached (default: 5s).
    #[serde(with = "duration_str")]
    pub acquire_timeout: Duration,
    /// Upper bound on establishing one new link (default: 5s).
    #[serde(with = "duration_str")]
    pub connect_timeout: Duration,
    /// Idle connections unused for longer are closed by `reap_idle()` (default: 300s).
    #[serde(with = "duration_str")]
    pub idle_timeout: Duration,
    /// How long `drain()` waits for checked-out connections (default: 30s).
    #[serde(with = "duration_str")]
    pub drain_timeout: Duration,
    /// Ping idle connections before handing them out (default: false).
    pub validate_on_acquire: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: None,
            acquire_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(300),
            drain_timeout: Duration::from_secs(30),
            validate_on_acquire: false,
        }
    }
}

/// Top-level settings file: `[database]` plus optional `[pool]`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolSettings {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub pool: PoolConfig,
}

impl PoolSettings {
    pub fn new(database: DatabaseConfig) -> Self {
        Self {
            database,
            pool: PoolConfig::default(),
        }
    }

    /// Builder method: replace the pool configuration.
    pub fn with_pool_config(self, pool: PoolConfig) -> Self {
        Self { pool, ..self }
    }

    /// Load, apply environment overrides, and validate.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let settings =
            Self::from_toml_str(&content)?.with_env_overrides(|key| std::env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `DBPOOL_*` overrides using `lookup` as the environment.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("DBPOOL_HOST") {
            self.database.host = host;
        }
        if let Some(port) = lookup("DBPOOL_PORT") {
            self.database.port = port
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("DBPOOL_PORT is not a port: {port}")))?;
        }
        if let Some(user) = lookup("DBPOOL_USER") {
            self.database.user = user;
        }
        if let Some(password) = lookup("DBPOOL_PASSWORD") {
            self.database.password = Some(password);
        }
        if let Some(database) = lookup("DBPOOL_DATABASE") {
            self.database.database = database;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.host.trim().is_empty() {
            return Err(ConfigError::Invalid("database.host must not be empty".to_string()));
        }
        if self.database.user.trim().is_empty() {
            return Err(ConfigError::Invalid("database.user must not be empty".to_string()));
        }
        if self.pool.max_size == Some(0) {
            return Err(ConfigError::Invalid("pool.max_size must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Parse a duration string like "5s", "500ms", "2m". A bare number is seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim().parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        if value.subsec_millis() != 0 {
            serializer.serialize_str(&format!("{}ms", value.as_millis()))
        } else {
            serializer.serialize_str(&format!("{}s", value.as_secs()))
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_duration(&raw)
            .ok_or_else(|| de::Error::custom(format!("invalid duration: {raw:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const MINIMAL: &str = r#"
[database]
host = "localhost"
user = "user"
database = "users"
"#;

    #[test]
    fn parse_minimal_uses_defaults() {
        let settings = PoolSettings::from_toml_str(MINIMAL).unwrap();
        assert_eq!(settings.database.host, "localhost");
        assert_eq!(settings.database.port, 5432);
        assert_eq!(settings.database.password, None);
        assert_eq!(settings.pool, PoolConfig::default());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn parse_full_pool_section() {
        let content = r#"
[database]
host = "db.warp.local"
port = 6432
user = "app"
password = "pass"
database = "users"

[pool]
max_size = 8
acquire_timeout = "250ms"
connect_timeout = "2s"
idle_timeout = "10m"
validate_on_acquire = true
"#;
        let settings = PoolSettings::from_toml_str(content).unwrap();
        assert_eq!(settings.database.port, 6432);
        assert_eq!(settings.database.password.as_deref(), Some("pass"));
        assert_eq!(settings.pool.max_size, Some(8));
        assert_eq!(settings.pool.acquire_timeout, Duration::from_millis(250));
        assert_eq!(settings.pool.connect_timeout, Duration::from_secs(2));
        assert_eq!(settings.pool.idle_timeout, Duration::from_secs(600));
        assert_eq!(settings.pool.drain_timeout, Duration::from_secs(30));
        assert!(settings.pool.validate_on_acquire);
    }

    #[test]
    fn parse_rejects_bad_duration() {
        let content = format!("{MINIMAL}\n[pool]\nacquire_timeout = \"soon\"\n");
        let err = PoolSettings::from_toml_str(&content).unwrap_err();
        assert!(err.to_string().contains("invalid duration"));
    }

    #[test]
    fn toml_round_trip_keeps_durations() {
        let settings = PoolSettings::new(DatabaseConfig::new("localhost", "user", "users"))
            .with_pool_config(PoolConfig {
                acquire_timeout: Duration::from_millis(1500),
                ..PoolConfig::default()
            });
        let rendered = toml::to_string_pretty(&settings).unwrap();
        assert!(rendered.contains("1500ms"));
        assert_eq!(PoolSettings::from_toml_str(&rendered).unwrap(), settings);
    }

    #[test]
    fn env_overrides_replace_database_fields() {
        let env = HashMap::from([
            ("DBPOOL_HOST", "10.0.0.5"),
            ("DBPOOL_PORT", "6543"),
            ("DBPOOL_PASSWORD", "secret"),
        ]);
        let settings = PoolSettings::from_toml_str(MINIMAL)
            .unwrap()
            .with_env_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(settings.database.host, "10.0.0.5");
        assert_eq!(settings.database.port, 6543);
        assert_eq!(settings.database.password.as_deref(), Some("secret"));
        assert_eq!(settings.database.user, "user");
    }

    #[test]
    fn env_override_rejects_bad_port() {
        let result = PoolSettings::from_toml_str(MINIMAL)
            .unwrap()
            .with_env_overrides(|key| (key == "DBPOOL_PORT").then(|| "abc".to_string()));
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn validate_rejects_zero_max_size() {
        let settings = PoolSettings::new(DatabaseConfig::new("localhost", "user", "users"))
            .with_pool_config(PoolConfig {
                max_size: Some(0),
                ..PoolConfig::default()
            });
        assert!(settings.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_host() {
        let settings = PoolSettings::new(DatabaseConfig::new(" ", "user", "users"));
        assert!(settings.validate().is_err());
    }

    #[test]
    fn debug_redacts_password() {
        let config = DatabaseConfig::new("localhost", "user", "users").with_password("hunter2");
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("10"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("fast"), None);
    }
}
