//! Configuration management for the harvest jobs
//!
//! Database connection parameters come from the process environment. A `.env`
//! file in the working directory is loaded first when one exists. Job tunables
//! (concurrency, retry ceiling, source URLs) are command-line options handled
//! in `main.rs`; their defaults live here.

use std::fmt;
use std::path::PathBuf;

use anyhow::Context;
use thiserror::Error;

/// Default number of work items in flight
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Default retry ceiling for every network operation
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Environment variables that must all be set to reach PostgreSQL
pub const DB_VARS: [&str; 5] = ["DB_USER", "DB_PASSWORD", "DB_HOST", "DB_PORT", "DB_DATABASE"];

/// Errors raised while assembling the database configuration
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("database parameters are not set: {}", .0.join(", "))]
    Missing(Vec<&'static str>),

    #[error("DB_PORT is not a valid port number: {0:?}")]
    InvalidPort(String),
}

/// PostgreSQL connection parameters
#[derive(Clone, PartialEq, Eq)]
pub struct DbConfig {
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub database: String,
}

impl DbConfig {
    /// Read the connection parameters from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    ///
    /// Every variable in [`DB_VARS`] must resolve to a non-empty value. All
    /// missing names are reported at once.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut values = Vec::with_capacity(DB_VARS.len());
        let mut missing = Vec::new();

        for name in DB_VARS {
            match lookup(name) {
                Some(value) if !value.is_empty() => values.push(value),
                _ => {
                    missing.push(name);
                    values.push(String::new());
                }
            }
        }

        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        let [user, password, host, port, database]: [String; 5] = values
            .try_into()
            .map_err(|_| ConfigError::Missing(DB_VARS.to_vec()))?;

        let port = port
            .trim()
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort(port.clone()))?;

        Ok(Self {
            user,
            password,
            host,
            port,
            database,
        })
    }

    /// Connection settings for `tokio-postgres`
    pub fn pg_config(&self) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config
            .user(&self.user)
            .password(&self.password)
            .host(&self.host)
            .port(self.port)
            .dbname(&self.database)
            .application_name("vulnharvest");
        config
    }
}

impl fmt::Display for DbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "postgres://{}@{}:{}/{}",
            self.user, self.host, self.port, self.database
        )
    }
}

// Keeps the password out of log lines.
impl fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbConfig")
            .field("user", &self.user)
            .field("password", &"***")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .finish()
    }
}

/// Load `.env` from the working directory if there is one.
///
/// Returns the path that was loaded. A missing file is not an error; a file
/// that exists but cannot be parsed is.
pub fn load_dotenv() -> anyhow::Result<Option<PathBuf>> {
    match dotenvy::dotenv() {
        Ok(path) => Ok(Some(path)),
        Err(err) if err.not_found() => Ok(None),
        Err(err) => Err(err).context("failed to read .env file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use serial_test::serial;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    fn complete() -> Vec<(&'static str, &'static str)> {
        vec![
            ("DB_USER", "harvest"),
            ("DB_PASSWORD", "s3cret"),
            ("DB_HOST", "db.internal"),
            ("DB_PORT", "5433"),
            ("DB_DATABASE", "vulns"),
        ]
    }

    #[test]
    fn test_complete_config() {
        let config = DbConfig::from_lookup(lookup_from(&complete())).unwrap();
        assert_eq!(config.user, "harvest");
        assert_eq!(config.password, "s3cret");
        assert_eq!(config.host, "db.internal");
        assert_eq!(config.port, 5433);
        assert_eq!(config.database, "vulns");
    }

    #[test]
    fn test_missing_variables_are_all_reported() {
        let err = DbConfig::from_lookup(lookup_from(&[("DB_USER", "harvest")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Missing(vec!["DB_PASSWORD", "DB_HOST", "DB_PORT", "DB_DATABASE"])
        );
    }

    #[test]
    fn test_empty_value_counts_as_missing() {
        let mut pairs = complete();
        pairs[1] = ("DB_PASSWORD", "");
        let err = DbConfig::from_lookup(lookup_from(&pairs)).unwrap_err();
        assert_eq!(err, ConfigError::Missing(vec!["DB_PASSWORD"]));
    }

    #[test]
    fn test_invalid_port() {
        let mut pairs = complete();
        pairs[3] = ("DB_PORT", "postgres");
        let err = DbConfig::from_lookup(lookup_from(&pairs)).unwrap_err();
        assert_eq!(err, ConfigError::InvalidPort("postgres".to_string()));
    }

    #[test]
    fn test_display_and_debug_hide_password() {
        let config = DbConfig::from_lookup(lookup_from(&complete())).unwrap();
        assert_eq!(config.to_string(), "postgres://harvest@db.internal:5433/vulns");
        assert!(!format!("{config:?}").contains("s3cret"));
    }

    #[test]
    fn test_missing_error_message() {
        let err = ConfigError::Missing(vec!["DB_HOST", "DB_PORT"]);
        assert_eq!(
            err.to_string(),
            "database parameters are not set: DB_HOST, DB_PORT"
        );
    }

    #[test]
    #[serial]
    fn test_from_env() {
        // SAFETY: serial_test ensures this test runs exclusively, preventing race conditions
        unsafe {
            for (name, value) in complete() {
                std::env::set_var(name, value);
            }
        }
        let config = DbConfig::from_env();
        // SAFETY: serial_test ensures this test runs exclusively, preventing race conditions
        unsafe {
            for name in DB_VARS {
                std::env::remove_var(name);
            }
        }
        assert_eq!(config.unwrap().port, 5433);
    }

    #[test]
    #[serial]
    fn test_from_env_without_variables() {
        // SAFETY: serial_test ensures this test runs exclusively, preventing race conditions
        unsafe {
            for name in DB_VARS {
                std::env::remove_var(name);
            }
        }
        assert!(matches!(
            DbConfig::from_env(),
            Err(ConfigError::Missing(names)) if names.len() == DB_VARS.len()
        ));
    }
}
