/// Server configuration, loaded from a YAML file.
///
/// Every field has a default, so an empty file (or none at all) yields a
/// runnable development configuration.
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// SQLite database path (`":memory:"` for a throwaway store).
    pub database: String,
    /// UNIX socket path the server listens on.
    pub socket: String,
    /// Worker pool size.
    pub nworkers: usize,
    /// Seconds of inactivity after which a session dies.
    pub session_idle_timeout: u64,
    /// Absolute session lifetime in seconds.
    pub session_life_timeout: u64,
    /// Log filter; overridden by RUST_LOG.
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: "kstor.sqlite".to_string(),
            socket: "kstor.socket".to_string(),
            nworkers: 5,
            session_idle_timeout: 900,
            session_life_timeout: 14_400,
            log_level: "warn".to_string(),
        }
    }
}

impl Config {
    /// Load from a YAML file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&raw)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.nworkers, 5);
        assert_eq!(config.session_idle_timeout, 900);
        assert_eq!(config.session_life_timeout, 14_400);
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "database: /var/lib/kstor/db.sqlite").unwrap();
        writeln!(file, "nworkers: 8").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.database, "/var/lib/kstor/db.sqlite");
        assert_eq!(config.nworkers, 8);
        assert_eq!(config.session_idle_timeout, 900);
    }

    #[test]
    fn test_missing_file_is_defaults() {
        let config = Config::load(Path::new("/nonexistent/kstor.yaml")).unwrap();
        assert_eq!(config.nworkers, 5);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "nwokers: 8").unwrap();
        assert!(Config::load(file.path()).is_err());
    }
}
