//! Engine configuration and the storage list file

use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default aggregation backlog above which new writes are refused (5 MiB).
pub const DEFAULT_AGG_WRITE_BACKLOG: u64 = 5 * 1024 * 1024;

/// Tunables for the write path.
///
/// ```toml
/// agg_write_backlog = 5242880
/// max_writers = 1
/// dispatch_delay_ticks = 1
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Pending aggregation bytes tolerated before new writes are refused
    pub agg_write_backlog: u64,
    /// Writers allowed per open entry
    pub max_writers: u16,
    /// Scheduling passes between a request being parked and its retry
    pub dispatch_delay_ticks: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            agg_write_backlog: DEFAULT_AGG_WRITE_BACKLOG,
            max_writers: 1,
            dispatch_delay_ticks: 1,
        }
    }
}

impl CacheConfig {
    /// Parse from TOML. Missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: CacheConfig =
            toml::from_str(text).map_err(|e| CacheError::Config(format!("invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_writers == 0 {
            return Err(CacheError::Config("max_writers must be at least 1".to_string()));
        }
        if self.dispatch_delay_ticks == 0 {
            return Err(CacheError::Config(
                "dispatch_delay_ticks must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// One line of a storage list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageEntry {
    pub path: PathBuf,
    /// Size token as written (e.g. `512M`), if any
    pub size: Option<String>,
    /// `volume=N` assignment, if any
    pub volume: Option<i32>,
    /// `id=...` override, if any
    pub id: Option<String>,
}

/// The list of spans making up the cache.
///
/// One span per line: a path, optionally followed by a size and
/// `key=value` tokens. `#` starts a comment.
///
/// ```text
/// /dev/sdb volume=1
/// /var/cache/span0 512M   # file-backed span
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StorageConfig {
    pub entries: Vec<StorageEntry>,
}

impl StorageConfig {
    pub fn parse(text: &str) -> Result<Self> {
        let mut entries = Vec::new();

        for (lineno, raw) in text.lines().enumerate() {
            let line = match raw.find('#') {
                Some(pos) => &raw[..pos],
                None => raw,
            };
            let mut tokens = line.split_whitespace();
            let Some(path) = tokens.next() else {
                continue;
            };

            let mut entry = StorageEntry {
                path: PathBuf::from(path),
                size: None,
                volume: None,
                id: None,
            };
            for token in tokens {
                match token.split_once('=') {
                    Some(("volume", value)) => {
                        let volume = value.parse::<i32>().map_err(|_| {
                            CacheError::Config(format!(
                                "line {}: invalid volume number '{}'",
                                lineno + 1,
                                value
                            ))
                        })?;
                        entry.volume = Some(volume);
                    }
                    Some(("id", value)) => entry.id = Some(value.to_string()),
                    // Unknown keys belong to other subsystems.
                    Some(_) => {}
                    None => entry.size = Some(token.to_string()),
                }
            }
            entries.push(entry);
        }

        Ok(StorageConfig { entries })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        Self::parse(&text)
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.entries.iter().map(|e| e.path.as_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.agg_write_backlog, 5_242_880);
        assert_eq!(config.max_writers, 1);
        assert_eq!(config.dispatch_delay_ticks, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config = CacheConfig::from_toml_str("agg_write_backlog = 1024\n").unwrap();
        assert_eq!(config.agg_write_backlog, 1024);
        assert_eq!(config.max_writers, 1);
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            CacheConfig::from_toml_str("max_writers = 0"),
            Err(CacheError::Config(_))
        ));
        assert!(matches!(
            CacheConfig::from_toml_str("agg_write_backlog = \"lots\""),
            Err(CacheError::Config(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "dispatch_delay_ticks = 3").unwrap();
        let config = CacheConfig::load(file.path()).unwrap();
        assert_eq!(config.dispatch_delay_ticks, 3);
    }

    #[test]
    fn test_storage_list() {
        let text = "\
# cache disks
/dev/sdb volume=1
/var/cache/span0 512M id=spare   # file span

/dev/sdc
";
        let storage = StorageConfig::parse(text).unwrap();
        assert_eq!(storage.entries.len(), 3);
        assert_eq!(storage.entries[0].volume, Some(1));
        assert_eq!(storage.entries[1].size.as_deref(), Some("512M"));
        assert_eq!(storage.entries[1].id.as_deref(), Some("spare"));
        assert_eq!(storage.entries[2].path, PathBuf::from("/dev/sdc"));
        assert_eq!(storage.paths().count(), 3);
    }

    #[test]
    fn test_storage_bad_volume() {
        let err = StorageConfig::parse("/dev/sdb volume=x").unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }
}
