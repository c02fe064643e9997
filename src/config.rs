//! Configuration Loading
//!
//! Maps an INI-style config file onto the engine's [`CacheConfig`] and
//! the server settings. Everything here is optional; command-line flags
//! (see `main.rs`) fill in whatever the file does not set, falling back
//! to the engine defaults.
//!
//! ```ini
//! [server]
//! listen = :11211
//!
//! [storage]
//! data-dir = /var/lib/tqcache
//! shards = 16
//! default-ttl = 0s
//! max-ttl = 24h
//! sync-mode = periodic     # none, periodic, always
//! sync-interval = 1s
//! mailbox-capacity = 1000
//! ```
//!
//! Lines starting with `#` or `;` are comments; ` #` starts an inline
//! comment. Durations take a decimal number with an `ms`, `s`, `m`, `h`
//! or `d` suffix (`0` alone is accepted).

use crate::storage::{CacheConfig, SyncMode};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid {key}: {value:?}")]
    BadValue { key: &'static str, value: String },
}

/// Values read from a config file; `None` means "not set".
#[derive(Debug, Clone, Default)]
pub struct FileConfig {
    pub listen: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub shards: Option<usize>,
    pub default_ttl: Option<Duration>,
    pub max_ttl: Option<Duration>,
    pub sync_mode: Option<SyncMode>,
    pub sync_interval: Option<Duration>,
    pub mailbox_capacity: Option<usize>,
}

impl FileConfig {
    /// Reads and parses an INI config file.
    pub fn load(path: &Path) -> Result<FileConfig, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        FileConfig::parse(&data)
    }

    /// Parses INI text into a [`FileConfig`].
    pub fn parse(data: &str) -> Result<FileConfig, ConfigError> {
        let mut cfg = FileConfig::default();
        let mut section = String::new();

        for raw_line in data.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if line.starts_with('[') && line.ends_with(']') {
                section = line[1..line.len() - 1].to_ascii_lowercase();
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            let mut value = value.trim();
            // Strip inline comments.
            if let Some(idx) = value.find(" #") {
                value = value[..idx].trim();
            }

            match (section.as_str(), key.as_str()) {
                ("server", "listen") => cfg.listen = Some(value.to_string()),
                ("storage", "data-dir") => cfg.data_dir = Some(PathBuf::from(value)),
                ("storage", "shards") => {
                    cfg.shards = Some(parse_count(value, "shards")?);
                }
                ("storage", "default-ttl") => {
                    cfg.default_ttl = Some(parse_duration_key(value, "default-ttl")?);
                }
                ("storage", "max-ttl") => {
                    cfg.max_ttl = Some(parse_duration_key(value, "max-ttl")?);
                }
                ("storage", "sync-mode") => {
                    cfg.sync_mode = Some(parse_sync_mode(value)?);
                }
                ("storage", "sync-interval") => {
                    cfg.sync_interval = Some(parse_duration_key(value, "sync-interval")?);
                }
                ("storage", "mailbox-capacity") => {
                    cfg.mailbox_capacity = Some(parse_count(value, "mailbox-capacity")?);
                }
                _ => {} // unknown keys are ignored
            }
        }

        Ok(cfg)
    }

    /// Overlays the file's values onto an engine configuration.
    pub fn apply_to(&self, config: &mut CacheConfig) {
        if let Some(data_dir) = &self.data_dir {
            config.data_dir = data_dir.clone();
        }
        if let Some(shards) = self.shards {
            config.shards = shards;
        }
        if let Some(default_ttl) = self.default_ttl {
            config.default_ttl = default_ttl;
        }
        if let Some(max_ttl) = self.max_ttl {
            config.max_ttl = max_ttl;
        }
        if let Some(sync_mode) = self.sync_mode {
            config.sync_mode = sync_mode;
        }
        if let Some(sync_interval) = self.sync_interval {
            config.sync_interval = sync_interval;
        }
        if let Some(capacity) = self.mailbox_capacity {
            config.mailbox_capacity = capacity;
        }
    }
}

/// Parses a sync mode name.
pub fn parse_sync_mode(value: &str) -> Result<SyncMode, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "none" => Ok(SyncMode::None),
        "periodic" => Ok(SyncMode::Periodic),
        "always" => Ok(SyncMode::Always),
        _ => Err(ConfigError::BadValue {
            key: "sync-mode",
            value: value.to_string(),
        }),
    }
}

/// Parses a duration like `500ms`, `2s`, `5m`, `1h`, `7d` or `0`.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value == "0" {
        return Some(Duration::ZERO);
    }
    let split = value.find(|c: char| !c.is_ascii_digit())?;
    let (number, unit) = value.split_at(split);
    let number: u64 = number.parse().ok()?;
    match unit {
        "ms" => Some(Duration::from_millis(number)),
        "s" => Some(Duration::from_secs(number)),
        "m" => Some(Duration::from_secs(number * 60)),
        "h" => Some(Duration::from_secs(number * 3600)),
        "d" => Some(Duration::from_secs(number * 86400)),
        _ => None,
    }
}

fn parse_duration_key(value: &str, key: &'static str) -> Result<Duration, ConfigError> {
    parse_duration(value).ok_or_else(|| ConfigError::BadValue {
        key,
        value: value.to_string(),
    })
}

fn parse_count(value: &str, key: &'static str) -> Result<usize, ConfigError> {
    value
        .parse::<usize>()
        .ok()
        .filter(|&n| n > 0)
        .ok_or_else(|| ConfigError::BadValue {
            key,
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_file() {
        let ini = r#"
# TQCache configuration
[server]
listen = :11212

[storage]
data-dir = /tmp/tq
shards = 8
default-ttl = 1h
max-ttl = 7d
sync-mode = always   # fsync every write
sync-interval = 500ms
mailbox-capacity = 256
"#;
        let cfg = FileConfig::parse(ini).unwrap();
        assert_eq!(cfg.listen.as_deref(), Some(":11212"));
        assert_eq!(cfg.data_dir, Some(PathBuf::from("/tmp/tq")));
        assert_eq!(cfg.shards, Some(8));
        assert_eq!(cfg.default_ttl, Some(Duration::from_secs(3600)));
        assert_eq!(cfg.max_ttl, Some(Duration::from_secs(7 * 86400)));
        assert_eq!(cfg.sync_mode, Some(SyncMode::Always));
        assert_eq!(cfg.sync_interval, Some(Duration::from_millis(500)));
        assert_eq!(cfg.mailbox_capacity, Some(256));
    }

    #[test]
    fn test_parse_empty_and_comments() {
        let cfg = FileConfig::parse("; nothing here\n\n# comment\n").unwrap();
        assert!(cfg.listen.is_none());
        assert!(cfg.data_dir.is_none());
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let cfg = FileConfig::parse("[storage]\nfuture-option = yes\nshards = 4\n").unwrap();
        assert_eq!(cfg.shards, Some(4));
    }

    #[test]
    fn test_bad_values_rejected() {
        assert!(FileConfig::parse("[storage]\nshards = zero\n").is_err());
        assert!(FileConfig::parse("[storage]\nshards = 0\n").is_err());
        assert!(FileConfig::parse("[storage]\nsync-mode = sometimes\n").is_err());
        assert!(FileConfig::parse("[storage]\ndefault-ttl = fast\n").is_err());
    }

    #[test]
    fn test_parse_duration_forms() {
        assert_eq!(parse_duration("0"), Some(Duration::ZERO));
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration("1d"), Some(Duration::from_secs(86400)));
        assert_eq!(parse_duration("10"), None);
        assert_eq!(parse_duration("10x"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn test_apply_to_overlays_only_set_values() {
        let mut config = CacheConfig::default();
        let file = FileConfig {
            shards: Some(4),
            sync_mode: Some(SyncMode::None),
            ..FileConfig::default()
        };
        file.apply_to(&mut config);
        assert_eq!(config.shards, 4);
        assert_eq!(config.sync_mode, SyncMode::None);
        // Untouched fields keep their defaults.
        assert_eq!(config.mailbox_capacity, 1000);
    }
}
