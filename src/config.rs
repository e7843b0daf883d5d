//! Daemon configuration: compiled-in defaults, overridden by an INI file,
//! overridden again by CLI flags. Mirrors the original's
//! "don't overwrite a value the CLI already set" merge order.

use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::error::{KapricaError, Result};
use crate::model::DEFAULT_READ_SIZE;

/// Default retention window, in days.
const DEFAULT_EXPIRE_DAYS: u32 = 30;
/// Default store size cap: 2 GiB.
const DEFAULT_SIZE_CAP_BYTES: u64 = 2 * 1024 * 1024 * 1024;
/// Default maximum entry count.
const DEFAULT_MAX_ENTRIES: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: PathBuf,
    pub expire_days: u32,
    pub size_cap_bytes: u64,
    pub max_entries: u64,
    pub read_size: usize,
}

impl Config {
    pub fn defaults() -> Self {
        Self {
            database_path: default_database_path(),
            expire_days: DEFAULT_EXPIRE_DAYS,
            size_cap_bytes: DEFAULT_SIZE_CAP_BYTES,
            max_entries: DEFAULT_MAX_ENTRIES,
            read_size: DEFAULT_READ_SIZE,
        }
    }
}

/// CLI-supplied overrides, all optional: a `None` field defers to the INI
/// file, and a field absent from the INI file defers to the compiled-in
/// default.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub database_path: Option<PathBuf>,
    pub expire_days: Option<u32>,
    pub size_cap_bytes: Option<u64>,
    pub max_entries: Option<u64>,
}

/// Load configuration: start from defaults, layer in the discovered or
/// overridden INI file, then layer CLI overrides on top.
pub fn load(cli: &CliOverrides) -> Result<Config> {
    let mut config = Config::defaults();

    if let Some(path) = discover_config_path(cli.config_path.as_deref()) {
        debug!("loading config file {}", path.display());
        apply_ini_file(&mut config, &path)?;
    }

    if let Some(database_path) = &cli.database_path {
        config.database_path = database_path.clone();
    }
    if let Some(expire_days) = cli.expire_days {
        config.expire_days = expire_days;
    }
    if let Some(size_cap_bytes) = cli.size_cap_bytes {
        config.size_cap_bytes = size_cap_bytes;
    }
    if let Some(max_entries) = cli.max_entries {
        config.max_entries = max_entries;
    }

    Ok(config)
}

/// `--config` wins outright; otherwise the first of
/// `$XDG_CONFIG_HOME/kaprica/config`, `$HOME/.config/kaprica/config`,
/// `/etc/kaprica/config` that exists on disk.
fn discover_config_path(cli_override: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = cli_override {
        return Some(path.to_path_buf());
    }

    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
        let candidate = PathBuf::from(xdg).join("kaprica/config");
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    if let Some(home) = std::env::var_os("HOME") {
        let candidate = PathBuf::from(home).join(".config/kaprica/config");
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    let etc = PathBuf::from("/etc/kaprica/config");
    if etc.is_file() {
        return Some(etc);
    }
    None
}

/// `$XDG_DATA_HOME/kaprica/history.db`, falling back to
/// `$HOME/.local/share/kaprica/history.db`.
fn default_database_path() -> PathBuf {
    if let Some(xdg) = std::env::var_os("XDG_DATA_HOME") {
        return PathBuf::from(xdg).join("kaprica/history.db");
    }
    if let Some(home) = std::env::var_os("HOME") {
        return PathBuf::from(home).join(".local/share/kaprica/history.db");
    }
    PathBuf::from("kaprica/history.db")
}

fn apply_ini_file(config: &mut Config, path: &Path) -> Result<()> {
    let ini = ini::Ini::load_from_file(path)
        .map_err(|e| KapricaError::Other(format!("failed to parse {}: {e}", path.display())))?;
    let section = ini.general_section();

    if let Some(value) = section.get("database") {
        config.database_path = PathBuf::from(value);
    }
    if let Some(value) = section.get("expire_days") {
        match value.parse() {
            Ok(days) => config.expire_days = days,
            Err(_) => warn!("config: ignoring invalid expire_days {value:?}"),
        }
    }
    if let Some(value) = section.get("size_cap") {
        match parse_size(value) {
            Ok(bytes) => config.size_cap_bytes = bytes,
            Err(e) => warn!("config: ignoring invalid size_cap {value:?}: {e}"),
        }
    }
    if let Some(value) = section.get("max_entries") {
        match value.parse() {
            Ok(n) => config.max_entries = n,
            Err(_) => warn!("config: ignoring invalid max_entries {value:?}"),
        }
    }

    Ok(())
}

/// Parse a size with an optional `KB`/`MB`/`GB` suffix (case-insensitive); a
/// bare number is taken as bytes. Exposed for the daemon's `--size` flag.
pub fn parse_size(value: &str) -> std::result::Result<u64, String> {
    let value = value.trim();
    let lower = value.to_ascii_lowercase();

    let (number, multiplier) = if let Some(n) = lower.strip_suffix("gb") {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = lower.strip_suffix("mb") {
        (n, 1024 * 1024)
    } else if let Some(n) = lower.strip_suffix("kb") {
        (n, 1024)
    } else {
        (lower.as_str(), 1)
    };

    number
        .trim()
        .parse::<u64>()
        .map(|n| n * multiplier)
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_size_accepts_plain_bytes_and_suffixes() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("2KB").unwrap(), 2048);
        assert_eq!(parse_size("1MB").unwrap(), 1024 * 1024);
        assert_eq!(parse_size("1GB").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_size("3 mb").unwrap(), 3 * 1024 * 1024);
    }

    #[test]
    fn parse_size_rejects_garbage() {
        assert!(parse_size("not-a-size").is_err());
    }

    #[test]
    fn cli_overrides_win_over_ini_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config");
        std::fs::write(&config_path, "expire_days = 7\nmax_entries = 500\n").unwrap();

        let cli = CliOverrides {
            config_path: Some(config_path),
            expire_days: Some(99),
            ..Default::default()
        };
        let config = load(&cli).unwrap();
        assert_eq!(config.expire_days, 99);
        assert_eq!(config.max_entries, 500);
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = Config::defaults();
        assert_eq!(config.expire_days, DEFAULT_EXPIRE_DAYS);
        assert_eq!(config.size_cap_bytes, DEFAULT_SIZE_CAP_BYTES);
        assert_eq!(config.max_entries, DEFAULT_MAX_ENTRIES);
    }
}
