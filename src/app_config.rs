//! Application configuration loading for CLI defaults.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

/// `key = value` file configuration; every field is optional.
#[derive(Debug, Clone, Default)]
pub struct FileConfig {
    /// SQLite database path.
    pub database_path: Option<PathBuf>,
    /// Directory downloaded videos are written to.
    pub download_dir: Option<PathBuf>,
    /// Catalog server base URL.
    pub catalog_endpoint: Option<String>,
    /// Bearer token sent to the catalog.
    pub catalog_token: Option<String>,
    /// Signed-in user.
    pub user_id: Option<String>,
    /// Unwatched duration the reconciler keeps downloaded, in seconds.
    pub target_duration_secs: Option<u64>,
    /// Downloads the reconciler may start per pass.
    pub max_new_per_run: Option<u32>,
    /// Free space below which storage counts as low, in MiB.
    pub low_storage_threshold_mb: Option<u64>,
    /// Concurrent work units in the worker pool (1..=16).
    pub worker_concurrency: Option<u8>,
    /// Seconds between daemon sync passes.
    pub sync_interval_secs: Option<u64>,
    /// Optional database pool max connections (1..=20).
    pub db_max_connections: Option<u32>,
    /// Optional database busy timeout in milliseconds.
    pub db_busy_timeout_ms: Option<u32>,
}

impl FileConfig {
    /// Validates config values against runtime and CLI constraints.
    pub fn validate(&self) -> Result<()> {
        if let Some(concurrency) = self.worker_concurrency
            && !(1..=16).contains(&concurrency)
        {
            bail!(
                "Invalid config value for `worker_concurrency`: {concurrency}. Expected range: 1..=16"
            );
        }

        if let Some(target) = self.target_duration_secs
            && !(60..=7 * 86_400).contains(&target)
        {
            bail!(
                "Invalid config value for `target_duration_secs`: {target}. Expected range: 60..=604800"
            );
        }

        if let Some(max_new) = self.max_new_per_run
            && max_new > 100
        {
            bail!("Invalid config value for `max_new_per_run`: {max_new}. Expected range: 0..=100");
        }

        if let Some(interval) = self.sync_interval_secs
            && !(60..=86_400).contains(&interval)
        {
            bail!(
                "Invalid config value for `sync_interval_secs`: {interval}. Expected range: 60..=86400"
            );
        }

        if let Some(endpoint) = &self.catalog_endpoint
            && !(endpoint.starts_with("http://") || endpoint.starts_with("https://"))
        {
            bail!("Invalid config value for `catalog_endpoint`: '{endpoint}'. Expected an http(s) URL");
        }

        validate_db_max_connections(self.db_max_connections)?;
        validate_db_busy_timeout_ms(self.db_busy_timeout_ms)?;

        Ok(())
    }
}

fn validate_db_max_connections(value: Option<u32>) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    if !(1..=20).contains(&value) {
        bail!("Invalid config value for `db_max_connections`: {value}. Expected range: 1..=20");
    }
    Ok(())
}

fn validate_db_busy_timeout_ms(value: Option<u32>) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    if value > 120_000 {
        bail!("Invalid config value for `db_busy_timeout_ms`: {value}. Expected range: 0..=120000");
    }
    Ok(())
}

/// Loaded config metadata.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// Resolved config path if a base directory is known.
    pub path: Option<PathBuf>,
    /// Parsed file config when a config file exists and was valid.
    pub config: Option<FileConfig>,
}

/// Resolves default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/offline-cache/config.toml`
/// 2. `$HOME/.config/offline-cache/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(
            PathBuf::from(xdg_config_home)
                .join("offline-cache")
                .join("config.toml"),
        );
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("offline-cache")
            .join("config.toml"),
    )
}

/// Resolves the default data directory holding the database and videos.
///
/// Priority:
/// 1. `$XDG_DATA_HOME/offline-cache`
/// 2. `$HOME/.local/share/offline-cache`
/// 3. `./offline-cache`
#[must_use]
pub fn resolve_default_data_dir() -> PathBuf {
    if let Some(xdg_data_home) = env_var_non_empty_os("XDG_DATA_HOME") {
        return PathBuf::from(xdg_data_home).join("offline-cache");
    }
    match env_var_non_empty_os("HOME") {
        Some(home) => PathBuf::from(home)
            .join(".local")
            .join("share")
            .join("offline-cache"),
        None => PathBuf::from("offline-cache"),
    }
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads config from `explicit` if given, else from the default path if present.
///
/// An explicit path that does not exist is an error; a missing default file is not.
pub fn load_file_config_from(explicit: Option<&Path>) -> Result<LoadedConfig> {
    if let Some(path) = explicit {
        let config = load_file_config(path)?;
        return Ok(LoadedConfig {
            path: Some(path.to_path_buf()),
            config: Some(config),
        });
    }

    let path = resolve_default_config_path();
    let Some(path_ref) = path.as_deref() else {
        return Ok(LoadedConfig { path, config: None });
    };

    if !path_ref.exists() {
        return Ok(LoadedConfig { path, config: None });
    }

    let config = load_file_config(path_ref)?;
    Ok(LoadedConfig {
        path,
        config: Some(config),
    })
}

fn load_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    parse_config_str(&raw)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))
}

fn parse_config_str(raw: &str) -> Result<FileConfig> {
    let mut cfg = FileConfig::default();
    for (line_index, raw_line) in raw.lines().enumerate() {
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            bail!(
                "Invalid config syntax on line {}: expected key = value",
                line_index + 1
            );
        };

        let key = raw_key.trim();
        let value = raw_value.trim();
        let line_no = line_index + 1;

        match key {
            "database_path" => {
                let parsed = parse_string_literal(value)
                    .with_context(|| format!("Invalid `database_path` value on line {line_no}"))?;
                cfg.database_path = Some(PathBuf::from(parsed));
            }
            "download_dir" => {
                let parsed = parse_string_literal(value)
                    .with_context(|| format!("Invalid `download_dir` value on line {line_no}"))?;
                cfg.download_dir = Some(PathBuf::from(parsed));
            }
            "catalog_endpoint" => {
                let parsed = parse_string_literal(value).with_context(|| {
                    format!("Invalid `catalog_endpoint` value on line {line_no}")
                })?;
                cfg.catalog_endpoint = Some(parsed);
            }
            "catalog_token" => {
                let parsed = parse_string_literal(value)
                    .with_context(|| format!("Invalid `catalog_token` value on line {line_no}"))?;
                cfg.catalog_token = Some(parsed);
            }
            "user_id" => {
                let parsed = parse_string_literal(value)
                    .with_context(|| format!("Invalid `user_id` value on line {line_no}"))?;
                if parsed.trim().is_empty() {
                    bail!("Invalid `user_id` value on line {line_no}: must not be empty");
                }
                cfg.user_id = Some(parsed);
            }
            "target_duration_secs" => {
                let parsed = parse_integer_u64(value).with_context(|| {
                    format!("Invalid `target_duration_secs` value on line {line_no}")
                })?;
                cfg.target_duration_secs = Some(parsed);
            }
            "max_new_per_run" => {
                let parsed = parse_integer_u64(value)
                    .with_context(|| format!("Invalid `max_new_per_run` value on line {line_no}"))?;
                let n = u32::try_from(parsed)
                    .map_err(|_| anyhow::anyhow!("max_new_per_run out of range for u32"))?;
                cfg.max_new_per_run = Some(n);
            }
            "low_storage_threshold_mb" => {
                let parsed = parse_integer_u64(value).with_context(|| {
                    format!("Invalid `low_storage_threshold_mb` value on line {line_no}")
                })?;
                cfg.low_storage_threshold_mb = Some(parsed);
            }
            "worker_concurrency" => {
                let parsed = parse_integer_u8(value).with_context(|| {
                    format!("Invalid `worker_concurrency` value on line {line_no}")
                })?;
                cfg.worker_concurrency = Some(parsed);
            }
            "sync_interval_secs" => {
                let parsed = parse_integer_u64(value).with_context(|| {
                    format!("Invalid `sync_interval_secs` value on line {line_no}")
                })?;
                cfg.sync_interval_secs = Some(parsed);
            }
            "db_max_connections" => {
                let parsed = parse_integer_u64(value).with_context(|| {
                    format!("Invalid `db_max_connections` value on line {line_no}")
                })?;
                let n = u32::try_from(parsed)
                    .map_err(|_| anyhow::anyhow!("db_max_connections out of range for u32"))?;
                cfg.db_max_connections = Some(n);
            }
            "db_busy_timeout_ms" => {
                let parsed = parse_integer_u64(value).with_context(|| {
                    format!("Invalid `db_busy_timeout_ms` value on line {line_no}")
                })?;
                let n = u32::try_from(parsed)
                    .map_err(|_| anyhow::anyhow!("db_busy_timeout_ms out of range for u32"))?;
                cfg.db_busy_timeout_ms = Some(n);
            }
            unknown => {
                bail!("Unknown configuration key: '{unknown}' on line {line_no}");
            }
        }
    }
    cfg.validate()?;
    Ok(cfg)
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn parse_string_literal(raw_value: &str) -> Result<String> {
    if raw_value.len() < 2 || !raw_value.starts_with('"') || !raw_value.ends_with('"') {
        bail!("Expected double-quoted string");
    }
    Ok(raw_value[1..raw_value.len() - 1].to_string())
}

fn parse_integer_u8(raw_value: &str) -> Result<u8> {
    let token = raw_value.trim();
    if token.is_empty() {
        bail!("Expected integer value");
    }
    let value = token.parse::<u16>()?;
    u8::try_from(value).map_err(|_| anyhow::anyhow!("Integer value out of range for u8"))
}

fn parse_integer_u64(raw_value: &str) -> Result<u64> {
    let token = raw_value.trim();
    if token.is_empty() {
        bail!("Expected integer value");
    }
    let value = token.parse::<i128>()?;
    if value < 0 {
        bail!("Expected non-negative integer");
    }
    u64::try_from(value).map_err(|_| anyhow::anyhow!("Integer value out of range for u64"))
}
