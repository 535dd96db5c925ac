//! Runtime configuration.
//!
//! Settings come from a `KEY="value"` env file (the same format the
//! deployment writes to `/etc/newtube-env`), with process environment
//! variables taking precedence over the file.

use anyhow::{Context, Result};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::cache::{DEFAULT_BATCH_LIMIT, DEFAULT_STALE_AFTER_HOURS, RefreshPolicy};
use crate::provider::DEFAULT_API_BASE;
use crate::scheduler::DailySchedule;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/newtube-env";
pub const DEFAULT_NEWTUBE_PORT: u16 = 8080;
pub const DEFAULT_NEWTUBE_HOST: &str = "127.0.0.1";
pub const DEFAULT_MEDIA_ROOT: &str = "/yt";
pub const METADATA_DB_FILE: &str = "metadata.db";
pub const DEFAULT_PROVIDER_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_REFRESH_SPACING_MS: u64 = 200;

/// Raw values as found in the file or environment; everything optional.
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    pub media_root: Option<PathBuf>,
    pub metadata_db: Option<PathBuf>,
    pub youtube_api_key: Option<String>,
    pub youtube_api_base: Option<String>,
    pub newtube_host: Option<String>,
    pub newtube_port: Option<u16>,
    pub provider_timeout_secs: Option<u64>,
    pub stale_after_hours: Option<i64>,
    pub refresh_batch_limit: Option<usize>,
    pub refresh_spacing_ms: Option<u64>,
    pub refresh_at: Option<String>,
    pub enable_cron: Option<bool>,
}

impl EnvConfig {
    /// Applies one `KEY=value` pair. Unknown keys are ignored so the env file
    /// can be shared with other services. `origin` names the source in error
    /// messages.
    fn apply(&mut self, key: &str, value: &str, origin: &str) -> Result<()> {
        if value.is_empty() {
            return Ok(());
        }
        match key {
            "MEDIA_ROOT" => self.media_root = Some(PathBuf::from(value)),
            "METADATA_DB" => self.metadata_db = Some(PathBuf::from(value)),
            "YOUTUBE_API_KEY" => self.youtube_api_key = Some(value.to_string()),
            "YOUTUBE_API_BASE" => self.youtube_api_base = Some(value.to_string()),
            "NEWTUBE_HOST" => self.newtube_host = Some(value.to_string()),
            "NEWTUBE_PORT" => {
                self.newtube_port = Some(parse_value(key, value, origin)?);
            }
            "PROVIDER_TIMEOUT_SECS" => {
                self.provider_timeout_secs = Some(parse_value(key, value, origin)?);
            }
            "STALE_AFTER_HOURS" => {
                self.stale_after_hours = Some(parse_value(key, value, origin)?);
            }
            "REFRESH_BATCH_LIMIT" => {
                self.refresh_batch_limit = Some(parse_value(key, value, origin)?);
            }
            "REFRESH_SPACING_MS" => {
                self.refresh_spacing_ms = Some(parse_value(key, value, origin)?);
            }
            "REFRESH_AT" => self.refresh_at = Some(value.to_string()),
            "ENABLE_VIDEO_CACHE_CRON" => {
                self.enable_cron = Some(matches!(
                    value.to_ascii_lowercase().as_str(),
                    "true" | "1" | "yes" | "on"
                ));
            }
            _ => {}
        }
        Ok(())
    }
}

fn parse_value<T>(key: &str, value: &str, origin: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .with_context(|| format!("Parsing {key} from {origin}"))
}

pub fn read_env_config(path: &Path) -> Result<Option<EnvConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let origin = path.display().to_string();
    let mut cfg = EnvConfig::default();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some((key, value_raw)) = trimmed.split_once('=') {
            let value = value_raw.trim().trim_matches('"');
            cfg.apply(key.trim(), value, &origin)?;
        }
    }
    Ok(Some(cfg))
}

/// Overlays process environment variables on top of `cfg`.
pub fn apply_env_overrides<I>(cfg: &mut EnvConfig, vars: I) -> Result<()>
where
    I: IntoIterator<Item = (String, String)>,
{
    for (key, value) in vars {
        cfg.apply(&key, value.trim(), "environment")?;
    }
    Ok(())
}

/// Fully resolved settings used by the binaries.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub metadata_db: PathBuf,
    pub youtube_api_key: Option<String>,
    pub youtube_api_base: String,
    pub newtube_host: String,
    pub newtube_port: u16,
    pub provider_timeout: Duration,
    pub refresh: RefreshPolicy,
    pub refresh_at: DailySchedule,
    pub cron_enabled: bool,
}

impl CacheSettings {
    fn resolve(cfg: EnvConfig) -> Result<Self> {
        let media_root = cfg
            .media_root
            .unwrap_or_else(|| PathBuf::from(DEFAULT_MEDIA_ROOT));
        let metadata_db = cfg
            .metadata_db
            .unwrap_or_else(|| media_root.join(METADATA_DB_FILE));
        let refresh_at = match cfg.refresh_at.as_deref() {
            Some(value) => DailySchedule::parse(value)?,
            None => DailySchedule::default(),
        };
        let threshold = RefreshPolicy::threshold_from_hours(
            cfg.stale_after_hours.unwrap_or(DEFAULT_STALE_AFTER_HOURS),
        )
        .context("Invalid STALE_AFTER_HOURS")?;
        let refresh = RefreshPolicy {
            threshold,
            batch_limit: cfg.refresh_batch_limit.unwrap_or(DEFAULT_BATCH_LIMIT),
            spacing: Duration::from_millis(
                cfg.refresh_spacing_ms.unwrap_or(DEFAULT_REFRESH_SPACING_MS),
            ),
        };

        Ok(Self {
            metadata_db,
            youtube_api_key: cfg.youtube_api_key,
            youtube_api_base: cfg
                .youtube_api_base
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            newtube_host: cfg
                .newtube_host
                .unwrap_or_else(|| DEFAULT_NEWTUBE_HOST.to_string()),
            newtube_port: cfg.newtube_port.unwrap_or(DEFAULT_NEWTUBE_PORT),
            provider_timeout: Duration::from_secs(
                cfg.provider_timeout_secs
                    .unwrap_or(DEFAULT_PROVIDER_TIMEOUT_SECS),
            ),
            refresh,
            refresh_at,
            cron_enabled: cfg.enable_cron.unwrap_or(false),
        })
    }
}

pub fn load_settings() -> Result<CacheSettings> {
    load_settings_from(Path::new(DEFAULT_CONFIG_PATH), std::env::vars())
}

/// Reads `path` (a missing file is fine) and applies `vars` on top.
pub fn load_settings_from<I>(path: impl AsRef<Path>, vars: I) -> Result<CacheSettings>
where
    I: IntoIterator<Item = (String, String)>,
{
    let path = path.as_ref();
    let mut cfg = read_env_config(path)?.unwrap_or_default();
    apply_env_overrides(&mut cfg, vars)?;
    CacheSettings::resolve(cfg)
}
