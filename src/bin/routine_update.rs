#![forbid(unsafe_code)]

//! One-shot stale-record refresh. Meant to be started by cron or a systemd
//! timer when the backend is not hosting the daily schedule itself.
//!
//! Individual videos that fail to refresh are logged and left for the next
//! run; the process only exits non-zero when it cannot start at all.

use anyhow::{Context, Result, anyhow};
use chrono::TimeDelta;
use clap::Parser;
use newtube_cache::{
    cache::{MAX_STALE_AFTER_HOURS, MetadataCache, RefreshPolicy},
    config::{DEFAULT_CONFIG_PATH, load_settings_from},
    logging,
    metadata::MetadataStore,
    provider::YouTubeClient,
    security::ensure_not_root,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Refresh cached YouTube metadata older than the staleness threshold.")]
struct RoutineArgs {
    #[arg(long = "config", value_name = "PATH", default_value = DEFAULT_CONFIG_PATH, help = "Path to the env-style config file")]
    config: PathBuf,
    #[arg(
        long = "stale-after-hours",
        value_name = "HOURS",
        value_parser = clap::value_parser!(i64).range(1..=MAX_STALE_AFTER_HOURS),
        help = "Override STALE_AFTER_HOURS"
    )]
    stale_after_hours: Option<i64>,
    #[arg(long = "batch-limit", value_name = "COUNT", help = "Override REFRESH_BATCH_LIMIT")]
    batch_limit: Option<usize>,
    #[arg(long = "spacing-ms", value_name = "MILLIS", help = "Override REFRESH_SPACING_MS")]
    spacing_ms: Option<u64>,
}

impl RoutineArgs {
    /// Command-line flags win over the configured policy.
    fn policy(&self, configured: RefreshPolicy) -> RefreshPolicy {
        RefreshPolicy {
            threshold: self
                .stale_after_hours
                .map(TimeDelta::hours)
                .unwrap_or(configured.threshold),
            batch_limit: self.batch_limit.unwrap_or(configured.batch_limit),
            spacing: self
                .spacing_ms
                .map(Duration::from_millis)
                .unwrap_or(configured.spacing),
        }
    }
}

fn main() -> Result<()> {
    logging::init("routine_update");
    let args = RoutineArgs::parse();
    ensure_not_root("routine_update")?;

    let settings =
        load_settings_from(&args.config, std::env::vars()).context("loading configuration")?;
    let api_key = settings
        .youtube_api_key
        .clone()
        .ok_or_else(|| anyhow!("YOUTUBE_API_KEY is not configured"))?;

    let store = MetadataStore::open(&settings.metadata_db).context("initializing metadata database")?;
    let provider = YouTubeClient::new(
        api_key,
        settings.youtube_api_base.clone(),
        settings.provider_timeout,
    )?;
    let cache = MetadataCache::new(store, provider);
    let policy = args.policy(settings.refresh.clone());

    info!(
        db = %settings.metadata_db.display(),
        threshold_hours = policy.threshold.num_hours(),
        batch_limit = policy.batch_limit,
        "running stale video refresh"
    );

    let report = cache
        .refresh_stale(cache.now(), &policy)
        .context("selecting stale videos")?;

    for failure in &report.failed {
        warn!(external_id = %failure.external_id, error = %failure.error, "video left stale");
    }
    info!(
        selected = report.selected,
        refreshed = report.refreshed,
        missing_upstream = report.missing_upstream,
        failed = report.failed.len(),
        "stale video refresh complete"
    );

    Ok(())
}
