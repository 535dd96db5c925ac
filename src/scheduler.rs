//! Daily trigger for the stale-record refresh.
//!
//! The cache itself never schedules anything. The host process owns a
//! [`DailySchedule`] and hands it to [`spawn_daily_refresh`], which sleeps
//! until the next fire time, runs the batch on the blocking pool, logs the
//! outcome and goes back to sleep. Nothing inside the loop can take the host
//! down: every failure is logged and the loop continues.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Local, NaiveTime, TimeZone};
use tokio::task::{self, JoinHandle};
use tracing::{error, info};

use crate::cache::{Clock, MetadataCache, RefreshPolicy};
use crate::metadata::VideoStore;
use crate::provider::MetadataProvider;

/// Fires once per day at a fixed local wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailySchedule {
    at: NaiveTime,
}

impl Default for DailySchedule {
    /// 02:00 local time.
    fn default() -> Self {
        Self {
            at: NaiveTime::from_hms_opt(2, 0, 0).unwrap_or(NaiveTime::MIN),
        }
    }
}

impl DailySchedule {
    pub fn new(hour: u32, minute: u32) -> Result<Self> {
        let at = NaiveTime::from_hms_opt(hour, minute, 0)
            .ok_or_else(|| anyhow!("invalid time of day {hour:02}:{minute:02}"))?;
        Ok(Self { at })
    }

    /// Parses `HH:MM`.
    pub fn parse(value: &str) -> Result<Self> {
        let at = NaiveTime::parse_from_str(value.trim(), "%H:%M")
            .with_context(|| format!("parsing refresh time {value:?} (expected HH:MM)"))?;
        Ok(Self { at })
    }

    pub fn time_of_day(&self) -> NaiveTime {
        self.at
    }

    /// First fire time strictly after `now`, in `now`'s time zone. Local times
    /// skipped by a DST jump are passed over to the following day.
    pub fn next_fire_after<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> DateTime<Tz> {
        let tz = now.timezone();
        let mut date = now.date_naive();
        loop {
            if let Some(fire) = tz.from_local_datetime(&date.and_time(self.at)).earliest()
                && fire > *now
            {
                return fire;
            }
            date = match date.succ_opt() {
                Some(next) => next,
                None => return now.clone(),
            };
        }
    }
}

/// Runs `refresh_stale` every day at `schedule` until the runtime shuts down.
pub fn spawn_daily_refresh<S, P, C>(
    schedule: DailySchedule,
    cache: Arc<MetadataCache<S, P, C>>,
    policy: RefreshPolicy,
) -> JoinHandle<()>
where
    S: VideoStore + Send + Sync + 'static,
    P: MetadataProvider + Send + Sync + 'static,
    C: Clock + 'static,
{
    info!(at = %schedule.time_of_day(), "stale video refresh scheduled daily");

    tokio::spawn(async move {
        loop {
            let now = Local::now();
            let next = schedule.next_fire_after(&now);
            let wait = (next.clone() - now).to_std().unwrap_or_default();
            info!(next = %next, "waiting for next stale video refresh");
            tokio::time::sleep(wait).await;

            let cache = cache.clone();
            let policy = policy.clone();
            let result = task::spawn_blocking(move || {
                let now = cache.now();
                cache.refresh_stale(now, &policy)
            })
            .await;

            match result {
                Ok(Ok(report)) => info!(
                    selected = report.selected,
                    refreshed = report.refreshed,
                    failed = report.failed.len(),
                    "scheduled stale video refresh finished"
                ),
                Ok(Err(err)) => error!(error = %err, "scheduled stale video refresh failed"),
                Err(err) => error!(error = %err, "scheduled stale video refresh panicked"),
            }
        }
    })
}
