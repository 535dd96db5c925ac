//! Cache-aside layer in front of the metadata provider.
//!
//! Reads go to the store first. A miss fetches from the provider and inserts
//! the record; a hit only bumps `last_accessed`. Staleness is never checked on
//! the read path: records are brought up to date by an explicit
//! [`MetadataCache::refresh`] or by the periodic
//! [`MetadataCache::refresh_stale`] batch.

use std::thread;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::CacheError;
use crate::metadata::{CacheFilter, CachedVideo, SortMode, VideoStore};
use crate::provider::MetadataProvider;

pub const DEFAULT_CATEGORY: &str = "uncategorized";
pub const DEFAULT_SORT_HINT: &str = "date";
pub const MISSING_DESCRIPTION: &str = "No description available";

pub const DEFAULT_STALE_AFTER_HOURS: i64 = 24;
/// Ten years. Larger thresholds would push the staleness cutoff out of the
/// representable date range.
pub const MAX_STALE_AFTER_HOURS: i64 = 24 * 365 * 10;
pub const DEFAULT_BATCH_LIMIT: usize = 50;
pub const DEFAULT_REQUEST_SPACING: Duration = Duration::from_millis(200);

/// Time source for access and update stamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock truncated to the millisecond precision the store keeps.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now().trunc_subsecs(3)
    }
}

/// Knobs for the stale-record batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshPolicy {
    /// Records whose `last_updated` is older than this are stale.
    pub threshold: TimeDelta,
    pub batch_limit: usize,
    /// Minimum pause between consecutive provider calls.
    pub spacing: Duration,
}

impl RefreshPolicy {
    /// Staleness threshold of `hours`, which must lie in
    /// `1..=MAX_STALE_AFTER_HOURS`.
    pub fn threshold_from_hours(hours: i64) -> Result<TimeDelta, CacheError> {
        if !(1..=MAX_STALE_AFTER_HOURS).contains(&hours) {
            return Err(CacheError::Validation(format!(
                "stale threshold must be between 1 and {MAX_STALE_AFTER_HOURS} hours, got {hours}"
            )));
        }
        Ok(TimeDelta::hours(hours))
    }
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            threshold: TimeDelta::hours(DEFAULT_STALE_AFTER_HOURS),
            batch_limit: DEFAULT_BATCH_LIMIT,
            spacing: DEFAULT_REQUEST_SPACING,
        }
    }
}

/// Result of [`MetadataCache::get_or_fetch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cached {
    pub video: CachedVideo,
    /// `true` when the record was fetched and inserted by this call.
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed(CachedVideo),
    /// The provider no longer knows the video. The local copy is returned
    /// untouched; this is not treated as a deletion.
    MissingUpstream(CachedVideo),
}

/// One page of [`MetadataCache::list_cached`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedPage {
    pub videos: Vec<CachedVideo>,
    pub total: u64,
    pub total_pages: u64,
    pub current_page: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedRefresh {
    pub external_id: String,
    pub error: String,
}

/// Summary of one [`MetadataCache::refresh_stale`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshReport {
    pub selected: usize,
    pub refreshed: usize,
    pub missing_upstream: usize,
    pub failed: Vec<FailedRefresh>,
}

/// The metadata cache. Holds no global state; the store, provider and clock
/// are all injected.
pub struct MetadataCache<S, P, C = SystemClock> {
    store: S,
    provider: P,
    clock: C,
}

impl<S, P> MetadataCache<S, P, SystemClock>
where
    S: VideoStore,
    P: MetadataProvider,
{
    pub fn new(store: S, provider: P) -> Self {
        Self::with_clock(store, provider, SystemClock)
    }
}

impl<S, P, C> MetadataCache<S, P, C>
where
    S: VideoStore,
    P: MetadataProvider,
    C: Clock,
{
    pub fn with_clock(store: S, provider: P, clock: C) -> Self {
        Self {
            store,
            provider,
            clock,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Returns the cached record, fetching and inserting it on a miss.
    ///
    /// `category` and `sort_hint` only apply to newly created records. Each
    /// successful call performs exactly one write: either the access-time bump
    /// or the insert.
    pub fn get_or_fetch(
        &self,
        external_id: &str,
        category: Option<&str>,
        sort_hint: Option<&str>,
    ) -> Result<Cached, CacheError> {
        let external_id = require_id(external_id)?;

        if let Some(mut video) = self.store.find_one(external_id)? {
            self.touch(&mut video)?;
            debug!(external_id, "video already cached");
            return Ok(Cached {
                video,
                created: false,
            });
        }

        let fetched = self
            .provider
            .fetch_by_id(external_id)?
            .ok_or_else(|| CacheError::NotFoundUpstream(external_id.to_owned()))?;

        let now = self.clock.now();
        let description = if fetched.description.trim().is_empty() {
            MISSING_DESCRIPTION.to_owned()
        } else {
            fetched.description
        };

        let video = CachedVideo {
            id: 0,
            external_id: Some(external_id.to_owned()),
            title: fetched.title,
            description,
            thumbnail_url: fetched.thumbnail_url,
            duration_raw: fetched.duration_raw,
            channel_id: fetched.channel_id,
            channel_title: fetched.channel_title,
            view_count: fetched.view_count,
            published_at: fetched.published_at,
            category: non_empty_or(category, DEFAULT_CATEGORY),
            sort_hint: non_empty_or(sort_hint, DEFAULT_SORT_HINT),
            last_accessed: now,
            last_updated: now,
        };

        let video = self.store.insert(video)?;
        info!(external_id, title = %video.title, "cached video from provider");
        Ok(Cached {
            video,
            created: true,
        })
    }

    /// Looks up a cached record without touching the provider. Bumps
    /// `last_accessed` on success.
    pub fn get_by_id(&self, external_id: &str) -> Result<CachedVideo, CacheError> {
        let external_id = require_id(external_id)?;
        let mut video = self
            .store
            .find_one(external_id)?
            .ok_or_else(|| CacheError::NotCached(external_id.to_owned()))?;
        self.touch(&mut video)?;
        Ok(video)
    }

    /// Re-fetches a cached record from the provider and overwrites its
    /// provider-sourced fields.
    pub fn refresh(&self, external_id: &str) -> Result<RefreshOutcome, CacheError> {
        let external_id = require_id(external_id)?;
        let video = self
            .store
            .find_one(external_id)?
            .ok_or_else(|| CacheError::NotCached(external_id.to_owned()))?;
        self.refresh_record(video)
    }

    pub fn list_cached(
        &self,
        filter: &CacheFilter,
        sort: SortMode,
        page: u64,
        page_size: u64,
    ) -> Result<CachedPage, CacheError> {
        if page < 1 {
            return Err(CacheError::Validation("page numbers start at 1".into()));
        }
        if page_size < 1 {
            return Err(CacheError::Validation("page size must be positive".into()));
        }

        let total = self.store.count(filter)?;
        let skip = (page - 1).saturating_mul(page_size);
        let videos = self.store.find(filter, sort, skip, page_size)?;

        Ok(CachedPage {
            videos,
            total,
            total_pages: total.div_ceil(page_size),
            current_page: page,
        })
    }

    /// Refreshes up to `policy.batch_limit` records not updated within
    /// `policy.threshold` of `now`, oldest first, one provider call at a time.
    ///
    /// Per-record failures are logged and recorded in the report; they never
    /// abort the batch. Only failing to select candidates is an error.
    pub fn refresh_stale(
        &self,
        now: DateTime<Utc>,
        policy: &RefreshPolicy,
    ) -> Result<RefreshReport, CacheError> {
        if policy.threshold <= TimeDelta::zero() {
            return Err(CacheError::Validation(
                "stale threshold must be positive".into(),
            ));
        }
        let cutoff = now.checked_sub_signed(policy.threshold).ok_or_else(|| {
            CacheError::Validation(format!(
                "stale threshold of {} hours is out of range",
                policy.threshold.num_hours()
            ))
        })?;
        let candidates = self.store.find_stale(cutoff, policy.batch_limit)?;

        let mut report = RefreshReport {
            selected: candidates.len(),
            ..RefreshReport::default()
        };
        info!(
            selected = report.selected,
            cutoff = %cutoff,
            "starting stale video refresh"
        );

        for (index, video) in candidates.into_iter().enumerate() {
            if index > 0 && !policy.spacing.is_zero() {
                thread::sleep(policy.spacing);
            }

            let external_id = video.external_id.clone().unwrap_or_default();
            match self.refresh_record(video) {
                Ok(RefreshOutcome::Refreshed(_)) => report.refreshed += 1,
                Ok(RefreshOutcome::MissingUpstream(_)) => report.missing_upstream += 1,
                Err(err) => {
                    warn!(external_id = %external_id, error = %err, "skipping video after refresh failure");
                    report.failed.push(FailedRefresh {
                        external_id,
                        error: err.to_string(),
                    });
                }
            }
        }

        info!(
            refreshed = report.refreshed,
            missing_upstream = report.missing_upstream,
            failed = report.failed.len(),
            "stale video refresh completed"
        );
        Ok(report)
    }

    fn refresh_record(&self, video: CachedVideo) -> Result<RefreshOutcome, CacheError> {
        let external_id = video
            .external_id
            .clone()
            .ok_or_else(|| CacheError::Validation(format!("video {} has no external id", video.id)))?;

        let Some(fetched) = self.provider.fetch_by_id(&external_id)? else {
            warn!(external_id = %external_id, "video not found upstream, keeping cached copy");
            return Ok(RefreshOutcome::MissingUpstream(video));
        };

        let video = self
            .store
            .apply_refresh(video.id, &fetched, self.clock.now())?;
        info!(external_id = %external_id, "refreshed cached video");
        Ok(RefreshOutcome::Refreshed(video))
    }

    /// Bumps `last_accessed` without ever moving it backwards.
    fn touch(&self, video: &mut CachedVideo) -> Result<(), CacheError> {
        video.last_accessed = self.store.touch(video.id, self.clock.now())?;
        Ok(())
    }
}

fn require_id(external_id: &str) -> Result<&str, CacheError> {
    let trimmed = external_id.trim();
    if trimmed.is_empty() {
        return Err(CacheError::Validation("YouTube video ID is required".into()));
    }
    Ok(trimmed)
}

fn non_empty_or(value: Option<&str>, fallback: &str) -> String {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(fallback)
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetadataStore;
    use crate::provider::{ProviderError, ProviderVideo};
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};
    use std::sync::Arc;
    use std::time::Instant;

    /// Settable clock shared between the test and the cache.
    #[derive(Clone)]
    struct ManualClock(Arc<Mutex<DateTime<Utc>>>);

    impl ManualClock {
        fn at(time: DateTime<Utc>) -> Self {
            Self(Arc::new(Mutex::new(time)))
        }

        fn set(&self, time: DateTime<Utc>) {
            *self.0.lock() = time;
        }

        fn advance(&self, delta: TimeDelta) {
            let mut now = self.0.lock();
            *now += delta;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock()
        }
    }

    /// In-memory provider that counts calls and can be told to fail per id.
    #[derive(Clone, Default)]
    struct FakeProvider {
        videos: Arc<Mutex<HashMap<String, ProviderVideo>>>,
        failing: Arc<Mutex<HashSet<String>>>,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl FakeProvider {
        fn put(&self, id: &str, video: ProviderVideo) {
            self.videos.lock().insert(id.to_owned(), video);
        }

        fn remove(&self, id: &str) {
            self.videos.lock().remove(id);
        }

        fn fail(&self, id: &str) {
            self.failing.lock().insert(id.to_owned());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    impl MetadataProvider for FakeProvider {
        fn fetch_by_id(&self, id: &str) -> Result<Option<ProviderVideo>, ProviderError> {
            self.calls.lock().push(id.to_owned());
            if self.failing.lock().contains(id) {
                return Err(ProviderError::Transport("connection reset".into()));
            }
            Ok(self.videos.lock().get(id).cloned())
        }
    }

    /// Runs `during_fetch` while the provider call is in flight.
    struct InterleavingProvider<F> {
        inner: FakeProvider,
        during_fetch: F,
    }

    impl<F: Fn()> MetadataProvider for InterleavingProvider<F> {
        fn fetch_by_id(&self, id: &str) -> Result<Option<ProviderVideo>, ProviderError> {
            (self.during_fetch)();
            self.inner.fetch_by_id(id)
        }
    }

    type TestCache = MetadataCache<MetadataStore, FakeProvider, ManualClock>;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn provider_video(title: &str, views: u64) -> ProviderVideo {
        ProviderVideo {
            title: title.to_owned(),
            description: format!("{title} description"),
            thumbnail_url: "https://i.ytimg.com/vi/x/hqdefault.jpg".into(),
            duration_raw: "PT3M".into(),
            channel_id: "UC1".into(),
            channel_title: "Channel One".into(),
            view_count: views,
            published_at: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    fn setup() -> (TestCache, FakeProvider, ManualClock) {
        let provider = FakeProvider::default();
        let clock = ManualClock::at(t0());
        let store = MetadataStore::open_in_memory().unwrap();
        let cache = MetadataCache::with_clock(store, provider.clone(), clock.clone());
        (cache, provider, clock)
    }

    fn no_spacing() -> RefreshPolicy {
        RefreshPolicy {
            spacing: Duration::ZERO,
            ..RefreshPolicy::default()
        }
    }

    #[test]
    fn miss_fetches_and_stores_record() {
        let (cache, provider, _) = setup();
        provider.put("abc123", provider_video("Test Video", 42));

        let cached = cache.get_or_fetch("abc123", None, None).unwrap();
        assert!(cached.created);
        assert_eq!(cached.video.title, "Test Video");
        assert_eq!(cached.video.view_count, 42);
        assert_eq!(cached.video.last_accessed, cached.video.last_updated);
        assert_eq!(cached.video.last_accessed, t0());
        assert_eq!(cached.video.category, DEFAULT_CATEGORY);
        assert_eq!(cached.video.sort_hint, DEFAULT_SORT_HINT);

        let stored = cache.store().find_one("abc123").unwrap().unwrap();
        assert_eq!(stored, cached.video);
    }

    #[test]
    fn hit_bumps_access_time_without_provider_call() {
        let (cache, provider, clock) = setup();
        provider.put("abc123", provider_video("Test Video", 42));
        cache.get_or_fetch("abc123", Some("music"), None).unwrap();

        clock.advance(TimeDelta::hours(48));
        provider.put("abc123", provider_video("Renamed", 99));
        let cached = cache.get_or_fetch("abc123", Some("gaming"), None).unwrap();

        assert!(!cached.created);
        assert_eq!(provider.calls(), ["abc123"]);
        assert_eq!(cached.video.title, "Test Video");
        assert_eq!(cached.video.category, "music");
        assert_eq!(cached.video.last_accessed, t0() + TimeDelta::hours(48));
        assert_eq!(cached.video.last_updated, t0());
    }

    #[test]
    fn fetch_then_get_returns_same_provider_fields() {
        let (cache, provider, clock) = setup();
        provider.put("abc123", provider_video("Test Video", 42));
        let created = cache.get_or_fetch("abc123", Some("music"), Some("trending")).unwrap();

        clock.advance(TimeDelta::seconds(5));
        let fetched = cache.get_by_id("abc123").unwrap();

        assert_eq!(fetched.title, created.video.title);
        assert_eq!(fetched.description, created.video.description);
        assert_eq!(fetched.thumbnail_url, created.video.thumbnail_url);
        assert_eq!(fetched.duration_raw, created.video.duration_raw);
        assert_eq!(fetched.channel_id, created.video.channel_id);
        assert_eq!(fetched.channel_title, created.video.channel_title);
        assert_eq!(fetched.view_count, created.video.view_count);
        assert_eq!(fetched.published_at, created.video.published_at);
        assert_eq!(fetched.sort_hint, "trending");
    }

    #[test]
    fn empty_description_gets_placeholder_on_insert() {
        let (cache, provider, _) = setup();
        let mut video = provider_video("Quiet", 1);
        video.description.clear();
        provider.put("quiet", video);

        let cached = cache.get_or_fetch("quiet", None, None).unwrap();
        assert_eq!(cached.video.description, MISSING_DESCRIPTION);
    }

    #[test]
    fn unknown_upstream_id_is_not_found_and_not_stored() {
        let (cache, _, _) = setup();
        let err = cache.get_or_fetch("nope", None, None).unwrap_err();
        assert!(matches!(err, CacheError::NotFoundUpstream(ref id) if id == "nope"));
        assert!(cache.store().find_one("nope").unwrap().is_none());
    }

    #[test]
    fn provider_failure_creates_nothing() {
        let (cache, provider, _) = setup();
        provider.put("flaky", provider_video("Flaky", 1));
        provider.fail("flaky");

        let err = cache.get_or_fetch("flaky", None, None).unwrap_err();
        assert!(matches!(err, CacheError::Provider(_)));
        assert!(cache.store().find_one("flaky").unwrap().is_none());
    }

    #[test]
    fn blank_ids_are_rejected() {
        let (cache, provider, _) = setup();
        assert!(matches!(
            cache.get_or_fetch("  ", None, None),
            Err(CacheError::Validation(_))
        ));
        assert!(matches!(cache.get_by_id(""), Err(CacheError::Validation(_))));
        assert!(matches!(cache.refresh(""), Err(CacheError::Validation(_))));
        assert!(provider.calls().is_empty());
    }

    #[test]
    fn get_by_id_of_unknown_video_is_not_cached() {
        let (cache, provider, _) = setup();
        assert!(matches!(
            cache.get_by_id("abc123"),
            Err(CacheError::NotCached(_))
        ));
        assert!(provider.calls().is_empty());
    }

    #[test]
    fn last_accessed_never_moves_backwards() {
        let (cache, provider, clock) = setup();
        provider.put("abc123", provider_video("Test Video", 42));
        cache.get_or_fetch("abc123", None, None).unwrap();

        clock.advance(TimeDelta::minutes(1));
        let first = cache.get_by_id("abc123").unwrap().last_accessed;
        let second = cache.get_by_id("abc123").unwrap().last_accessed;
        assert!(second >= first);

        clock.set(t0() - TimeDelta::hours(1));
        let third = cache.get_by_id("abc123").unwrap().last_accessed;
        assert_eq!(third, second);
    }

    #[test]
    fn refresh_overwrites_provider_fields_only() {
        let (cache, provider, clock) = setup();
        provider.put("abc123", provider_video("Test Video", 42));
        cache.get_or_fetch("abc123", Some("music"), Some("title")).unwrap();

        clock.advance(TimeDelta::hours(30));
        provider.put("abc123", provider_video("New Title", 1_000));
        let outcome = cache.refresh("abc123").unwrap();

        let RefreshOutcome::Refreshed(video) = outcome else {
            panic!("expected refresh");
        };
        assert_eq!(video.title, "New Title");
        assert_eq!(video.view_count, 1_000);
        assert_eq!(video.category, "music");
        assert_eq!(video.sort_hint, "title");
        assert_eq!(video.last_updated, t0() + TimeDelta::hours(30));
        assert_eq!(video.last_accessed, t0());
        assert_eq!(cache.store().find_one("abc123").unwrap().unwrap(), video);
    }

    #[test]
    fn access_during_refresh_is_not_lost() {
        let store = Arc::new(MetadataStore::open_in_memory().unwrap());
        let provider = FakeProvider::default();
        provider.put("abc", provider_video("Before", 1));

        let reader_clock = ManualClock::at(t0());
        let reader = MetadataCache::with_clock(store.clone(), provider.clone(), reader_clock.clone());
        reader.get_or_fetch("abc", None, None).unwrap();

        reader_clock.set(t0() + TimeDelta::hours(1));
        provider.put("abc", provider_video("After", 2));
        let refresher = MetadataCache::with_clock(
            store.clone(),
            InterleavingProvider {
                inner: provider.clone(),
                during_fetch: move || {
                    reader.get_by_id("abc").unwrap();
                },
            },
            ManualClock::at(t0() + TimeDelta::hours(2)),
        );

        let RefreshOutcome::Refreshed(video) = refresher.refresh("abc").unwrap() else {
            panic!("expected refresh");
        };
        assert_eq!(video.title, "After");
        assert_eq!(video.last_updated, t0() + TimeDelta::hours(2));
        assert_eq!(video.last_accessed, t0() + TimeDelta::hours(1));
        assert_eq!(store.find_one("abc").unwrap().unwrap(), video);
    }

    #[test]
    fn access_with_stale_snapshot_keeps_refreshed_fields() {
        let (cache, provider, clock) = setup();
        provider.put("abc123", provider_video("Test Video", 42));
        let snapshot = cache.get_or_fetch("abc123", None, None).unwrap().video;

        clock.advance(TimeDelta::hours(1));
        provider.put("abc123", provider_video("New Title", 7));
        cache.refresh("abc123").unwrap();

        clock.advance(TimeDelta::minutes(1));
        let mut stale = snapshot.clone();
        cache.touch(&mut stale).unwrap();

        let stored = cache.store().find_one("abc123").unwrap().unwrap();
        assert_eq!(stored.title, "New Title");
        assert_eq!(stored.view_count, 7);
        assert_eq!(stored.last_updated, t0() + TimeDelta::hours(1));
        assert_eq!(stored.last_accessed, t0() + TimeDelta::minutes(61));
    }

    #[test]
    fn refresh_is_idempotent_apart_from_last_updated() {
        let (cache, provider, clock) = setup();
        provider.put("abc123", provider_video("Test Video", 42));
        cache.get_or_fetch("abc123", None, None).unwrap();

        clock.advance(TimeDelta::hours(1));
        cache.refresh("abc123").unwrap();
        let first = cache.store().find_one("abc123").unwrap().unwrap();

        clock.advance(TimeDelta::hours(1));
        cache.refresh("abc123").unwrap();
        let mut second = cache.store().find_one("abc123").unwrap().unwrap();

        assert!(second.last_updated > first.last_updated);
        second.last_updated = first.last_updated;
        assert_eq!(second, first);
    }

    #[test]
    fn refresh_of_video_missing_upstream_keeps_record() {
        let (cache, provider, clock) = setup();
        provider.put("missing-id", provider_video("Soon Gone", 5));
        let original = cache.get_or_fetch("missing-id", None, None).unwrap().video;

        provider.remove("missing-id");
        clock.advance(TimeDelta::days(3));
        let outcome = cache.refresh("missing-id").unwrap();

        assert_eq!(outcome, RefreshOutcome::MissingUpstream(original.clone()));
        assert_eq!(cache.store().find_one("missing-id").unwrap().unwrap(), original);
    }

    #[test]
    fn refresh_of_uncached_video_is_not_cached() {
        let (cache, provider, _) = setup();
        provider.put("abc123", provider_video("Test Video", 42));
        assert!(matches!(
            cache.refresh("abc123"),
            Err(CacheError::NotCached(_))
        ));
        assert!(provider.calls().is_empty());
    }

    #[test]
    fn list_trending_orders_by_views_then_recent_access() {
        let (cache, provider, clock) = setup();
        for (id, views) in [("low", 1), ("tie-old", 50), ("tie-new", 50), ("top", 500)] {
            provider.put(id, provider_video(id, views));
            cache.get_or_fetch(id, None, None).unwrap();
            clock.advance(TimeDelta::minutes(1));
        }
        cache.get_by_id("tie-new").unwrap();

        let page = cache
            .list_cached(&CacheFilter::default(), SortMode::Trending, 1, 10)
            .unwrap();
        let ids: Vec<_> = page
            .videos
            .iter()
            .map(|v| v.external_id.as_deref().unwrap())
            .collect();
        assert_eq!(ids, ["top", "tie-new", "tie-old", "low"]);

        for pair in page.videos.windows(2) {
            assert!(pair[0].view_count >= pair[1].view_count);
            if pair[0].view_count == pair[1].view_count {
                assert!(pair[0].last_accessed >= pair[1].last_accessed);
            }
        }
    }

    #[test]
    fn list_does_not_touch_access_times() {
        let (cache, provider, clock) = setup();
        provider.put("abc123", provider_video("Test Video", 42));
        cache.get_or_fetch("abc123", None, None).unwrap();

        clock.advance(TimeDelta::hours(1));
        let page = cache
            .list_cached(&CacheFilter::default(), SortMode::Default, 1, 10)
            .unwrap();
        assert_eq!(page.videos[0].last_accessed, t0());
    }

    #[test]
    fn list_paginates_with_category_filter() {
        let (cache, provider, _) = setup();
        for i in 0..5 {
            let id = format!("music-{i}");
            provider.put(&id, provider_video(&id, i));
            cache.get_or_fetch(&id, Some("music"), None).unwrap();
        }
        provider.put("game", provider_video("game", 9));
        cache.get_or_fetch("game", Some("gaming"), None).unwrap();

        let filter = CacheFilter::category("music");
        let first = cache.list_cached(&filter, SortMode::Trending, 1, 2).unwrap();
        assert_eq!(first.total, 5);
        assert_eq!(first.total_pages, 3);
        assert_eq!(first.current_page, 1);
        assert_eq!(first.videos.len(), 2);

        let last = cache.list_cached(&filter, SortMode::Trending, 3, 2).unwrap();
        assert_eq!(last.videos.len(), 1);
        assert_eq!(last.videos[0].external_id.as_deref(), Some("music-0"));

        let beyond = cache.list_cached(&filter, SortMode::Trending, 9, 2).unwrap();
        assert!(beyond.videos.is_empty());
        assert_eq!(beyond.total_pages, 3);
    }

    #[test]
    fn list_rejects_bad_paging() {
        let (cache, _, _) = setup();
        let filter = CacheFilter::default();
        assert!(matches!(
            cache.list_cached(&filter, SortMode::Date, 0, 10),
            Err(CacheError::Validation(_))
        ));
        assert!(matches!(
            cache.list_cached(&filter, SortMode::Date, 1, 0),
            Err(CacheError::Validation(_))
        ));
    }

    #[test]
    fn empty_cache_lists_zero_pages() {
        let (cache, _, _) = setup();
        let page = cache
            .list_cached(&CacheFilter::default(), SortMode::Title, 1, 10)
            .unwrap();
        assert!(page.videos.is_empty());
        assert_eq!(page.total_pages, 0);
    }

    #[test]
    fn refresh_stale_only_touches_stale_records() {
        let (cache, provider, clock) = setup();
        provider.put("old", provider_video("Old", 1));
        cache.get_or_fetch("old", None, None).unwrap();

        clock.advance(TimeDelta::hours(20));
        provider.put("recent", provider_video("Recent", 1));
        cache.get_or_fetch("recent", None, None).unwrap();

        clock.advance(TimeDelta::hours(5));
        provider.put("old", provider_video("Old v2", 2));
        provider.put("recent", provider_video("Recent v2", 2));

        let now = cache.now();
        let report = cache.refresh_stale(now, &no_spacing()).unwrap();
        assert_eq!(report.selected, 1);
        assert_eq!(report.refreshed, 1);

        let old = cache.store().find_one("old").unwrap().unwrap();
        assert_eq!(old.title, "Old v2");
        assert_eq!(old.last_updated, now);

        let recent = cache.store().find_one("recent").unwrap().unwrap();
        assert_eq!(recent.title, "Recent");
        assert_eq!(recent.last_updated, t0() + TimeDelta::hours(20));
    }

    #[test]
    fn refresh_stale_requires_strictly_older_than_threshold() {
        let (cache, provider, clock) = setup();
        provider.put("edge", provider_video("Edge", 1));
        cache.get_or_fetch("edge", None, None).unwrap();

        clock.advance(TimeDelta::hours(24));
        let report = cache.refresh_stale(cache.now(), &no_spacing()).unwrap();
        assert_eq!(report.selected, 0);
        assert_eq!(provider.calls(), ["edge"]);
    }

    #[test]
    fn refresh_stale_continues_past_failures() {
        let (cache, provider, clock) = setup();
        for id in ["one", "two", "three"] {
            provider.put(id, provider_video(id, 1));
            cache.get_or_fetch(id, None, None).unwrap();
            clock.advance(TimeDelta::seconds(1));
        }
        let before = cache.store().find_one("two").unwrap().unwrap();

        clock.advance(TimeDelta::days(2));
        for id in ["one", "two", "three"] {
            provider.put(id, provider_video(&format!("{id} v2"), 2));
        }
        provider.fail("two");

        let report = cache.refresh_stale(cache.now(), &no_spacing()).unwrap();
        assert_eq!(report.selected, 3);
        assert_eq!(report.refreshed, 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].external_id, "two");

        assert_eq!(cache.store().find_one("one").unwrap().unwrap().title, "one v2");
        assert_eq!(cache.store().find_one("three").unwrap().unwrap().title, "three v2");
        let after = cache.store().find_one("two").unwrap().unwrap();
        assert_eq!(after.last_updated, before.last_updated);
        assert_eq!(after.title, "two");
    }

    #[test]
    fn refresh_stale_counts_missing_upstream_and_respects_limit() {
        let (cache, provider, clock) = setup();
        for id in ["a", "b", "c"] {
            provider.put(id, provider_video(id, 1));
            cache.get_or_fetch(id, None, None).unwrap();
            clock.advance(TimeDelta::seconds(1));
        }
        provider.remove("a");
        clock.advance(TimeDelta::days(2));

        let policy = RefreshPolicy {
            batch_limit: 2,
            ..no_spacing()
        };
        let report = cache.refresh_stale(cache.now(), &policy).unwrap();
        assert_eq!(report.selected, 2);
        assert_eq!(report.missing_upstream, 1);
        assert_eq!(report.refreshed, 1);
        assert_eq!(&provider.calls()[3..], ["a", "b"]);
    }

    #[test]
    fn refresh_stale_spaces_provider_calls() {
        let (cache, provider, clock) = setup();
        for id in ["a", "b", "c"] {
            provider.put(id, provider_video(id, 1));
            cache.get_or_fetch(id, None, None).unwrap();
        }
        clock.advance(TimeDelta::days(2));

        let policy = RefreshPolicy {
            spacing: Duration::from_millis(30),
            ..RefreshPolicy::default()
        };
        let started = Instant::now();
        let report = cache.refresh_stale(cache.now(), &policy).unwrap();
        assert_eq!(report.refreshed, 3);
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn refresh_stale_rejects_out_of_range_threshold() {
        let (cache, provider, _) = setup();
        provider.put("abc123", provider_video("Test Video", 42));
        cache.get_or_fetch("abc123", None, None).unwrap();

        for threshold in [TimeDelta::MAX, TimeDelta::zero(), TimeDelta::hours(-5)] {
            let policy = RefreshPolicy {
                threshold,
                ..no_spacing()
            };
            assert!(matches!(
                cache.refresh_stale(cache.now(), &policy),
                Err(CacheError::Validation(_))
            ));
        }
        assert_eq!(provider.calls(), ["abc123"]);
    }

    #[test]
    fn threshold_hours_must_be_in_range() {
        assert_eq!(
            RefreshPolicy::threshold_from_hours(24).unwrap(),
            TimeDelta::hours(24)
        );
        assert!(RefreshPolicy::threshold_from_hours(MAX_STALE_AFTER_HOURS).is_ok());
        assert!(RefreshPolicy::threshold_from_hours(0).is_err());
        assert!(RefreshPolicy::threshold_from_hours(-1).is_err());
        assert!(RefreshPolicy::threshold_from_hours(100_000_000_000).is_err());
    }

    #[test]
    fn default_policy_matches_daily_job() {
        let policy = RefreshPolicy::default();
        assert_eq!(policy.threshold, TimeDelta::hours(24));
        assert_eq!(policy.batch_limit, 50);
        assert_eq!(policy.spacing, Duration::from_millis(200));
    }
}
