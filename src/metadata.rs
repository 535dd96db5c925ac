//! Metadata persistence layer for the video cache.
//!
//! `CachedVideo` mirrors both the SQLite row and the JSON exposed by the API.
//! Timestamps live in INTEGER columns as UTC milliseconds so ordering and the
//! staleness predicate are plain integer comparisons.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;

use crate::provider::ProviderVideo;

/// Single cached video. `external_id` is the YouTube id; it is absent only for
/// videos that were uploaded natively rather than mirrored from YouTube.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedVideo {
    pub id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    pub title: String,
    pub description: String,
    pub thumbnail_url: String,
    /// ISO-8601 duration exactly as the provider reports it (e.g. `PT4M13S`).
    pub duration_raw: String,
    pub channel_id: String,
    pub channel_title: String,
    pub view_count: u64,
    pub published_at: DateTime<Utc>,
    pub category: String,
    pub sort_hint: String,
    pub last_accessed: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

/// Ordering applied by [`VideoStore::find`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortMode {
    Trending,
    Date,
    /// There is no rating signal upstream, so this orders by view count
    /// exactly like `Trending`.
    Rating,
    Title,
    #[default]
    Default,
}

impl SortMode {
    /// Lenient parse for query strings: unknown or missing values fall back to
    /// `Default`, and `newest` is accepted as an alias for `Date`.
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("trending") => SortMode::Trending,
            Some("date") | Some("newest") => SortMode::Date,
            Some("rating") => SortMode::Rating,
            Some("title") => SortMode::Title,
            _ => SortMode::Default,
        }
    }

    /// Full ORDER BY clause. Every mode falls back to `last_accessed DESC` so
    /// recently touched records surface first among ties, then to the row id
    /// so pages never overlap.
    fn order_clause(self) -> &'static str {
        match self {
            SortMode::Trending | SortMode::Rating => {
                "view_count DESC, last_accessed DESC, id DESC"
            }
            SortMode::Date | SortMode::Default => "published_at DESC, last_accessed DESC, id DESC",
            SortMode::Title => "title ASC, last_accessed DESC, id DESC",
        }
    }
}

/// Row filter for listing and counting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheFilter {
    pub category: Option<String>,
}

impl CacheFilter {
    pub fn category(category: impl Into<String>) -> Self {
        Self {
            category: Some(category.into()),
        }
    }
}

/// Document-store contract the cache relies on. No transactions are assumed
/// across calls. Updates only write the columns they own, so an access bump
/// and a provider refresh racing on the same record never undo each other.
pub trait VideoStore {
    fn find_one(&self, external_id: &str) -> Result<Option<CachedVideo>>;

    /// Persists a new record and returns it with the store-assigned id. An
    /// existing row with the same `external_id` is overwritten.
    fn insert(&self, video: CachedVideo) -> Result<CachedVideo>;

    /// Raises `last_accessed` of record `id` to `at` unless it is already
    /// later, and returns the stored value.
    fn touch(&self, id: i64, at: DateTime<Utc>) -> Result<DateTime<Utc>>;

    /// Overwrites the provider-sourced columns and `last_updated` of record
    /// `id`, leaving access time, category and sort hint alone. Returns the
    /// updated record.
    fn apply_refresh(
        &self,
        id: i64,
        fetched: &ProviderVideo,
        updated_at: DateTime<Utc>,
    ) -> Result<CachedVideo>;

    fn find(
        &self,
        filter: &CacheFilter,
        sort: SortMode,
        skip: u64,
        limit: u64,
    ) -> Result<Vec<CachedVideo>>;

    fn count(&self, filter: &CacheFilter) -> Result<u64>;

    /// Records with an external id whose `last_updated` is strictly before
    /// `updated_before`, oldest first.
    fn find_stale(&self, updated_before: DateTime<Utc>, limit: usize) -> Result<Vec<CachedVideo>>;
}

const VIDEO_COLUMNS: &str = r#"
    id, external_id, title, description, thumbnail_url, duration_raw,
    channel_id, channel_title, view_count, published_at, category, sort_hint,
    last_accessed, last_updated
"#;

/// SQLite-backed [`VideoStore`]. The connection sits behind a mutex so one
/// store can be shared by the API handlers and the scheduled refresh.
#[derive(Debug)]
pub struct MetadataStore {
    conn: Mutex<Connection>,
}

impl MetadataStore {
    /// Opens (and if necessary creates) the SQLite DB and ensures the expected
    /// schema exists. WAL mode is enabled to avoid readers blocking writers.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating metadata directory {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("opening metadata DB {}", path.display()))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .context("enabling WAL mode for metadata DB")?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .context("setting metadata DB synchronous mode")?;

        Self::with_connection(conn)
    }

    /// Private database that disappears with the store. Used by tests and
    /// dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory metadata DB")?;
        Self::with_connection(conn)
    }

    fn with_connection(mut conn: Connection) -> Result<Self> {
        ensure_tables(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

/// Runs the SQL required to create the table and its indexes. Wrapped in a
/// transaction so a failure leaves the DB untouched.
fn ensure_tables(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;

    tx.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS cached_videos (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            external_id TEXT UNIQUE,
            title TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            thumbnail_url TEXT NOT NULL DEFAULT '',
            duration_raw TEXT NOT NULL DEFAULT '',
            channel_id TEXT NOT NULL DEFAULT '',
            channel_title TEXT NOT NULL DEFAULT '',
            view_count INTEGER NOT NULL DEFAULT 0,
            published_at INTEGER NOT NULL,
            category TEXT NOT NULL DEFAULT 'uncategorized',
            sort_hint TEXT NOT NULL DEFAULT 'date',
            last_accessed INTEGER NOT NULL,
            last_updated INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_cached_videos_category ON cached_videos(category, sort_hint);
        CREATE INDEX IF NOT EXISTS idx_cached_videos_last_accessed ON cached_videos(last_accessed);
        CREATE INDEX IF NOT EXISTS idx_cached_videos_last_updated ON cached_videos(last_updated);
        "#,
    )
    .context("creating cached_videos schema")?;

    tx.commit()?;
    Ok(())
}

impl VideoStore for MetadataStore {
    fn find_one(&self, external_id: &str) -> Result<Option<CachedVideo>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {VIDEO_COLUMNS} FROM cached_videos WHERE external_id = ?1"
        ))?;

        let mut rows = stmt.query([external_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_video(row)?)),
            None => Ok(None),
        }
    }

    fn insert(&self, mut video: CachedVideo) -> Result<CachedVideo> {
        let conn = self.conn.lock();
        let id: i64 = conn
            .query_row(
                r#"
                INSERT INTO cached_videos (
                    external_id, title, description, thumbnail_url, duration_raw,
                    channel_id, channel_title, view_count, published_at, category,
                    sort_hint, last_accessed, last_updated
                ) VALUES (
                    ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13
                )
                ON CONFLICT(external_id) DO UPDATE SET
                    title = excluded.title,
                    description = excluded.description,
                    thumbnail_url = excluded.thumbnail_url,
                    duration_raw = excluded.duration_raw,
                    channel_id = excluded.channel_id,
                    channel_title = excluded.channel_title,
                    view_count = excluded.view_count,
                    published_at = excluded.published_at,
                    category = excluded.category,
                    sort_hint = excluded.sort_hint,
                    last_accessed = excluded.last_accessed,
                    last_updated = excluded.last_updated
                RETURNING id
                "#,
                params![
                    video.external_id,
                    video.title,
                    video.description,
                    video.thumbnail_url,
                    video.duration_raw,
                    video.channel_id,
                    video.channel_title,
                    count_to_sql(video.view_count),
                    video.published_at.timestamp_millis(),
                    video.category,
                    video.sort_hint,
                    video.last_accessed.timestamp_millis(),
                    video.last_updated.timestamp_millis(),
                ],
                |row| row.get(0),
            )
            .with_context(|| format!("inserting cached video {:?}", video.external_id))?;

        video.id = id;
        Ok(video)
    }

    fn touch(&self, id: i64, at: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let conn = self.conn.lock();
        let stored: Option<i64> = conn
            .query_row(
                r#"
                UPDATE cached_videos
                SET last_accessed = MAX(last_accessed, ?2)
                WHERE id = ?1
                RETURNING last_accessed
                "#,
                params![id, at.timestamp_millis()],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("touching cached video {id}"))?;

        let millis = stored.ok_or_else(|| anyhow!("cached video {id} no longer exists"))?;
        millis_to_datetime(millis, "last_accessed")
    }

    fn apply_refresh(
        &self,
        id: i64,
        fetched: &ProviderVideo,
        updated_at: DateTime<Utc>,
    ) -> Result<CachedVideo> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            r#"
            UPDATE cached_videos SET
                title = ?2,
                description = ?3,
                thumbnail_url = ?4,
                duration_raw = ?5,
                channel_id = ?6,
                channel_title = ?7,
                view_count = ?8,
                published_at = ?9,
                last_updated = ?10
            WHERE id = ?1
            RETURNING {VIDEO_COLUMNS}
            "#
        ))?;

        let mut rows = stmt
            .query(params![
                id,
                fetched.title,
                fetched.description,
                fetched.thumbnail_url,
                fetched.duration_raw,
                fetched.channel_id,
                fetched.channel_title,
                count_to_sql(fetched.view_count),
                fetched.published_at.timestamp_millis(),
                updated_at.timestamp_millis(),
            ])
            .with_context(|| format!("refreshing cached video {id}"))?;
        match rows.next()? {
            Some(row) => row_to_video(row),
            None => Err(anyhow!("cached video {id} no longer exists")),
        }
    }

    fn find(
        &self,
        filter: &CacheFilter,
        sort: SortMode,
        skip: u64,
        limit: u64,
    ) -> Result<Vec<CachedVideo>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {VIDEO_COLUMNS}
            FROM cached_videos
            WHERE (?1 IS NULL OR category = ?1)
            ORDER BY {order}
            LIMIT ?2 OFFSET ?3
            "#,
            order = sort.order_clause(),
        ))?;

        let mut rows = stmt.query(params![
            filter.category,
            count_to_sql(limit),
            count_to_sql(skip),
        ])?;
        let mut videos = Vec::new();
        while let Some(row) = rows.next()? {
            videos.push(row_to_video(row)?);
        }
        Ok(videos)
    }

    fn count(&self, filter: &CacheFilter) -> Result<u64> {
        let conn = self.conn.lock();
        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM cached_videos WHERE (?1 IS NULL OR category = ?1)",
            params![filter.category],
            |row| row.get(0),
        )?;
        Ok(total.max(0) as u64)
    }

    fn find_stale(&self, updated_before: DateTime<Utc>, limit: usize) -> Result<Vec<CachedVideo>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {VIDEO_COLUMNS}
            FROM cached_videos
            WHERE external_id IS NOT NULL AND last_updated < ?1
            ORDER BY last_updated ASC, id ASC
            LIMIT ?2
            "#
        ))?;

        let mut rows = stmt.query(params![
            updated_before.timestamp_millis(),
            count_to_sql(limit as u64),
        ])?;
        let mut videos = Vec::new();
        while let Some(row) = rows.next()? {
            videos.push(row_to_video(row)?);
        }
        Ok(videos)
    }
}

/// Lets several caches, or a cache and a maintenance job, share one store.
impl<T: VideoStore + ?Sized> VideoStore for Arc<T> {
    fn find_one(&self, external_id: &str) -> Result<Option<CachedVideo>> {
        (**self).find_one(external_id)
    }

    fn insert(&self, video: CachedVideo) -> Result<CachedVideo> {
        (**self).insert(video)
    }

    fn touch(&self, id: i64, at: DateTime<Utc>) -> Result<DateTime<Utc>> {
        (**self).touch(id, at)
    }

    fn apply_refresh(
        &self,
        id: i64,
        fetched: &ProviderVideo,
        updated_at: DateTime<Utc>,
    ) -> Result<CachedVideo> {
        (**self).apply_refresh(id, fetched, updated_at)
    }

    fn find(
        &self,
        filter: &CacheFilter,
        sort: SortMode,
        skip: u64,
        limit: u64,
    ) -> Result<Vec<CachedVideo>> {
        (**self).find(filter, sort, skip, limit)
    }

    fn count(&self, filter: &CacheFilter) -> Result<u64> {
        (**self).count(filter)
    }

    fn find_stale(&self, updated_before: DateTime<Utc>, limit: usize) -> Result<Vec<CachedVideo>> {
        (**self).find_stale(updated_before, limit)
    }
}

/// SQLite integers are signed; counts above `i64::MAX` saturate.
fn count_to_sql(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn millis_to_datetime(millis: i64, column: &str) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| anyhow!("stored {column} timestamp {millis} is out of range"))
}

/// Converts a SQL row into a `CachedVideo`, turning millisecond columns back
/// into timestamps.
fn row_to_video(row: &Row<'_>) -> Result<CachedVideo> {
    let view_count: i64 = row.get("view_count")?;

    Ok(CachedVideo {
        id: row.get("id")?,
        external_id: row.get("external_id")?,
        title: row.get("title")?,
        description: row.get("description")?,
        thumbnail_url: row.get("thumbnail_url")?,
        duration_raw: row.get("duration_raw")?,
        channel_id: row.get("channel_id")?,
        channel_title: row.get("channel_title")?,
        view_count: view_count.max(0) as u64,
        published_at: millis_to_datetime(row.get("published_at")?, "published_at")?,
        category: row.get("category")?,
        sort_hint: row.get("sort_hint")?,
        last_accessed: millis_to_datetime(row.get("last_accessed")?, "last_accessed")?,
        last_updated: millis_to_datetime(row.get("last_updated")?, "last_updated")?,
    })
}
