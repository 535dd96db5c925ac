//! External metadata provider: the YouTube Data API v3.
//!
//! Only the `videos` endpoint is used, with the `snippet`, `contentDetails`
//! and `statistics` parts. The client is blocking (`ureq`) and every request
//! is bounded by the agent timeout, so a hung upstream surfaces as a
//! [`ProviderError::Transport`] instead of stalling the caller.

use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use serde::Deserialize;
use tracing::debug;

pub const DEFAULT_API_BASE: &str = "https://www.googleapis.com/youtube/v3";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const VIDEO_PARTS: &str = "snippet,contentDetails,statistics";

/// Longest upstream error body kept in an error message.
const MAX_ERROR_BODY: usize = 512;

/// Metadata for one video, already normalized from the provider payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderVideo {
    pub title: String,
    pub description: String,
    pub thumbnail_url: String,
    pub duration_raw: String,
    pub channel_id: String,
    pub channel_title: String,
    pub view_count: u64,
    pub published_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("YouTube API key is not configured")]
    MissingApiKey,

    #[error("rate limited or quota exhausted")]
    RateLimited,

    #[error("HTTP {0}: {1}")]
    Status(u16, String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ProviderError {
    /// Maps an HTTP error status and its body to a variant. YouTube reports
    /// quota exhaustion as a 403 with a `quotaExceeded` reason.
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            429 => ProviderError::RateLimited,
            403 if body.contains("quotaExceeded") || body.contains("rateLimitExceeded") => {
                ProviderError::RateLimited
            }
            _ => ProviderError::Status(status, truncate(body, MAX_ERROR_BODY)),
        }
    }
}

/// Source of truth for video metadata.
pub trait MetadataProvider {
    /// Returns `Ok(None)` when the provider knows no video with this id.
    fn fetch_by_id(&self, id: &str) -> Result<Option<ProviderVideo>, ProviderError>;
}

/// Blocking YouTube Data API client.
#[derive(Clone)]
pub struct YouTubeClient {
    agent: ureq::Agent,
    api_base: String,
    api_key: String,
}

impl YouTubeClient {
    pub fn new(
        api_key: impl Into<String>,
        api_base: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(ProviderError::MissingApiKey);
        }

        let agent = ureq::AgentBuilder::new()
            .timeout(timeout)
            .user_agent(concat!("newtube-cache/", env!("CARGO_PKG_VERSION")))
            .build();

        Ok(Self {
            agent,
            api_base: api_base.into().trim_end_matches('/').to_owned(),
            api_key,
        })
    }
}

impl MetadataProvider for YouTubeClient {
    fn fetch_by_id(&self, id: &str) -> Result<Option<ProviderVideo>, ProviderError> {
        let url = format!("{}/videos", self.api_base);
        debug!(video_id = id, "fetching video metadata from YouTube");

        let response = self
            .agent
            .get(&url)
            .query("part", VIDEO_PARTS)
            .query("id", id)
            .query("key", &self.api_key)
            .call();

        match response {
            Ok(response) => {
                let body = response
                    .into_string()
                    .map_err(|err| ProviderError::Transport(err.to_string()))?;
                decode_video_list(&body)
            }
            Err(ureq::Error::Status(status, response)) => {
                let body = response.into_string().unwrap_or_default();
                Err(ProviderError::from_status(status, &body))
            }
            Err(ureq::Error::Transport(err)) => Err(ProviderError::Transport(err.to_string())),
        }
    }
}

#[derive(Debug, Deserialize)]
struct VideoListResponse {
    #[serde(default)]
    items: Vec<VideoItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoItem {
    snippet: Snippet,
    #[serde(default)]
    content_details: ContentDetails,
    #[serde(default)]
    statistics: Statistics,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snippet {
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    channel_id: String,
    #[serde(default)]
    channel_title: String,
    published_at: String,
    #[serde(default)]
    thumbnails: Thumbnails,
}

#[derive(Debug, Default, Deserialize)]
struct Thumbnails {
    high: Option<Thumbnail>,
    default: Option<Thumbnail>,
}

#[derive(Debug, Deserialize)]
struct Thumbnail {
    url: String,
}

#[derive(Debug, Default, Deserialize)]
struct ContentDetails {
    #[serde(default)]
    duration: String,
}

/// YouTube encodes counters as decimal strings.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Statistics {
    view_count: Option<String>,
}

/// Decodes a `videos.list` body. Only the first item is considered; an empty
/// or missing `items` array means the id is unknown upstream.
pub fn decode_video_list(body: &str) -> Result<Option<ProviderVideo>, ProviderError> {
    let list: VideoListResponse =
        serde_json::from_str(body).map_err(|err| ProviderError::Malformed(err.to_string()))?;

    let Some(item) = list.items.into_iter().next() else {
        return Ok(None);
    };

    let published_at = DateTime::parse_from_rfc3339(&item.snippet.published_at)
        .map_err(|err| {
            ProviderError::Malformed(format!(
                "publishedAt {:?}: {err}",
                item.snippet.published_at
            ))
        })?
        .with_timezone(&Utc)
        .trunc_subsecs(3);

    let thumbnails = item.snippet.thumbnails;
    let thumbnail_url = thumbnails
        .high
        .or(thumbnails.default)
        .map(|thumb| thumb.url)
        .unwrap_or_default();

    let view_count = item
        .statistics
        .view_count
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .unwrap_or(0);

    Ok(Some(ProviderVideo {
        title: item.snippet.title,
        description: item.snippet.description,
        thumbnail_url,
        duration_raw: item.content_details.duration,
        channel_id: item.snippet.channel_id,
        channel_title: item.snippet.channel_title,
        view_count,
        published_at,
    }))
}

fn truncate(value: &str, max: usize) -> String {
    match value.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &value[..idx]),
        None => value.to_owned(),
    }
}
