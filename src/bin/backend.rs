#![forbid(unsafe_code)]

//! JSON API over the metadata cache. Also hosts the daily stale-record
//! refresh when `ENABLE_VIDEO_CACHE_CRON` is set.

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use clap::Parser;
use newtube_cache::{
    cache::{CachedPage, MetadataCache, RefreshOutcome},
    config::{DEFAULT_CONFIG_PATH, load_settings_from},
    error::CacheError,
    logging,
    metadata::{CacheFilter, CachedVideo, MetadataStore, SortMode},
    provider::YouTubeClient,
    scheduler,
    security::ensure_not_root,
};
use serde::{Deserialize, Serialize};
use tokio::{signal, task};
use tracing::{error, info};

const DEFAULT_PAGE_SIZE: u64 = 10;

type Cache = MetadataCache<MetadataStore, YouTubeClient>;

#[derive(Parser, Debug)]
#[command(author, version, about = "Serve the cached YouTube metadata API.")]
struct Cli {
    #[arg(long = "config", value_name = "PATH", default_value = DEFAULT_CONFIG_PATH, help = "Path to the env-style config file")]
    config: PathBuf,
    #[arg(long = "host", value_name = "ADDR", help = "Override NEWTUBE_HOST")]
    host: Option<String>,
    #[arg(long = "port", value_name = "PORT", help = "Override NEWTUBE_PORT")]
    port: Option<u16>,
}

#[derive(Clone)]
struct AppState {
    cache: Arc<Cache>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<CacheError> for ApiError {
    fn from(err: CacheError) -> Self {
        let status = match &err {
            _ if err.is_not_found() => StatusCode::NOT_FOUND,
            CacheError::Validation(_) => StatusCode::BAD_REQUEST,
            CacheError::Provider(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %err, "cache request failed");
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheRequest {
    #[serde(default)]
    youtube_id: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    sort: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    category: Option<String>,
    sort: Option<String>,
    page: Option<u64>,
    limit: Option<u64>,
}

#[derive(Debug, Serialize)]
struct VideoResponse {
    message: &'static str,
    video: CachedVideo,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init("backend");
    let cli = Cli::parse();
    ensure_not_root("backend")?;

    let settings =
        load_settings_from(&cli.config, std::env::vars()).context("loading configuration")?;
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
    let cache = Arc::new(MetadataCache::new(store, provider));

    if settings.cron_enabled {
        let _refresh_task =
            scheduler::spawn_daily_refresh(settings.refresh_at, cache.clone(), settings.refresh.clone());
    }

    let app = router(AppState { cache });

    let host = cli.host.unwrap_or(settings.newtube_host);
    let port = cli.port.unwrap_or(settings.newtube_port);
    let addr = SocketAddr::new(
        host.parse()
            .with_context(|| format!("parsing listen address {host}"))?,
        port,
    );
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!(%addr, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/videos/youtube/cache", post(cache_video))
        .route("/api/videos/youtube/cached", get(list_cached))
        .route("/api/videos/youtube/cached/{youtube_id}", get(get_cached))
        .route("/api/videos/youtube/refresh/{youtube_id}", post(refresh_cached))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!(error = %err, "failed to install Ctrl+C handler");
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn cache_video(
    State(state): State<AppState>,
    Json(request): Json<CacheRequest>,
) -> ApiResult<(StatusCode, Json<VideoResponse>)> {
    let cached = state
        .run(move |cache| {
            cache.get_or_fetch(
                request.youtube_id.as_deref().unwrap_or_default(),
                request.category.as_deref(),
                request.sort.as_deref(),
            )
        })
        .await?;

    let (status, message) = if cached.created {
        (StatusCode::CREATED, "Video cached successfully")
    } else {
        (StatusCode::OK, "Video already cached")
    };
    Ok((
        status,
        Json(VideoResponse {
            message,
            video: cached.video,
        }),
    ))
}

async fn list_cached(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<CachedPage>> {
    let filter = CacheFilter {
        category: query.category.filter(|c| !c.trim().is_empty()),
    };
    let sort = SortMode::parse(query.sort.as_deref());
    let page = query.page.unwrap_or(1);
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE);

    let page = state
        .run(move |cache| cache.list_cached(&filter, sort, page, limit))
        .await?;
    Ok(Json(page))
}

async fn get_cached(
    State(state): State<AppState>,
    AxumPath(youtube_id): AxumPath<String>,
) -> ApiResult<Json<CachedVideo>> {
    let video = state.run(move |cache| cache.get_by_id(&youtube_id)).await?;
    Ok(Json(video))
}

async fn refresh_cached(
    State(state): State<AppState>,
    AxumPath(youtube_id): AxumPath<String>,
) -> ApiResult<Json<VideoResponse>> {
    let id = youtube_id.clone();
    let outcome = state.run(move |cache| cache.refresh(&id)).await?;

    match outcome {
        RefreshOutcome::Refreshed(video) => Ok(Json(VideoResponse {
            message: "Video data refreshed successfully",
            video,
        })),
        RefreshOutcome::MissingUpstream(_) => {
            Err(CacheError::NotFoundUpstream(youtube_id).into())
        }
    }
}

impl AppState {
    /// Runs a blocking cache operation on the blocking pool; every cache call
    /// touches SQLite and possibly the network.
    async fn run<T, F>(&self, op: F) -> ApiResult<T>
    where
        F: FnOnce(&Cache) -> Result<T, CacheError> + Send + 'static,
        T: Send + 'static,
    {
        let cache = self.cache.clone();
        task::spawn_blocking(move || op(&cache))
            .await
            .map_err(|err| ApiError::internal(format!("task join error: {err}")))?
            .map_err(ApiError::from)
    }
}
