use std::{
    collections::{HashMap, HashSet},
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use axum::{
    Json, Router,
    body::Body,
    extract::{Path as RoutePath, State},
    http::{
        HeaderMap, HeaderValue, Method, StatusCode,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, HOST},
    },
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{
    net::TcpListener,
    process::Command,
    sync::Mutex,
    time::{Duration, timeout},
};
use tokio_util::io::ReaderStream;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

#[derive(Clone)]
struct AppState {
    settings: Arc<Mutex<AppSettings>>,
    settings_paths: Arc<Vec<PathBuf>>,
    download_tokens: Arc<TokenCache>,
    release_cache: Arc<ReleaseCache>,
    release_repository: Option<String>,
    release_asset_name: String,
    http_client: reqwest::Client,
    default_download_dir: PathBuf,
}

const APP_NAME: &str = "VidGate";
const DEFAULT_DOWNLOAD_DIR: &str = "/tmp/downloads";
const FALLBACK_SETTINGS_FILE: &str = "/tmp/vidgate_settings.json";
const DEFAULT_TOKEN_TTL_SECONDS: i64 = 86_400;
const DEFAULT_RELEASE_CACHE_TTL_SECONDS: i64 = 600;
const DEFAULT_RELEASE_ASSET_NAME: &str = "VidGate-macos.zip";
const RELEASE_FETCH_TIMEOUT_SECONDS: u64 = 4;
const YT_DLP_TIMEOUT_SECONDS: u64 = 600;
const RESOLVE_MAX_ATTEMPTS: u32 = 60;
const RESOLVE_POLL_INTERVAL_MS: u64 = 500;
const STALE_FILE_MAX_AGE_SECONDS: u64 = 3_600;
const FILENAME_MAX_CHARS: usize = 120;
const FOLDER_PICKER_TIMEOUT_SECONDS: u64 = 30;
const YT_DLP_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";
const FOLDER_PICKER_SCRIPT: &str = "var app = Application.currentApplication(); app.includeStandardAdditions = true; app.chooseFolder().toString();";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Platform {
    Youtube,
    Tiktok,
    Instagram,
    Facebook,
}

impl Platform {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "youtube" => Some(Self::Youtube),
            "tiktok" => Some(Self::Tiktok),
            "instagram" => Some(Self::Instagram),
            "facebook" => Some(Self::Facebook),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Youtube => "youtube",
            Self::Tiktok => "tiktok",
            Self::Instagram => "instagram",
            Self::Facebook => "facebook",
        }
    }

    fn allowed_hosts(self) -> &'static [&'static str] {
        match self {
            Self::Youtube => &["www.youtube.com", "youtube.com", "youtu.be"],
            Self::Tiktok => &["www.tiktok.com", "tiktok.com", "vm.tiktok.com"],
            Self::Instagram => &["www.instagram.com", "instagram.com"],
            Self::Facebook => &[
                "www.facebook.com",
                "facebook.com",
                "fb.com",
                "fb.watch",
                "m.facebook.com",
            ],
        }
    }

    fn matches_url(self, input: &str) -> bool {
        let Ok(parsed) = Url::parse(input) else {
            return false;
        };

        if !matches!(parsed.scheme(), "http" | "https") {
            return false;
        }

        let Some(host) = parsed.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();

        self.allowed_hosts().iter().any(|allowed| host == *allowed)
    }

    fn is_primary(self) -> bool {
        matches!(self, Self::Youtube)
    }

    fn normalize_url(self, input: &str) -> String {
        match self {
            Self::Instagram => clean_instagram_url(input),
            _ => input.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DownloadRequest {
    url: Option<String>,
    platform: Option<String>,
    format: Option<String>,
    quality: Option<String>,
    filename: Option<String>,
}

#[derive(Debug, Serialize)]
struct DownloadResponse {
    success: bool,
    download_url: String,
    filename: String,
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VideoInfoRequest {
    url: Option<String>,
    platform: Option<String>,
}

#[derive(Debug, Serialize)]
struct VideoInfoData {
    id: Option<String>,
    title: Option<String>,
    duration: Option<f64>,
    upload_date: Option<String>,
    thumbnail: Option<String>,
    suggested_filename: String,
    available_formats: Vec<AvailableFormat>,
}

#[derive(Debug, Serialize)]
struct AvailableFormat {
    format_id: String,
    ext: String,
    resolution: Option<String>,
    file_size: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct SettingsUpdateRequest {
    download_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AppSettings {
    #[serde(default = "default_download_dir_setting")]
    download_dir: String,
}

fn default_download_dir_setting() -> String {
    DEFAULT_DOWNLOAD_DIR.to_string()
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct YtDlpProbe {
    id: Option<String>,
    title: Option<String>,
    duration: Option<f64>,
    upload_date: Option<String>,
    thumbnail: Option<String>,
    #[serde(default)]
    formats: Vec<YtDlpFormat>,
}

#[derive(Debug, Deserialize)]
struct YtDlpFormat {
    format_id: String,
    ext: Option<String>,
    resolution: Option<String>,
    filesize: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct YtDlpMedia {
    title: Option<String>,
    entries: Option<Vec<Option<YtDlpEntry>>>,
    #[serde(default)]
    requested_downloads: Vec<YtDlpArtifact>,
}

#[derive(Debug, Deserialize)]
struct YtDlpEntry {
    title: Option<String>,
    #[serde(default)]
    requested_downloads: Vec<YtDlpArtifact>,
}

#[derive(Debug, Deserialize)]
struct YtDlpArtifact {
    filepath: Option<String>,
}

#[derive(Debug, Clone)]
struct ResolvedFile {
    path: PathBuf,
    logical_name: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug)]
struct TokenCache {
    ttl_seconds: i64,
    entries: Mutex<HashMap<String, ResolvedFile>>,
}

impl TokenCache {
    fn new(ttl_seconds: i64) -> Self {
        Self {
            ttl_seconds,
            entries: Mutex::new(HashMap::new()),
        }
    }

    async fn register(&self, token: String, path: PathBuf, logical_name: String) {
        let record = ResolvedFile {
            path,
            logical_name,
            created_at: Utc::now(),
        };
        self.entries.lock().await.insert(token, record);
    }

    async fn resolve(&self, token: &str) -> Option<ResolvedFile> {
        let mut entries = self.entries.lock().await;
        let record = entries.get(token)?.clone();

        let expired = (Utc::now() - record.created_at).num_seconds() > self.ttl_seconds;
        let missing = !tokio::fs::try_exists(&record.path).await.unwrap_or(false);
        if expired || missing {
            entries.remove(token);
            return None;
        }

        Some(record)
    }
}

#[derive(Debug, Clone, Serialize)]
struct ReleaseInfo {
    tag_name: Option<String>,
    name: Option<String>,
    published_at: Option<String>,
    release_page_url: Option<String>,
    asset_name: Option<String>,
    asset_download_url: Option<String>,
    repository: String,
}

#[derive(Debug, Clone)]
struct CachedRelease {
    fetched_at: DateTime<Utc>,
    info: ReleaseInfo,
}

#[derive(Debug)]
struct ReleaseCache {
    ttl_seconds: i64,
    entry: Mutex<Option<CachedRelease>>,
}

impl ReleaseCache {
    fn new(ttl_seconds: i64) -> Self {
        Self {
            ttl_seconds,
            entry: Mutex::new(None),
        }
    }

    async fn fresh(&self, now: DateTime<Utc>) -> Option<ReleaseInfo> {
        let entry = self.entry.lock().await;
        entry
            .as_ref()
            .filter(|cached| (now - cached.fetched_at).num_seconds() < self.ttl_seconds)
            .map(|cached| cached.info.clone())
    }

    async fn store(&self, info: ReleaseInfo, fetched_at: DateTime<Utc>) {
        *self.entry.lock().await = Some(CachedRelease { fetched_at, info });
    }

    async fn last_known(&self) -> Option<ReleaseInfo> {
        self.entry
            .lock()
            .await
            .as_ref()
            .map(|cached| cached.info.clone())
    }
}

#[derive(Debug, Deserialize)]
struct GithubRelease {
    tag_name: Option<String>,
    name: Option<String>,
    published_at: Option<String>,
    html_url: Option<String>,
    #[serde(default)]
    assets: Vec<GithubAsset>,
}

#[derive(Debug, Deserialize)]
struct GithubAsset {
    name: Option<String>,
    browser_download_url: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "vidgate=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let root = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let data_dir = root.join("data");

    tokio::fs::create_dir_all(&data_dir).await.map_err(|error| {
        ApiError::internal(format!("Could not create the data directory: {error}"))
    })?;

    let settings_paths = vec![
        data_dir.join("settings.json"),
        PathBuf::from(FALLBACK_SETTINGS_FILE),
    ];
    let settings = load_settings(&settings_paths).await;

    let default_download_dir = PathBuf::from(DEFAULT_DOWNLOAD_DIR);
    tokio::fs::create_dir_all(&default_download_dir)
        .await
        .map_err(|error| {
            ApiError::internal(format!(
                "Could not create the default download directory: {error}"
            ))
        })?;

    let token_ttl_seconds = read_usize_env("DOWNLOAD_TOKEN_TTL_SECONDS")
        .filter(|value| *value > 0)
        .map(|value| value as i64)
        .unwrap_or(DEFAULT_TOKEN_TTL_SECONDS);
    let release_ttl_seconds = read_usize_env("RELEASE_CACHE_TTL_SECONDS")
        .map(|value| value as i64)
        .unwrap_or(DEFAULT_RELEASE_CACHE_TTL_SECONDS);

    let release_repository = std::env::var("RELEASE_REPOSITORY")
        .or_else(|_| std::env::var("GITHUB_REPOSITORY"))
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string));
    let release_asset_name = std::env::var("RELEASE_ASSET_NAME")
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
        .unwrap_or_else(|| DEFAULT_RELEASE_ASSET_NAME.to_string());

    let http_client = reqwest::Client::builder()
        .user_agent(format!("{APP_NAME}/{}", app_version()))
        .timeout(Duration::from_secs(RELEASE_FETCH_TIMEOUT_SECONDS))
        .build()
        .map_err(|error| ApiError::internal(format!("Could not create the HTTP client: {error}")))?;

    if release_repository.is_none() {
        info!("RELEASE_REPOSITORY is not configured. Release checks are disabled.");
    }

    let state = AppState {
        settings: Arc::new(Mutex::new(settings)),
        settings_paths: Arc::new(settings_paths),
        download_tokens: Arc::new(TokenCache::new(token_ttl_seconds)),
        release_cache: Arc::new(ReleaseCache::new(release_ttl_seconds)),
        release_repository,
        release_asset_name,
        http_client,
        default_download_dir,
    };

    cleanup_expired_files(&state.default_download_dir, STALE_FILE_MAX_AGE_SECONDS).await;

    let cors = build_cors_layer()?;
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr = resolve_bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|error| ApiError::internal(format!("Could not bind to {addr}: {error}")))?;

    info!("{APP_NAME} listening on http://{addr}");

    axum::serve(listener, app)
        .await
        .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/video-info", post(fetch_video_info))
        .route("/api/download", post(start_download))
        .route("/api/files/{filename}", get(serve_file))
        .route("/api/settings", get(get_settings).post(update_settings))
        .route("/api/validate-path", post(validate_path))
        .route("/api/browse-folder", get(browse_folder))
        .route("/api/release", get(get_release))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn fetch_video_info(
    State(_state): State<AppState>,
    Json(payload): Json<VideoInfoRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let url = payload
        .url
        .as_deref()
        .and_then(non_empty)
        .ok_or_else(|| ApiError::bad_request("Provide a video URL."))?;
    let platform = parse_platform(payload.platform.as_deref())?;
    if !platform.matches_url(url) {
        return Err(ApiError::bad_request(format!(
            "The URL is not a valid {} URL.",
            platform.as_str()
        )));
    }

    let engine_url = platform.normalize_url(url);
    let output = run_yt_dlp(probe_args(&engine_url, platform)).await?;
    let probe: YtDlpProbe = serde_json::from_slice(&output.stdout).map_err(|error| {
        ApiError::internal(format!("Could not read metadata for this URL: {error}"))
    })?;

    let available_formats = probe
        .formats
        .iter()
        .filter(|format| matches!(format.ext.as_deref(), Some("mp4" | "webm" | "mp3")))
        .map(|format| AvailableFormat {
            format_id: format.format_id.clone(),
            ext: format.ext.clone().unwrap_or_default(),
            resolution: format.resolution.clone(),
            file_size: format.filesize,
        })
        .collect::<Vec<_>>();

    let data = VideoInfoData {
        id: probe.id,
        title: probe.title.clone(),
        duration: probe.duration,
        upload_date: probe.upload_date,
        thumbnail: probe.thumbnail,
        suggested_filename: sanitize_filename(probe.title.as_deref().unwrap_or_default()),
        available_formats,
    };

    Ok(Json(serde_json::json!({ "success": true, "data": data })))
}

async fn start_download(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<DownloadRequest>,
) -> Result<Json<DownloadResponse>, ApiError> {
    let url = payload
        .url
        .as_deref()
        .and_then(non_empty)
        .ok_or_else(|| ApiError::bad_request("Provide a video URL."))?;
    let platform = parse_platform(payload.platform.as_deref())?;
    if !platform.matches_url(url) {
        return Err(ApiError::bad_request(format!(
            "The URL is not a valid {} URL.",
            platform.as_str()
        )));
    }

    let format = payload.format.as_deref().and_then(non_empty).unwrap_or("best");
    let quality = payload.quality.as_deref().and_then(non_empty).unwrap_or("best");

    let download_dir = active_download_dir(&state).await?;
    cleanup_expired_files(&state.default_download_dir, STALE_FILE_MAX_AGE_SECONDS).await;

    // The same id seeds the temporary output name and later becomes the token.
    let file_id = Uuid::new_v4().to_string();
    let selector = build_format_selector(format, quality, platform);
    let engine_url = platform.normalize_url(url);
    let output_template = format!("{}/{file_id}.%(ext)s", download_dir.to_string_lossy());

    info!("Starting download for {engine_url} with selector {selector}");

    let output = run_yt_dlp(download_args(&engine_url, &selector, &output_template)).await?;
    let summary: YtDlpMedia = serde_json::from_slice(&output.stdout).map_err(|error| {
        ApiError::internal(format!(
            "The extraction engine returned an unreadable result: {error}"
        ))
    })?;
    let (title, prepared_path) = primary_media(&summary)?;

    let (final_name, final_path) = finalize_download(
        &download_dir,
        &file_id,
        prepared_path.as_deref(),
        payload.filename.as_deref(),
        title.as_deref(),
        RESOLVE_MAX_ATTEMPTS,
        Duration::from_millis(RESOLVE_POLL_INTERVAL_MS),
    )
    .await?;

    state
        .download_tokens
        .register(file_id.clone(), final_path, final_name.clone())
        .await;
    info!("Registered download token {file_id} for {final_name:?}");

    Ok(Json(DownloadResponse {
        success: true,
        download_url: download_url_for_token(&headers, &file_id),
        filename: final_name,
        title,
    }))
}

async fn serve_file(
    State(state): State<AppState>,
    RoutePath(name): RoutePath<String>,
) -> Result<Response, ApiError> {
    let (file_path, display_name) =
        if let Some(record) = state.download_tokens.resolve(&name).await {
            (record.path, record.logical_name)
        } else {
            // Pre-existing links reference plain filenames instead of tokens.
            let fallback = find_file_by_name(&state, &name)
                .await
                .ok_or_else(|| ApiError::not_found("The requested file could not be found."))?;
            (fallback, name)
        };

    let metadata = tokio::fs::metadata(&file_path)
        .await
        .map_err(|_| ApiError::not_found("The requested file could not be found."))?;
    let file = tokio::fs::File::open(&file_path)
        .await
        .map_err(|_| ApiError::not_found("The requested file could not be found."))?;

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(content_type_for_filename(&display_name)),
    );
    headers.insert(
        CONTENT_LENGTH,
        HeaderValue::from_str(&metadata.len().to_string())
            .map_err(|_| ApiError::internal("Could not build the download size header."))?,
    );
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&display_name))
            .map_err(|_| ApiError::internal("Could not build the download header."))?,
    );

    debug!("Serving {display_name:?} from {file_path:?}");
    let body = Body::from_stream(ReaderStream::new(file));
    Ok((headers, body).into_response())
}

async fn get_settings(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let download_path = active_download_dir(&state).await?;
    let release = release_info(&state, false).await;

    Ok(Json(serde_json::json!({
        "success": true,
        "data": {
            "app_name": APP_NAME,
            "download_path": download_path.to_string_lossy(),
            "default_download_path": DEFAULT_DOWNLOAD_DIR,
            "version": app_version(),
            "release": release,
        }
    })))
}

async fn update_settings(
    State(state): State<AppState>,
    Json(payload): Json<SettingsUpdateRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let requested = payload
        .download_path
        .as_deref()
        .and_then(non_empty)
        .ok_or_else(|| ApiError::bad_request("Provide a download folder path."))?;
    let normalized = validate_download_dir(requested).await?;
    let normalized_text = normalized.to_string_lossy().into_owned();

    let (snapshot, previous) = {
        let mut settings = state.settings.lock().await;
        let previous = settings.download_dir.clone();
        settings.download_dir = normalized_text.clone();
        (settings.clone(), previous)
    };

    if let Err(error) = save_settings(&state.settings_paths, &snapshot).await {
        let mut settings = state.settings.lock().await;
        settings.download_dir = previous;
        return Err(error);
    }

    info!("Updated download directory to {normalized_text}");
    Ok(Json(serde_json::json!({
        "success": true,
        "download_path": normalized_text,
    })))
}

async fn validate_path(
    Json(payload): Json<SettingsUpdateRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let requested = payload
        .download_path
        .as_deref()
        .and_then(non_empty)
        .ok_or_else(|| ApiError::bad_request("Provide a download folder path."))?;
    let normalized = validate_download_dir(requested).await?;

    Ok(Json(serde_json::json!({
        "success": true,
        "download_path": normalized.to_string_lossy(),
    })))
}

async fn browse_folder(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    if let Some(path) = pick_folder_via_osascript().await {
        return Ok(Json(serde_json::json!({
            "success": true,
            "path": path.to_string_lossy(),
            "source": "dialog",
        })));
    }

    let discovered = discover_download_dirs(&state).await;
    let first = discovered
        .first()
        .cloned()
        .ok_or_else(|| ApiError::not_found("No usable download folder could be found."))?;
    let candidates = discovered
        .iter()
        .map(|path| path.to_string_lossy().into_owned())
        .collect::<Vec<_>>();

    Ok(Json(serde_json::json!({
        "success": true,
        "path": first.to_string_lossy(),
        "candidates": candidates,
        "source": "fallback",
    })))
}

async fn get_release(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let release = release_info(&state, true)
        .await
        .ok_or_else(|| ApiError::not_found("No release information is available."))?;
    Ok(Json(serde_json::json!({ "success": true, "data": release })))
}

fn parse_platform(value: Option<&str>) -> Result<Platform, ApiError> {
    let name = value.and_then(non_empty).unwrap_or("youtube");
    Platform::parse(name)
        .ok_or_else(|| ApiError::bad_request(format!("Unsupported platform: {name}.")))
}

fn clean_instagram_url(input: &str) -> String {
    let Ok(parsed) = Url::parse(input) else {
        return input.to_string();
    };

    let segments = parsed
        .path()
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>();

    let mut reel_id = None;
    for (index, segment) in segments.iter().enumerate() {
        if *segment == "reel" && index + 1 < segments.len() {
            reel_id = Some(segments[index + 1]);
            break;
        }
    }
    let reel_id = reel_id.or_else(|| segments.last().copied());

    if let Some(id) = reel_id {
        return format!("https://www.instagram.com/reel/{id}/");
    }

    let host = parsed.host_str().unwrap_or_default();
    format!("{}://{host}{}", parsed.scheme(), parsed.path())
}

fn build_format_selector(format: &str, quality: &str, platform: Platform) -> String {
    let container = format.trim().to_ascii_lowercase();
    if container == "mp3" {
        return "bestaudio/best".to_string();
    }

    // Only YouTube exposes format metadata rich enough for a fallback chain.
    if !platform.is_primary() {
        if container.is_empty() || container == "best" {
            return "best".to_string();
        }
        return container;
    }

    let container = match container.as_str() {
        "mp4" => Some("mp4"),
        "webm" => Some("webm"),
        _ => None,
    };
    let height = max_height_for_quality(quality);

    let candidates = [
        selector_term("b", container, height),
        selector_term("b", container, None),
        selector_term("b", None, height),
        selector_term("b", None, None),
        format!("{}+ba", selector_term("bv", container, height)),
        format!("{}+ba", selector_term("bv", container, None)),
        format!("{}+ba", selector_term("bv", None, None)),
        selector_term("best", container, height),
        selector_term("best", container, None),
        selector_term("best", None, None),
    ];

    let mut terms: Vec<String> = Vec::new();
    for term in candidates {
        if !terms.contains(&term) {
            terms.push(term);
        }
    }

    terms.join("/")
}

fn selector_term(base: &str, container: Option<&str>, height: Option<u32>) -> String {
    let mut term = String::from(base);
    if let Some(container) = container {
        term.push_str(&format!("[ext={container}]"));
    }
    if let Some(height) = height {
        term.push_str(&format!("[height<={height}]"));
    }
    term
}

fn max_height_for_quality(quality: &str) -> Option<u32> {
    match quality.trim().to_ascii_lowercase().as_str() {
        "1080p" => Some(1080),
        "720p" => Some(720),
        "480p" => Some(480),
        _ => None,
    }
}

fn probe_args(url: &str, platform: Platform) -> Vec<String> {
    let mut args = vec![
        "-J".to_string(),
        "--no-warnings".to_string(),
        "--no-check-certificates".to_string(),
        "--ignore-errors".to_string(),
        "--user-agent".to_string(),
        YT_DLP_USER_AGENT.to_string(),
    ];

    if platform == Platform::Instagram {
        args.push("--flat-playlist".to_string());
    }

    args.push(url.to_string());
    args
}

fn download_args(url: &str, selector: &str, output_template: &str) -> Vec<String> {
    vec![
        "-J".to_string(),
        "--no-simulate".to_string(),
        "--no-warnings".to_string(),
        "--no-check-certificates".to_string(),
        "--ignore-errors".to_string(),
        "--restrict-filenames".to_string(),
        "--user-agent".to_string(),
        YT_DLP_USER_AGENT.to_string(),
        "-f".to_string(),
        selector.to_string(),
        "-o".to_string(),
        output_template.to_string(),
        url.to_string(),
    ]
}

async fn run_yt_dlp(args: Vec<String>) -> Result<std::process::Output, ApiError> {
    let mut command = Command::new("yt-dlp");
    command.args(args);

    let output = timeout(Duration::from_secs(YT_DLP_TIMEOUT_SECONDS), command.output())
        .await
        .map_err(|_| {
            ApiError::bad_request("The download took too long. Try another URL or a lighter format.")
        })?
        .map_err(|error| {
            if error.kind() == ErrorKind::NotFound {
                ApiError::internal(
                    "yt-dlp is not installed on this system. Install yt-dlp and restart the service.",
                )
            } else {
                ApiError::internal(format!("Could not run yt-dlp: {error}"))
            }
        })?;

    if !output.status.success() {
        return Err(ApiError::bad_request(run_error_message(&output.stderr)));
    }

    Ok(output)
}

fn run_error_message(stderr: &[u8]) -> String {
    let message = String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("yt-dlp could not complete the operation")
        .to_string();
    let lower = message.to_ascii_lowercase();

    if lower.contains("unsupported url") {
        "This URL is not supported for download.".to_string()
    } else if lower.contains("private video") || lower.contains("login required") || lower.contains("sign in") {
        "This video is private or requires a signed-in account.".to_string()
    } else if lower.contains("video unavailable") {
        "This video is unavailable. It may have been removed.".to_string()
    } else if lower.contains("unable to extract") || lower.contains("nonetype") {
        "No metadata could be read from this URL. Try again later.".to_string()
    } else {
        message
    }
}

fn primary_media(summary: &YtDlpMedia) -> Result<(Option<String>, Option<PathBuf>), ApiError> {
    if let Some(entries) = &summary.entries {
        let entry = entries.iter().flatten().next().ok_or_else(|| {
            ApiError::internal("The extraction engine returned an empty result for this URL.")
        })?;
        let title = entry.title.clone().or_else(|| summary.title.clone());
        let prepared = first_filepath(&entry.requested_downloads)
            .or_else(|| first_filepath(&summary.requested_downloads));
        return Ok((title, prepared));
    }

    Ok((
        summary.title.clone(),
        first_filepath(&summary.requested_downloads),
    ))
}

fn first_filepath(downloads: &[YtDlpArtifact]) -> Option<PathBuf> {
    downloads
        .iter()
        .find_map(|download| download.filepath.as_deref().map(PathBuf::from))
}

async fn finalize_download(
    download_dir: &Path,
    file_id: &str,
    prepared_path: Option<&Path>,
    requested_name: Option<&str>,
    title: Option<&str>,
    max_attempts: u32,
    poll_interval: Duration,
) -> Result<(String, PathBuf), ApiError> {
    let resolved = resolve_downloaded_file(
        download_dir,
        file_id,
        prepared_path,
        max_attempts,
        poll_interval,
    )
    .await?;

    let ext_with_dot = resolved
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{ext}"))
        .unwrap_or_default();
    let base_name = sanitize_filename(requested_name.and_then(non_empty).or(title).unwrap_or_default());
    let final_name = ensure_unique_filename(download_dir, &base_name, &ext_with_dot).await;
    let final_path = download_dir.join(&final_name);

    rename_no_replace(&resolved, &final_path)
        .await
        .map_err(|error| {
            ApiError::internal(format!(
                "Could not move the finished download into place: {error}"
            ))
        })?;

    info!("Finished download: {final_path:?}");
    Ok((final_name, final_path))
}

async fn resolve_downloaded_file(
    download_dir: &Path,
    file_id: &str,
    prepared_path: Option<&Path>,
    max_attempts: u32,
    poll_interval: Duration,
) -> Result<PathBuf, ApiError> {
    // The engine can report success before the final merged file lands on disk.
    for attempt in 1..=max_attempts {
        tokio::time::sleep(poll_interval).await;
        if let Some(found) = scan_download_dir(download_dir, file_id, prepared_path).await? {
            debug!("Resolved downloaded file on attempt {attempt}: {found:?}");
            return Ok(found);
        }
    }

    Err(ApiError::internal(
        "The file could not be found after the download finished.",
    ))
}

async fn scan_download_dir(
    download_dir: &Path,
    file_id: &str,
    prepared_path: Option<&Path>,
) -> Result<Option<PathBuf>, ApiError> {
    if let Some(prepared) = prepared_path {
        if let Some(found) = finalized_candidate(download_dir, prepared).await? {
            return Ok(Some(found));
        }

        if let Some(stem) = prepared.file_stem().and_then(|stem| stem.to_str()) {
            let same_stem = scan_directory(download_dir, |name| {
                Path::new(name).file_stem().and_then(|candidate| candidate.to_str()) == Some(stem)
            })
            .await?;
            if let Some(found) = same_stem {
                return Ok(Some(found));
            }
        }
    }

    scan_directory(download_dir, |name| name.starts_with(file_id)).await
}

async fn scan_directory<F>(download_dir: &Path, matches: F) -> Result<Option<PathBuf>, ApiError>
where
    F: Fn(&str) -> bool,
{
    let mut entries = tokio::fs::read_dir(download_dir).await.map_err(|error| {
        ApiError::internal(format!("Could not open the download directory: {error}"))
    })?;

    while let Some(entry) = entries.next_entry().await.map_err(|error| {
        ApiError::internal(format!("Could not scan the download directory: {error}"))
    })? {
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if is_in_progress_name(name) || !matches(name) {
            continue;
        }

        match entry.file_type().await {
            Ok(file_type) if file_type.is_file() => return Ok(Some(entry.path())),
            _ => {}
        }
    }

    Ok(None)
}

async fn finalized_candidate(
    download_dir: &Path,
    candidate: &Path,
) -> Result<Option<PathBuf>, ApiError> {
    if candidate
        .file_name()
        .and_then(|name| name.to_str())
        .is_none_or(is_in_progress_name)
    {
        return Ok(None);
    }

    let metadata = match tokio::fs::metadata(candidate).await {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
        Err(error) => {
            return Err(ApiError::internal(format!(
                "Could not inspect the downloaded file: {error}"
            )));
        }
    };
    if !metadata.is_file() {
        return Ok(None);
    }

    let canonical_dir = tokio::fs::canonicalize(download_dir).await.map_err(|error| {
        ApiError::internal(format!("Could not resolve the download directory: {error}"))
    })?;
    let canonical_candidate = tokio::fs::canonicalize(candidate).await.map_err(|error| {
        ApiError::internal(format!("Could not resolve the downloaded file path: {error}"))
    })?;

    if !canonical_candidate.starts_with(&canonical_dir) {
        warn!("Ignoring a reported file outside the download directory: {canonical_candidate:?}");
        return Ok(None);
    }

    Ok(Some(canonical_candidate))
}

fn is_in_progress_name(name: &str) -> bool {
    const IN_PROGRESS_SUFFIXES: [&str; 3] = [".part", ".tmp", ".ytdl"];

    IN_PROGRESS_SUFFIXES
        .iter()
        .any(|suffix| name.ends_with(suffix))
}

// A hard link refuses to clobber an existing target, unlike a plain rename.
async fn rename_no_replace(from: &Path, to: &Path) -> std::io::Result<()> {
    tokio::fs::hard_link(from, to).await?;
    tokio::fs::remove_file(from).await
}

fn sanitize_filename(value: &str) -> String {
    let stripped = value
        .chars()
        .filter(|character| {
            !matches!(
                character,
                '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|'
            )
        })
        .collect::<String>();
    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = collapsed.trim_matches(|character: char| character == '.' || character == ' ');
    let limited = trimmed.chars().take(FILENAME_MAX_CHARS).collect::<String>();

    if limited.is_empty() {
        "video".to_string()
    } else {
        limited
    }
}

async fn ensure_unique_filename(directory: &Path, base_name: &str, ext_with_dot: &str) -> String {
    let mut candidate = format!("{base_name}{ext_with_dot}");
    let mut counter = 1u32;

    while tokio::fs::try_exists(directory.join(&candidate))
        .await
        .unwrap_or(false)
    {
        candidate = format!("{base_name} ({counter}){ext_with_dot}");
        counter += 1;
    }

    candidate
}

fn content_type_for_filename(filename: &str) -> &'static str {
    let extension = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        _ => "application/octet-stream",
    }
}

fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let mut sanitized = String::with_capacity(value.len());

    for character in value.chars() {
        if character.is_ascii_alphanumeric()
            || matches!(character, '.' | '-' | '_' | ' ' | '(' | ')')
        {
            sanitized.push(character);
        } else {
            sanitized.push('_');
        }
    }

    let compact = sanitized.trim();
    if compact.is_empty() {
        "video".to_string()
    } else {
        compact.to_string()
    }
}

fn download_url_for_token(headers: &HeaderMap, token: &str) -> String {
    if let Some(host) = headers.get(HOST).and_then(|value| value.to_str().ok())
        && !host.trim().is_empty()
    {
        return format!("http://{host}/api/files/{token}");
    }

    format!("/api/files/{token}")
}

async fn find_file_by_name(state: &AppState, filename: &str) -> Option<PathBuf> {
    if filename.is_empty()
        || filename.contains('/')
        || filename.contains('\\')
        || filename.contains("..")
    {
        return None;
    }

    let mut search_dirs = Vec::new();
    if let Ok(active) = active_download_dir(state).await {
        search_dirs.push(active);
    }
    search_dirs.push(state.default_download_dir.clone());

    for directory in search_dirs {
        let candidate = directory.join(filename);
        if let Ok(metadata) = tokio::fs::metadata(&candidate).await
            && metadata.is_file()
        {
            return Some(candidate);
        }
    }

    None
}

async fn active_download_dir(state: &AppState) -> Result<PathBuf, ApiError> {
    let configured = { state.settings.lock().await.download_dir.clone() };
    let active = normalize_download_dir(&configured);

    tokio::fs::create_dir_all(&active).await.map_err(|error| {
        ApiError::internal(format!("Could not prepare the download directory: {error}"))
    })?;

    Ok(active)
}

async fn load_settings(candidates: &[PathBuf]) -> AppSettings {
    for path in candidates {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => match serde_json::from_str::<AppSettings>(&contents) {
                Ok(mut settings) => {
                    settings.download_dir = normalize_download_dir(&settings.download_dir)
                        .to_string_lossy()
                        .into_owned();
                    return settings;
                }
                Err(error) => {
                    warn!("Skipping unreadable settings file {path:?}: {error}");
                }
            },
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => {
                warn!("Could not open the settings file {path:?}: {error}");
            }
        }
    }

    AppSettings {
        download_dir: DEFAULT_DOWNLOAD_DIR.to_string(),
    }
}

async fn save_settings(candidates: &[PathBuf], settings: &AppSettings) -> Result<(), ApiError> {
    let payload = serde_json::to_string_pretty(settings)
        .map_err(|error| ApiError::internal(format!("Could not serialize the settings: {error}")))?;

    let mut last_error = None;
    for path in candidates {
        if let Some(parent) = path.parent() {
            if let Err(error) = tokio::fs::create_dir_all(parent).await {
                last_error = Some(error);
                continue;
            }
        }

        match tokio::fs::write(path, &payload).await {
            Ok(()) => return Ok(()),
            Err(error) => {
                warn!("Could not save settings to {path:?}: {error}");
                last_error = Some(error);
            }
        }
    }

    Err(ApiError::internal(format!(
        "Could not save the settings to any location: {}",
        last_error
            .map(|error| error.to_string())
            .unwrap_or_else(|| "no writable candidate".to_string())
    )))
}

fn normalize_download_dir(value: &str) -> PathBuf {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return PathBuf::from(DEFAULT_DOWNLOAD_DIR);
    }

    let expanded = expand_home(trimmed);
    if expanded.is_absolute() {
        expanded
    } else {
        std::env::current_dir()
            .map(|current| current.join(&expanded))
            .unwrap_or(expanded)
    }
}

fn expand_home(value: &str) -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        if value == "~" {
            return PathBuf::from(home);
        }
        if let Some(rest) = value.strip_prefix("~/") {
            return PathBuf::from(home).join(rest);
        }
    }

    PathBuf::from(value)
}

async fn validate_download_dir(value: &str) -> Result<PathBuf, ApiError> {
    let normalized = normalize_download_dir(value);
    if !normalized.is_absolute() {
        return Err(ApiError::bad_request("Provide an absolute folder path."));
    }

    let metadata = tokio::fs::metadata(&normalized)
        .await
        .map_err(|_| ApiError::bad_request("The folder could not be found."))?;
    if !metadata.is_dir() {
        return Err(ApiError::bad_request("The folder could not be found."));
    }

    if !can_write_to_directory(&normalized).await {
        return Err(ApiError::bad_request("The folder is not writable."));
    }

    Ok(normalized)
}

async fn can_write_to_directory(path: &Path) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.is_dir() => {}
        _ => return false,
    }

    let probe = path.join(format!(".vidgate_write_test_{}", Uuid::new_v4().simple()));
    match tokio::fs::write(&probe, b"").await {
        Ok(()) => {
            if let Err(error) = tokio::fs::remove_file(&probe).await {
                debug!("Could not remove the write probe {probe:?}: {error}");
            }
            true
        }
        Err(_) => false,
    }
}

async fn discover_download_dirs(state: &AppState) -> Vec<PathBuf> {
    let home = std::env::var("HOME").ok().map(PathBuf::from);
    let configured = { state.settings.lock().await.download_dir.clone() };

    let mut candidates = vec![normalize_download_dir(&configured)];
    if let Some(home) = &home {
        candidates.push(home.join("Downloads"));
        candidates.push(home.join("Desktop"));
        candidates.push(home.join("Documents"));
    }
    candidates.push(state.default_download_dir.clone());
    if let Some(home) = home {
        candidates.push(home);
    }

    let mut discovered = Vec::new();
    let mut seen = HashSet::new();
    for candidate in candidates {
        if !seen.insert(candidate.clone()) {
            continue;
        }
        if can_write_to_directory(&candidate).await {
            discovered.push(candidate);
        }
    }

    discovered
}

async fn pick_folder_via_osascript() -> Option<PathBuf> {
    let mut command = Command::new("osascript");
    command.args(["-l", "JavaScript", "-e", FOLDER_PICKER_SCRIPT]);

    let output = match timeout(
        Duration::from_secs(FOLDER_PICKER_TIMEOUT_SECONDS),
        command.output(),
    )
    .await
    {
        Ok(Ok(output)) => output,
        Ok(Err(error)) => {
            if error.kind() == ErrorKind::NotFound {
                debug!("osascript is not available on this system; skipping the folder dialog");
            } else {
                warn!("Folder picker launch failed: {error}");
            }
            return None;
        }
        Err(_) => {
            warn!("Folder picker timed out.");
            return None;
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        // osascript reports -128 when the user cancels the dialog.
        if stderr.contains("-128") {
            info!("Folder picker canceled by user");
        } else {
            warn!("Folder picker osascript error: {}", stderr.trim());
        }
        return None;
    }

    let selected = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if selected.is_empty() {
        return None;
    }

    let normalized = normalize_download_dir(&selected);
    if can_write_to_directory(&normalized).await {
        Some(normalized)
    } else {
        None
    }
}

async fn release_info(state: &AppState, force_refresh: bool) -> Option<ReleaseInfo> {
    let now = Utc::now();
    if !force_refresh {
        if let Some(cached) = state.release_cache.fresh(now).await {
            return Some(cached);
        }
    }

    if let Some(fetched) = fetch_latest_release(state).await {
        state.release_cache.store(fetched, now).await;
    }

    state.release_cache.last_known().await
}

async fn fetch_latest_release(state: &AppState) -> Option<ReleaseInfo> {
    let repository = state.release_repository.as_deref()?;
    let api_url = format!("https://api.github.com/repos/{repository}/releases/latest");

    let response = match state
        .http_client
        .get(&api_url)
        .header("Accept", "application/vnd.github+json")
        .send()
        .await
    {
        Ok(response) => response,
        Err(error) => {
            warn!("Failed to fetch the latest release from GitHub: {error}");
            return None;
        }
    };

    if !response.status().is_success() {
        warn!("GitHub release API returned status {}", response.status());
        return None;
    }

    let release = match response.json::<GithubRelease>().await {
        Ok(release) => release,
        Err(error) => {
            warn!("Could not parse the GitHub release payload: {error}");
            return None;
        }
    };

    let preferred = release
        .assets
        .iter()
        .find(|asset| asset.name.as_deref() == Some(state.release_asset_name.as_str()));
    let zip = release
        .assets
        .iter()
        .find(|asset| asset.name.as_deref().is_some_and(|name| name.ends_with(".zip")));
    let selected = preferred.or(zip);

    Some(ReleaseInfo {
        asset_name: selected.and_then(|asset| asset.name.clone()),
        asset_download_url: selected
            .and_then(|asset| asset.browser_download_url.clone())
            .or_else(|| release.html_url.clone()),
        tag_name: release.tag_name,
        name: release.name,
        published_at: release.published_at,
        release_page_url: release.html_url,
        repository: repository.to_string(),
    })
}

async fn cleanup_expired_files(directory: &Path, older_than_secs: u64) {
    let mut entries = match tokio::fs::read_dir(directory).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!("Could not open {directory:?} for cleanup: {error}");
            }
            return;
        }
    };

    let max_age = Duration::from_secs(older_than_secs);
    let now = std::time::SystemTime::now();

    loop {
        let maybe_entry = match entries.next_entry().await {
            Ok(value) => value,
            Err(error) => {
                warn!("Could not scan {directory:?} during cleanup: {error}");
                break;
            }
        };

        let Some(entry) = maybe_entry else {
            break;
        };

        let path = entry.path();
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(error) => {
                warn!("Could not read metadata for {path:?}: {error}");
                continue;
            }
        };

        if !metadata.is_file() {
            continue;
        }

        let modified_at = match metadata.modified() {
            Ok(value) => value,
            Err(error) => {
                warn!("Could not read the modification time of {path:?}: {error}");
                continue;
            }
        };

        let age = now
            .duration_since(modified_at)
            .unwrap_or(Duration::from_secs(0));
        if age < max_age {
            continue;
        }

        if let Err(error) = tokio::fs::remove_file(&path).await {
            if error.kind() != ErrorKind::NotFound {
                warn!("Could not remove the expired file {path:?}: {error}");
            }
        } else {
            info!("Removed expired file: {path:?}");
        }
    }
}

fn app_version() -> String {
    std::env::var("APP_VERSION")
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
        .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string())
}

fn read_usize_env(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = std::env::var("APP_ADDR")
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
    {
        return configured;
    }

    if let Some(port) = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
    {
        return format!("0.0.0.0:{port}");
    }

    "127.0.0.1:5252".to_string()
}

fn build_cors_layer() -> Result<CorsLayer, ApiError> {
    let configured = std::env::var("ALLOWED_ORIGINS")
        .ok()
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(ToString::to_string)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .expose_headers([CONTENT_DISPOSITION]);

    if configured.is_empty() {
        return Ok(layer.allow_origin(Any));
    }

    let origins = configured
        .iter()
        .map(|origin| {
            HeaderValue::from_str(origin).map_err(|_| {
                ApiError::internal(format!("Invalid origin in ALLOWED_ORIGINS: {origin}"))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(layer.allow_origin(origins))
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
