//! JSON API behind the "Read online" web app: the user's library, file
//! bytes, and reading progress. Every request except the health check must
//! carry Telegram web-app `initData` signed with the bot token.

use super::*;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path as UrlPath, Request, State};
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::net::SocketAddr;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

const INIT_DATA_MAX_AGE_SECS: u64 = 24 * 60 * 60;
const INIT_DATA_MAX_SKEW_SECS: u64 = 5 * 60;
const INIT_DATA_HEADERS: [&str; 3] = [
    "x-telegram-initdata",
    "x-telegram-web-app-data",
    "x-telegram-webapp-data",
];
const INIT_DATA_QUERY_KEYS: [&str; 2] = ["initData", "tgWebAppData"];
const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub(super) enum InitDataError {
    #[error("hash is missing")]
    MissingHash,
    #[error("signature mismatch")]
    BadSignature,
    #[error("auth_date is older than 24h")]
    Expired,
    #[error("auth_date is in the future")]
    FromFuture,
    #[error("user field is missing or invalid")]
    BadUser,
}

#[derive(Debug, Error)]
pub(super) enum ApiError {
    #[error("initData required")]
    MissingInitData,
    #[error("invalid initData")]
    InvalidInitData(#[from] InitDataError),
    #[error("{0}")]
    BadRequest(&'static str),
    #[error("not found")]
    NotFound,
    #[error("internal error")]
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::MissingInitData | ApiError::InvalidInitData(_) => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Internal(err) => {
                error!("http api: {:#}", err);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

/// The part of the signed `user` field we need.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub(super) struct WebAppUser {
    pub(super) id: i64,
    #[serde(default)]
    pub(super) username: String,
}

#[derive(Debug, Deserialize)]
struct ProgressUpdate {
    #[serde(default)]
    file_id: i64,
    #[serde(default)]
    location: String,
}

pub(super) fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/library", get(library))
        .route("/api/files/", get(missing_file_id))
        .route("/api/files/{id}", get(file))
        .route("/api/progress", post(progress))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}

pub(super) async fn serve(addr: SocketAddr, state: Arc<AppState>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind http api on {}", addr))?;
    info!("http api listening on {}", addr);
    axum::serve(listener, router(state))
        .await
        .context("http api server")?;
    Ok(())
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let response = next.run(request).await;
    info!("http {} {} -> {}", method, path, response.status().as_u16());
    response
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

async fn library(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<Response, ApiError> {
    let user = authenticate(&state, &headers, &uri).await?;
    let items = state
        .library
        .list_library(user.id)
        .await
        .map_err(ApiError::Internal)?;
    Ok(Json(items).into_response())
}

async fn missing_file_id(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<Response, ApiError> {
    authenticate(&state, &headers, &uri).await?;
    Err(ApiError::BadRequest("file id is empty"))
}

async fn file(
    State(state): State<Arc<AppState>>,
    UrlPath(raw_id): UrlPath<String>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<Response, ApiError> {
    let user = authenticate(&state, &headers, &uri).await?;
    let file_id: i64 = raw_id
        .trim()
        .parse()
        .map_err(|_| ApiError::BadRequest("file id is invalid"))?;

    let stored = state
        .library
        .file_for_user(user.id, file_id)
        .await
        .map_err(ApiError::Internal)?
        .ok_or(ApiError::NotFound)?;
    let path = state.storage.absolute_path(&stored.path);
    let bytes = tokio::fs::read(&path).await.map_err(|err| {
        warn!("file {} missing on disk at {}: {}", stored.id, path.display(), err);
        ApiError::NotFound
    })?;
    debug!(
        "serving file {} ({} bytes) to user {}",
        stored.id, stored.size_bytes, user.id
    );
    Ok(([(header::CONTENT_TYPE, content_type(&stored.format))], bytes).into_response())
}

async fn progress(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Result<Response, ApiError> {
    let user = authenticate(&state, &headers, &uri).await?;
    let update: ProgressUpdate =
        serde_json::from_slice(&body).map_err(|_| ApiError::BadRequest("invalid json"))?;
    if update.file_id == 0 {
        return Err(ApiError::BadRequest("file_id is empty"));
    }

    let updated = state
        .library
        .update_progress(user.id, update.file_id, &update.location)
        .await
        .map_err(ApiError::Internal)?;
    if !updated {
        return Err(ApiError::NotFound);
    }
    Ok(Json(serde_json::json!({ "ok": true })).into_response())
}

/// Validates the request's initData and makes sure the user row exists.
async fn authenticate(state: &AppState, headers: &HeaderMap, uri: &Uri) -> Result<WebAppUser, ApiError> {
    let init_data = extract_init_data(headers, uri).ok_or(ApiError::MissingInitData)?;
    let user = validate_init_data(&init_data, &state.config.token, unix_now()).map_err(|err| {
        warn!("rejected initData (len {}): {}", init_data.len(), err);
        err
    })?;
    state
        .library
        .ensure_user(user.id, &user.username)
        .await
        .map_err(ApiError::Internal)?;
    debug!("http api user {} ({})", user.id, user.username);
    Ok(user)
}

/// Headers first, then `Authorization: tma ...`, then the query string.
pub(super) fn extract_init_data(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };

    if let Some(value) = INIT_DATA_HEADERS.iter().find_map(|name| header_value(*name)) {
        return Some(value);
    }
    if let Some(auth) = header_value(header::AUTHORIZATION.as_str()) {
        let scheme = auth.get(..4).unwrap_or_default();
        if scheme.eq_ignore_ascii_case("tma ") {
            return Some(auth.get(4..).unwrap_or_default().trim().to_string());
        }
    }

    let query = uri.query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, value)| {
            let key: &str = key;
            INIT_DATA_QUERY_KEYS.contains(&key) && !value.is_empty()
        })
        .map(|(_, value)| value.into_owned())
}

/// Checks the web-app signature: HMAC-SHA256 over the sorted `key=value`
/// lines, keyed with HMAC("WebAppData", bot token).
pub(super) fn validate_init_data(init_data: &str, token: &str, now: u64) -> Result<WebAppUser, InitDataError> {
    let mut pairs: Vec<(String, String)> = url::form_urlencoded::parse(init_data.as_bytes())
        .into_owned()
        .collect();
    let hash_index = pairs
        .iter()
        .position(|(key, _)| key == "hash")
        .ok_or(InitDataError::MissingHash)?;
    let (_, received) = pairs.remove(hash_index);
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    let check_string = pairs
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join("\n");
    let received = hex::decode(received.trim()).map_err(|_| InitDataError::BadSignature)?;
    let secret = hmac_sha256(b"WebAppData", token.as_bytes())?;
    let mut mac = HmacSha256::new_from_slice(&secret).map_err(|_| InitDataError::BadSignature)?;
    mac.update(check_string.as_bytes());
    mac.verify_slice(&received)
        .map_err(|_| InitDataError::BadSignature)?;

    let field = |name: &str| {
        pairs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    };
    if let Some(auth_date) = field("auth_date").and_then(|raw| raw.parse::<u64>().ok()) {
        if now > auth_date.saturating_add(INIT_DATA_MAX_AGE_SECS) {
            return Err(InitDataError::Expired);
        }
        if auth_date > now.saturating_add(INIT_DATA_MAX_SKEW_SECS) {
            return Err(InitDataError::FromFuture);
        }
    }

    let user: WebAppUser = field("user")
        .and_then(|raw| serde_json::from_str(raw).ok())
        .ok_or(InitDataError::BadUser)?;
    if user.id == 0 {
        return Err(InitDataError::BadUser);
    }
    Ok(user)
}

pub(super) fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, InitDataError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| InitDataError::BadSignature)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

pub(super) fn content_type(format: &str) -> &'static str {
    let format = format.trim().to_ascii_lowercase();
    if format.contains("epub") {
        "application/epub+zip"
    } else if format.contains("fb2") && format.contains("zip") {
        "application/zip"
    } else if format.contains("fb2") {
        "application/xml"
    } else if format.contains("pdf") {
        "application/pdf"
    } else {
        "application/octet-stream"
    }
}

fn unix_now() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
}
