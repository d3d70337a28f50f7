use super::*;
use crate::catalog::ByteStream;
use crate::helpers::{notify, read_online_keyboard, UserNotice};
use crate::library::record_download;

use futures_util::StreamExt;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

/// Telegram refuses bot uploads above this.
pub(super) const MAX_FILE_BYTES: u64 = 50 * 1024 * 1024;
const DEFAULT_EXTENSION: &str = "bin";
const DELIVERY_CAPTION: &str = "Your book. Enjoy reading!";
const DOWNLOADING_TEXT: &str = "Downloading the file, please wait...";

#[derive(Debug, Error)]
pub(super) enum DownloadError {
    #[error("catalog fetch failed: {0:#}")]
    Fetch(anyhow::Error),

    #[error("file exceeds the {limit} byte limit")]
    Oversize { limit: u64 },

    #[error("failed writing {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("download stream broke after {written} bytes: {cause:#}")]
    Stream { written: u64, cause: anyhow::Error },

    #[error("file delivery failed: {0:#}")]
    Delivery(anyhow::Error),
}

impl DownloadError {
    pub(super) fn notice(&self) -> UserNotice {
        match self {
            DownloadError::Fetch(_) => UserNotice::DownloadFailed,
            DownloadError::Oversize { limit } => UserNotice::Oversize(*limit),
            DownloadError::Write { .. } | DownloadError::Stream { .. } => UserNotice::SaveFailed,
            DownloadError::Delivery(err) => UserNotice::DeliveryFailed(format!("{:#}", err)),
        }
    }

    fn write(path: &Path, source: std::io::Error) -> Self {
        DownloadError::Write {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A file that made it to disk. `relative_path` is relative to the storage root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) struct DownloadResult {
    pub(super) relative_path: String,
    pub(super) size_bytes: u64,
}

#[derive(Clone, Debug)]
pub(super) struct DownloadRequest {
    pub(super) chat_id: ChatId,
    pub(super) user_id: i64,
    pub(super) username: String,
    pub(super) item_id: String,
    pub(super) format_path: String,
}

pub(super) struct FileStorage {
    root: PathBuf,
    max_bytes: u64,
}

impl FileStorage {
    pub(super) fn new(root: PathBuf, max_bytes: u64) -> Self {
        Self { root, max_bytes }
    }

    pub(super) fn absolute_path(&self, relative_path: &str) -> PathBuf {
        let path = self.root.join(relative_path);
        if path.is_absolute() {
            return path;
        }
        std::env::current_dir()
            .map(|cwd| cwd.join(&path))
            .unwrap_or(path)
    }

    /// Writes the stream under a fresh random name, reading at most one byte
    /// past the limit. The partial file is removed when the limit is exceeded
    /// or the write fails.
    pub(super) async fn save(
        &self,
        suggested_name: &str,
        mut stream: ByteStream,
    ) -> Result<DownloadResult, DownloadError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|err| DownloadError::write(&self.root, err))?;

        let name = stored_file_name(suggested_name);
        let path = self.root.join(&name);
        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|err| DownloadError::write(&path, err))?;

        let limit = self.max_bytes.saturating_add(1);
        let copied = copy_bounded(&mut file, &mut stream, limit, &path).await;
        drop(file);
        drop(stream);

        let failure = match copied {
            Ok(written) if written > self.max_bytes => DownloadError::Oversize {
                limit: self.max_bytes,
            },
            Ok(written) => {
                return Ok(DownloadResult {
                    relative_path: name,
                    size_bytes: written,
                })
            }
            Err(err) => err,
        };

        if let Err(err) = tokio::fs::remove_file(&path).await {
            warn!("failed to remove partial file {}: {}", path.display(), err);
        }
        Err(failure)
    }
}

async fn copy_bounded(
    file: &mut tokio::fs::File,
    stream: &mut ByteStream,
    limit: u64,
    path: &Path,
) -> Result<u64, DownloadError> {
    let mut written: u64 = 0;
    while written < limit {
        let Some(chunk) = stream.next().await else {
            break;
        };
        let chunk = chunk.map_err(|cause| DownloadError::Stream { written, cause })?;
        let remaining = usize::try_from(limit - written).unwrap_or(usize::MAX);
        let take = chunk.len().min(remaining);
        file.write_all(&chunk[..take])
            .await
            .map_err(|err| DownloadError::write(path, err))?;
        written += take as u64;
    }
    file.flush()
        .await
        .map_err(|err| DownloadError::write(path, err))?;
    Ok(written)
}

/// Random hex stem plus the suggested file's extension.
pub(super) fn stored_file_name(suggested_name: &str) -> String {
    let extension = Path::new(suggested_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or(DEFAULT_EXTENSION);
    format!("{}.{}", uuid::Uuid::new_v4().simple(), extension)
}

/// Fetch, store, record, deliver. Failures are reported to the chat here; the
/// progress message is removed last on every path.
pub(super) async fn download_and_deliver(
    transport: &dyn ChatTransport,
    state: &AppState,
    request: &DownloadRequest,
) -> Result<DownloadResult, DownloadError> {
    let progress = match transport.send_text(request.chat_id, DOWNLOADING_TEXT).await {
        Ok(message_id) => Some(message_id),
        Err(err) => {
            warn!("failed to send progress message: {:#}", err);
            None
        }
    };

    let outcome = fetch_store_deliver(transport, state, request).await;
    if let Err(err) = &outcome {
        error!(
            "download of {}/{} failed: {}",
            request.item_id, request.format_path, err
        );
        notify(transport, request.chat_id, err.notice()).await;
    }

    if let Some(message_id) = progress {
        if let Err(err) = transport.remove_message(request.chat_id, message_id).await {
            warn!("failed to remove progress message: {:#}", err);
        }
    }
    outcome
}

async fn fetch_store_deliver(
    transport: &dyn ChatTransport,
    state: &AppState,
    request: &DownloadRequest,
) -> Result<DownloadResult, DownloadError> {
    let download = state
        .catalog
        .fetch_stream(&request.item_id, &request.format_path)
        .await
        .map_err(DownloadError::Fetch)?;

    let saved = state
        .storage
        .save(&download.filename, download.stream)
        .await?;
    info!(
        "stored {} ({} bytes) for item {}",
        saved.relative_path, saved.size_bytes, request.item_id
    );

    let known = state
        .sessions
        .find_item(request.chat_id, &request.item_id)
        .await;
    record_download(&state.library, known.as_ref(), request, &saved).await;

    let path = state.storage.absolute_path(&saved.relative_path);
    let keyboard = state.config.mini_app_url.as_ref().map(read_online_keyboard);
    transport
        .send_file(request.chat_id, &path, DELIVERY_CAPTION, keyboard)
        .await
        .map_err(DownloadError::Delivery)?;

    Ok(saved)
}
