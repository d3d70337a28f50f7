use super::*;
use crate::download::{DownloadRequest, DownloadResult};
use crate::helpers::with_retries;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

const MAX_CONNECTIONS: u32 = 5;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// One row of a user's library, joined with its item and file. Also the
/// JSON shape served to the web app.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub(super) struct LibraryItem {
    pub(super) file_id: i64,
    pub(super) item_id: i64,
    pub(super) title: String,
    pub(super) author: String,
    pub(super) format: String,
    pub(super) added_at: String,
    pub(super) current_location: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) struct StoredFile {
    pub(super) id: i64,
    pub(super) path: String,
    pub(super) format: String,
    pub(super) size_bytes: i64,
}

/// Users, items, stored files and the links between them. Every write is
/// idempotent or upsert-safe so a repeated download never corrupts state.
#[derive(Clone, Debug)]
pub(super) struct Library {
    pool: SqlitePool,
}

impl Library {
    pub(super) async fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("create db dir {}", dir.display()))?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await
            .with_context(|| format!("open sqlite {}", path.display()))?;
        Self::migrate(pool).await
    }

    /// Single long-lived connection, otherwise the database disappears.
    #[cfg(test)]
    pub(super) async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("open in-memory sqlite")?;
        Self::migrate(pool).await
    }

    async fn migrate(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("run migrations")?;
        Ok(Self { pool })
    }

    pub(super) async fn ensure_user(&self, user_id: i64, username: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (telegram_id, username) VALUES (?, ?)
             ON CONFLICT(telegram_id) DO UPDATE SET username = excluded.username",
        )
        .bind(user_id)
        .bind(username)
        .execute(&self.pool)
        .await
        .with_context(|| format!("ensure user {}", user_id))?;
        Ok(())
    }

    /// Returns the internal id. An empty source id cannot be deduplicated and
    /// always inserts a fresh row. Empty metadata never overwrites what is
    /// already stored.
    pub(super) async fn upsert_item(&self, source_id: &str, title: &str, author: &str) -> Result<i64> {
        if source_id.is_empty() {
            let result = sqlx::query("INSERT INTO items (title, author) VALUES (?, ?)")
                .bind(title)
                .bind(author)
                .execute(&self.pool)
                .await
                .context("insert item")?;
            return Ok(result.last_insert_rowid());
        }

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO items (source_id, title, author) VALUES (?, ?, ?)
             ON CONFLICT(source_id) DO UPDATE SET
                 title = CASE WHEN excluded.title <> '' THEN excluded.title ELSE items.title END,
                 author = CASE WHEN excluded.author <> '' THEN excluded.author ELSE items.author END
             RETURNING id",
        )
        .bind(source_id)
        .bind(title)
        .bind(author)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("upsert item {}", source_id))?;
        Ok(id)
    }

    pub(super) async fn insert_file(
        &self,
        item_id: i64,
        format: &str,
        storage_path: &str,
        size_bytes: i64,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO item_files (item_id, format, path, size_bytes) VALUES (?, ?, ?, ?)",
        )
        .bind(item_id)
        .bind(format)
        .bind(storage_path)
        .bind(size_bytes)
        .execute(&self.pool)
        .await
        .with_context(|| format!("insert file for item {}", item_id))?;
        Ok(result.last_insert_rowid())
    }

    /// Linking the same pair twice is a no-op.
    pub(super) async fn link_library(&self, user_id: i64, file_id: i64) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO user_library (user_id, file_id) VALUES (?, ?)")
            .bind(user_id)
            .bind(file_id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("link file {} to user {}", file_id, user_id))?;
        Ok(())
    }

    pub(super) async fn list_library(&self, user_id: i64) -> Result<Vec<LibraryItem>> {
        let rows: Vec<(i64, i64, String, String, String, String, Option<String>)> =
            sqlx::query_as(
                "SELECT f.id, i.id, i.title, i.author, f.format, ul.added_at, ul.current_location
                 FROM user_library ul
                 JOIN item_files f ON f.id = ul.file_id
                 JOIN items i ON i.id = f.item_id
                 WHERE ul.user_id = ?
                 ORDER BY ul.added_at DESC, f.id DESC",
            )
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("list library of user {}", user_id))?;

        Ok(rows
            .into_iter()
            .map(
                |(file_id, item_id, title, author, format, added_at, current_location)| LibraryItem {
                    file_id,
                    item_id,
                    title,
                    author,
                    format,
                    added_at,
                    current_location,
                },
            )
            .collect())
    }

    /// `None` unless the file is in this user's library.
    pub(super) async fn file_for_user(&self, user_id: i64, file_id: i64) -> Result<Option<StoredFile>> {
        let row: Option<(i64, String, String, i64)> = sqlx::query_as(
            "SELECT f.id, f.path, f.format, f.size_bytes
             FROM item_files f
             JOIN user_library ul ON ul.file_id = f.id
             WHERE ul.user_id = ? AND f.id = ?",
        )
        .bind(user_id)
        .bind(file_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("look up file {} for user {}", file_id, user_id))?;

        Ok(row.map(|(id, path, format, size_bytes)| StoredFile {
            id,
            path,
            format,
            size_bytes,
        }))
    }

    /// Returns false when the user has no such library entry.
    pub(super) async fn update_progress(&self, user_id: i64, file_id: i64, location: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE user_library SET current_location = ? WHERE user_id = ? AND file_id = ?",
        )
        .bind(location)
        .bind(user_id)
        .bind(file_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("update progress of file {} for user {}", file_id, user_id))?;
        Ok(result.rows_affected() > 0)
    }
}

/// Bookkeeping for a finished download. Each step is retried on its own and
/// failures are only logged: the user gets the file either way. The chain is
/// not transactional, so a failure can leave an item without a file row.
pub(super) async fn record_download(
    library: &Library,
    known: Option<&CatalogItem>,
    request: &DownloadRequest,
    saved: &DownloadResult,
) -> Option<i64> {
    let user_ok = match with_retries(|| library.ensure_user(request.user_id, &request.username)).await {
        Ok(()) => true,
        Err(err) => {
            error!("ensure_user failed: {:#}", err);
            false
        }
    };

    let (title, author) = known
        .map(|item| (item.title.as_str(), item.author.as_str()))
        .unwrap_or(("", ""));
    let item_id = match with_retries(|| library.upsert_item(&request.item_id, title, author)).await {
        Ok(id) => id,
        Err(err) => {
            error!("upsert_item failed: {:#}", err);
            return None;
        }
    };

    let size_bytes = i64::try_from(saved.size_bytes).unwrap_or(i64::MAX);
    let file_id = match with_retries(|| {
        library.insert_file(item_id, &request.format_path, &saved.relative_path, size_bytes)
    })
    .await
    {
        Ok(id) => id,
        Err(err) => {
            error!("insert_file failed: {:#}", err);
            return None;
        }
    };

    if !user_ok {
        warn!(
            "file {} stored without a library link for user {}",
            file_id, request.user_id
        );
        return Some(file_id);
    }
    if let Err(err) = with_retries(|| library.link_library(request.user_id, file_id)).await {
        error!("link_library failed: {:#}", err);
    }
    Some(file_id)
}
