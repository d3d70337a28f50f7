use super::*;
use crate::callback_handlers::{CB_ITEM, CB_PAGE};
use crate::library::LibraryItem;
use crate::session::{NavControl, RenderedPage};

use std::future::Future;
use teloxide::types::WebAppInfo;

const RETRY_ATTEMPTS: usize = 3;
const RETRY_DELAY: Duration = Duration::from_millis(200);
const DEFAULT_SQLITE_PATH: &str = "data/app.db";
const DEFAULT_STORAGE_DIR: &str = "storage/books";

pub(super) const HELP_TEXT: &str = "Hi! Send me a book title and I will look it up.\n\
/library shows the books you have downloaded.";

/// Every failure the user can be told about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) enum UserNotice {
    SearchFailed,
    NothingFound,
    StaleSession,
    DetailsFailed,
    DownloadFailed,
    Oversize(u64),
    SaveFailed,
    DeliveryFailed(String),
    BadPage,
    BadFormat,
}

impl UserNotice {
    pub(super) fn text(&self) -> String {
        match self {
            UserNotice::SearchFailed => "Search failed, the catalog may be unreachable.".to_string(),
            UserNotice::NothingFound => "Nothing found.".to_string(),
            UserNotice::StaleSession => {
                "These search results are outdated. Please send your query again.".to_string()
            }
            UserNotice::DetailsFailed => "Could not load the book details.".to_string(),
            UserNotice::DownloadFailed => {
                "Could not download the file. The link may be outdated.".to_string()
            }
            UserNotice::Oversize(limit) => format!(
                "The file is too large. Maximum size: {} MB.",
                limit / (1024 * 1024)
            ),
            UserNotice::SaveFailed => "Failed to save the file.".to_string(),
            UserNotice::DeliveryFailed(reason) => format!("Failed to send the file: {}", reason),
            UserNotice::BadPage => "Could not switch the page.".to_string(),
            UserNotice::BadFormat => "Could not recognize the format.".to_string(),
        }
    }
}

/// Sends a notice; a failure to do so is only logged.
pub(super) async fn notify(transport: &dyn ChatTransport, chat_id: ChatId, notice: UserNotice) {
    if let Err(err) = transport.send_text(chat_id, &notice.text()).await {
        error!("failed to notify chat {}: {:#}", chat_id.0, err);
    }
}

pub(super) async fn with_retries<F, Fut, T>(mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_err = None;
    for attempt in 0..RETRY_ATTEMPTS {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) => last_err = Some(err),
        }
        if attempt + 1 < RETRY_ATTEMPTS {
            tokio::time::sleep(RETRY_DELAY).await;
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow!("retry failed")))
}

pub(super) fn resolve_path(path: &Path, config_dir: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        config_dir.join(path)
    }
}

pub(super) fn load_config(path: &Path) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    parse_config(&contents, path.parent().unwrap_or_else(|| Path::new(".")))
}

pub(super) fn parse_config(contents: &str, config_dir: &Path) -> Result<Config> {
    let config_file: ConfigFile = toml::from_str(contents).context("parse config")?;

    let catalog_url = config_file.catalog_url.trim().trim_end_matches('/').to_string();
    if catalog_url.is_empty() {
        return Err(anyhow!("catalog_url must not be empty"));
    }
    let page_size = config_file.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
    if page_size == 0 {
        return Err(anyhow!("page_size must be at least 1"));
    }
    let mini_app_url = config_file
        .mini_app_url
        .as_deref()
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .map(|raw| url::Url::parse(raw).with_context(|| format!("parse mini_app_url {}", raw)))
        .transpose()?;
    let http_addr = config_file
        .http_addr
        .as_deref()
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .map(|raw| {
            raw.parse::<SocketAddr>()
                .with_context(|| format!("parse http_addr {}", raw))
        })
        .transpose()?;
    let proxy = config_file
        .proxy
        .map(|proxy| proxy.trim().to_string())
        .filter(|proxy| !proxy.is_empty());

    let sqlite_path = config_file
        .sqlite_path
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SQLITE_PATH));
    let storage_dir = config_file
        .storage_dir
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_DIR));

    Ok(Config {
        token: config_file.token,
        catalog_url,
        proxy,
        sqlite_path: resolve_path(&sqlite_path, config_dir),
        storage_dir: resolve_path(&storage_dir, config_dir),
        mini_app_url,
        http_addr,
        request_timeout_secs: config_file
            .request_timeout_secs
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
        max_file_bytes: config_file.max_file_bytes.unwrap_or(MAX_FILE_BYTES),
        page_size,
    })
}

pub(super) fn parse_command(text: &str) -> Option<&str> {
    let first = text.split_whitespace().next()?;
    if !first.starts_with('/') {
        return None;
    }
    let cmd = first.trim_start_matches('/');
    Some(cmd.split('@').next().unwrap_or(cmd))
}

pub(super) fn build_results_text(page: &RenderedPage) -> String {
    format!(
        "Found: {}\nPage {}/{}",
        page.total_items,
        page.window.page + 1,
        page.window.total_pages
    )
}

pub(super) fn item_button_text(item: &CatalogItem) -> String {
    format!("{} - {}", item.title, item.author)
}

pub(super) fn build_results_keyboard(page: &RenderedPage) -> InlineKeyboardMarkup {
    let mut rows: Vec<Vec<InlineKeyboardButton>> = page
        .items
        .iter()
        .map(|item| {
            vec![InlineKeyboardButton::callback(
                item_button_text(item),
                format!("{}{}", CB_ITEM, item.id),
            )]
        })
        .collect();

    let nav: Vec<InlineKeyboardButton> = page
        .navigation
        .iter()
        .map(|control| match control {
            NavControl::Previous(target) => {
                InlineKeyboardButton::callback("⬅️", format!("{}{}", CB_PAGE, target))
            }
            // Re-requests the current page; harmless when pressed.
            NavControl::Indicator { page, total_pages } => InlineKeyboardButton::callback(
                format!("• {}/{} •", page + 1, total_pages),
                format!("{}{}", CB_PAGE, page),
            ),
            NavControl::Next(target) => {
                InlineKeyboardButton::callback("➡️", format!("{}{}", CB_PAGE, target))
            }
        })
        .collect();
    if !nav.is_empty() {
        rows.push(nav);
    }
    InlineKeyboardMarkup::new(rows)
}

pub(super) fn read_online_keyboard(url: &url::Url) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![InlineKeyboardButton::web_app(
        "Read online",
        WebAppInfo { url: url.clone() },
    )]])
}

pub(super) fn library_text(items: &[LibraryItem]) -> String {
    if items.is_empty() {
        return "Your library is empty. Search for a book and download it.".to_string();
    }
    let mut lines = vec![format!("Your library ({}):", items.len())];
    for (index, item) in items.iter().enumerate() {
        let title = if item.title.is_empty() {
            crate::formats::UNTITLED
        } else {
            &item.title
        };
        let author = if item.author.is_empty() {
            crate::formats::UNKNOWN_AUTHOR
        } else {
            &item.author
        };
        let mut line = format!(
            "{}. {} - {} [{}]",
            index + 1,
            title,
            author,
            item.format.to_uppercase()
        );
        if let Some(location) = item.current_location.as_deref().filter(|l| !l.is_empty()) {
            line.push_str(&format!(", at {}", location));
        }
        lines.push(line);
    }
    lines.join("\n")
}
