use super::*;
use crate::callback_handlers::CB_DOWNLOAD;

use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

pub(super) const UNTITLED: &str = "Untitled";
pub(super) const UNKNOWN_AUTHOR: &str = "Unknown author";
pub(super) const FALLBACK_FORMATS: [&str; 3] = ["epub", "fb2", "pdf"];
const BUTTONS_PER_ROW: usize = 2;

fn trailing_parens_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\(([^)]+)\)\s*$").expect("static pattern compiles"))
}

fn size_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b\d+(?:[.,]\d+)?\s*(?:kb|mb|gb|kib|mib|gib|кб|мб|гб)\b")
            .expect("static pattern compiles")
    })
}

/// Fetches details for `item_id` and applies the display policies. Network
/// failures are returned as-is.
pub(super) async fn resolve_details(
    catalog: &dyn Catalog,
    sessions: &SessionStore,
    chat_id: ChatId,
    item_id: &str,
) -> Result<ItemDetails> {
    let mut details = catalog
        .fetch_details(item_id)
        .await
        .with_context(|| format!("fetch details for {}", item_id))?;
    let known = sessions.find_item(chat_id, item_id).await;
    prefer_session_metadata(&mut details, known.as_ref());
    fill_placeholders(&mut details);
    details.cover_url = resolve_cover_url(catalog.base_url(), details.cover_url.take());
    details.formats = selectable_formats(std::mem::take(&mut details.formats));
    Ok(details)
}

/// Title and author captured from the result list beat whatever the detail
/// page yielded.
pub(super) fn prefer_session_metadata(details: &mut ItemDetails, known: Option<&CatalogItem>) {
    if let Some(item) = known {
        details.title = item.title.clone();
        details.author = item.author.clone();
    }
}

pub(super) fn fill_placeholders(details: &mut ItemDetails) {
    if details.title.trim().is_empty() {
        details.title = UNTITLED.to_string();
    }
    if details.author.trim().is_empty() {
        details.author = UNKNOWN_AUTHOR.to_string();
    }
}

/// Root-relative references are joined onto the catalog base; anything else
/// is passed through.
pub(super) fn resolve_cover_url(base_url: &str, cover: Option<String>) -> Option<String> {
    let cover = cover?.trim().to_string();
    if cover.is_empty() {
        return None;
    }
    if cover.starts_with('/') && !cover.starts_with("//") {
        return Some(format!("{}{}", base_url.trim_end_matches('/'), cover));
    }
    Some(cover)
}

/// Drops empty and duplicate paths (first one wins), then sorts by the
/// uppercased path. The sort is stable so ties keep catalog order.
pub(super) fn selectable_formats(formats: Vec<FormatOption>) -> Vec<FormatOption> {
    let mut seen = HashSet::new();
    let mut unique: Vec<FormatOption> = formats
        .into_iter()
        .map(|mut option| {
            option.path = option.path.trim().to_string();
            option
        })
        .filter(|option| !option.path.is_empty() && seen.insert(option.path.clone()))
        .collect();
    unique.sort_by_key(|option| option.path.to_uppercase());
    unique
}

pub(super) fn format_button_text(option: &FormatOption) -> String {
    let format = option.path.trim().to_uppercase();
    let label = option.label.trim();
    if label.is_empty() {
        return format;
    }

    if let Some(caps) = trailing_parens_re().captures(label) {
        let suffix = caps[1].trim();
        if suffix.eq_ignore_ascii_case(option.path.trim()) {
            return format;
        }
        return format!("{} ({})", format, suffix);
    }

    if let Some(size) = size_token_re().find(label) {
        return format!("{} ({})", format, size.as_str().trim());
    }

    format
}

pub(super) fn download_callback_data(item_id: &str, format_path: &str) -> String {
    format!("{}{}:{}", CB_DOWNLOAD, item_id, format_path)
}

/// Two buttons per row; with no known formats, one row per fallback format.
pub(super) fn build_format_keyboard(item_id: &str, formats: &[FormatOption]) -> InlineKeyboardMarkup {
    if formats.is_empty() {
        let rows = FALLBACK_FORMATS
            .iter()
            .map(|format| {
                vec![InlineKeyboardButton::callback(
                    format.to_uppercase(),
                    download_callback_data(item_id, format),
                )]
            })
            .collect::<Vec<_>>();
        return InlineKeyboardMarkup::new(rows);
    }

    let rows = formats
        .chunks(BUTTONS_PER_ROW)
        .map(|chunk| {
            chunk
                .iter()
                .map(|option| {
                    InlineKeyboardButton::callback(
                        format_button_text(option),
                        download_callback_data(item_id, &option.path),
                    )
                })
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>();
    InlineKeyboardMarkup::new(rows)
}

pub(super) fn details_caption(details: &ItemDetails) -> String {
    format!("{}\n{}", details.title, details.author)
}
