//! Best-effort extraction of catalog pages. The markup is not under our
//! control, so every field may come back empty and callers must cope.

use super::*;

use regex::Regex;
use std::sync::OnceLock;

const UNKNOWN_AUTHOR: &str = "Unknown";
const NAVIGATION_ACTIONS: [&str; 3] = ["read", "edit", "comments"];
const AUTHOR_NOISE: [&str; 6] = ["ВСЕ", "АВТОРЫ", "АВТОР", "ALL", "AUTHORS", "AUTHOR"];

fn cached(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("static pattern compiles"))
}

fn list_item_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    cached(&RE, r"(?is)<li[^>]*>(.*?)</li>")
}

fn item_link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    cached(
        &RE,
        r#"(?is)<a\s[^>]*href\s*=\s*["']/b/(\d+)["'][^>]*>(.*?)</a>"#,
    )
}

fn author_link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    cached(
        &RE,
        r#"(?is)<a\s[^>]*href\s*=\s*["']/a/[^"']*["'][^>]*>(.*?)</a>"#,
    )
}

fn page_title_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    cached(
        &RE,
        r#"(?is)<h1[^>]*id\s*=\s*["']page-title["'][^>]*>(.*?)</h1>"#,
    )
}

fn heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    cached(&RE, r"(?is)<h1[^>]*>(.*?)</h1>")
}

fn document_title_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    cached(&RE, r"(?is)<title[^>]*>(.*?)</title>")
}

fn image_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    cached(&RE, r#"(?is)<img\s[^>]*src\s*=\s*["']([^"']+)["']"#)
}

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    cached(&RE, r"(?s)<[^>]*>")
}

pub(super) fn parse_search_results(html: &str) -> Vec<CatalogItem> {
    let mut items = Vec::new();
    for block in list_item_re().captures_iter(html) {
        let block = &block[1];
        let Some(link) = item_link_re().captures(block) else {
            continue;
        };
        let authors: Vec<String> = author_link_re()
            .captures_iter(block)
            .map(|author| inner_text(&author[1]))
            .filter(|author| !author.is_empty())
            .collect();
        let author = if authors.is_empty() {
            UNKNOWN_AUTHOR.to_string()
        } else {
            authors.join(", ")
        };
        items.push(CatalogItem {
            id: link[1].to_string(),
            title: inner_text(&link[2]),
            author,
        });
    }
    items
}

pub(super) fn parse_item_details(html: &str, item_id: &str) -> ItemDetails {
    let heading = page_title_re()
        .captures(html)
        .or_else(|| heading_re().captures(html));
    let mut title = heading
        .as_ref()
        .map(|caps| inner_text(&caps[1]))
        .unwrap_or_default();
    if title.is_empty() {
        title = document_title_re()
            .captures(html)
            .map(|caps| inner_text(&caps[1]))
            .unwrap_or_default();
    }

    // Menu links precede the heading, so look for the author after it first.
    let content_start = heading
        .as_ref()
        .and_then(|caps| caps.get(0))
        .map(|m| m.end())
        .unwrap_or(0);
    let author = first_author(&html[content_start..])
        .or_else(|| first_author(html))
        .unwrap_or_default();

    ItemDetails {
        id: item_id.to_string(),
        title: strip_site_suffix(&title),
        author,
        cover_url: find_cover(html),
        formats: parse_formats(html, item_id),
    }
}

fn parse_formats(html: &str, item_id: &str) -> Vec<FormatOption> {
    let pattern = format!(
        r#"(?is)<a\s[^>]*href\s*=\s*["']/b/{}/([^"'/]+)["'][^>]*>(.*?)</a>"#,
        regex::escape(item_id)
    );
    let Ok(format_link_re) = Regex::new(&pattern) else {
        return Vec::new();
    };

    let mut seen = std::collections::HashSet::new();
    let mut formats = Vec::new();
    for caps in format_link_re.captures_iter(html) {
        let raw = &caps[1];
        let path = raw
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .trim()
            .to_string();
        if path.is_empty() {
            continue;
        }
        if NAVIGATION_ACTIONS
            .iter()
            .any(|action| path.eq_ignore_ascii_case(action))
        {
            continue;
        }
        if !seen.insert(path.clone()) {
            continue;
        }
        let mut label = inner_text(&caps[2]);
        if label.is_empty() {
            label = path.to_uppercase();
        }
        formats.push(FormatOption { path, label });
    }
    formats
}

fn first_author(html: &str) -> Option<String> {
    author_link_re()
        .captures_iter(html)
        .map(|caps| normalize_author(&inner_text(&caps[1])))
        .find(|author| !author.is_empty())
}

fn normalize_author(text: &str) -> String {
    let trimmed = text
        .trim()
        .trim_matches(|c| matches!(c, '[' | ']' | '(' | ')'))
        .trim();
    let upper = trimmed.to_uppercase();
    if AUTHOR_NOISE.contains(&upper.as_str()) {
        return String::new();
    }
    trimmed.to_string()
}

fn find_cover(html: &str) -> Option<String> {
    image_re()
        .captures_iter(html)
        .map(|caps| caps[1].trim().to_string())
        .find(|src| {
            let low = src.to_lowercase();
            if src.is_empty() || low.contains("logo") || low.contains("favicon") {
                return false;
            }
            low.contains("cover") || low.contains("/i/")
        })
}

/// Page titles look like "<Book> | <Site>".
fn strip_site_suffix(title: &str) -> String {
    match title.rsplit_once('|') {
        Some((head, _)) => head.trim().to_string(),
        None => title.trim().to_string(),
    }
}

fn inner_text(fragment: &str) -> String {
    let stripped = tag_re().replace_all(fragment, " ");
    let decoded = decode_entities(&stripped);
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn entity_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    cached(&RE, r"&(#[xX][0-9a-fA-F]{1,6}|#[0-9]{1,7}|[a-zA-Z]{2,8});")
}

/// Unknown named entities are left as they are.
pub(super) fn decode_entities(text: &str) -> String {
    entity_re()
        .replace_all(text, |caps: &regex::Captures| {
            let entity = &caps[1];
            match decode_entity(entity) {
                Some(c) => c.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

fn decode_entity(entity: &str) -> Option<char> {
    if let Some(digits) = entity.strip_prefix('#') {
        return decode_numeric_entity(digits);
    }
    let decoded = match entity.to_ascii_lowercase().as_str() {
        "amp" => '&',
        "lt" => '<',
        "gt" => '>',
        "quot" => '"',
        "apos" => '\'',
        "nbsp" => ' ',
        "laquo" => '«',
        "raquo" => '»',
        "ndash" => '–',
        "mdash" => '—',
        "hellip" => '…',
        _ => return None,
    };
    Some(decoded)
}

fn decode_numeric_entity(digits: &str) -> Option<char> {
    let value = match digits.strip_prefix(['x', 'X']) {
        Some(hex) => u32::from_str_radix(hex, 16).ok()?,
        None => digits.parse::<u32>().ok()?,
    };
    // Non-breaking space reads as a plain one in titles.
    if value == 0xA0 {
        return Some(' ');
    }
    char::from_u32(value).filter(|c| *c != '\0')
}
