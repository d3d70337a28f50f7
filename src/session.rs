use super::*;

pub(super) const DEFAULT_PAGE_SIZE: usize = 10;

/// Search results bound to one chat. Replaced wholesale by the next search.
#[derive(Clone, Debug)]
pub(super) struct BrowsingSession {
    pub(super) items: Vec<CatalogItem>,
    pub(super) current_page: usize,
    pub(super) page_size: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct PageWindow {
    pub(super) page: usize,
    pub(super) total_pages: usize,
    pub(super) start: usize,
    pub(super) end: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum NavControl {
    Previous(usize),
    Indicator { page: usize, total_pages: usize },
    Next(usize),
}

#[derive(Clone, Debug)]
pub(super) struct RenderedPage {
    pub(super) total_items: usize,
    pub(super) window: PageWindow,
    pub(super) items: Vec<CatalogItem>,
    pub(super) navigation: Vec<NavControl>,
}

pub(super) fn total_pages(count: usize, page_size: usize) -> usize {
    if count == 0 || page_size == 0 {
        0
    } else {
        (count + page_size - 1) / page_size
    }
}

pub(super) fn clamp_page(page: usize, total_pages: usize) -> usize {
    if total_pages == 0 {
        0
    } else {
        page.min(total_pages - 1)
    }
}

pub(super) fn page_window(count: usize, page_size: usize, requested: usize) -> PageWindow {
    let total_pages = total_pages(count, page_size);
    let page = clamp_page(requested, total_pages);
    let start = (page * page_size).min(count);
    let end = (start + page_size).min(count);
    PageWindow {
        page,
        total_pages,
        start,
        end,
    }
}

/// Empty when everything fits on one page.
pub(super) fn navigation_row(window: &PageWindow) -> Vec<NavControl> {
    if window.total_pages <= 1 {
        return Vec::new();
    }
    let mut row = Vec::with_capacity(3);
    if window.page > 0 {
        row.push(NavControl::Previous(window.page - 1));
    }
    row.push(NavControl::Indicator {
        page: window.page,
        total_pages: window.total_pages,
    });
    if window.page + 1 < window.total_pages {
        row.push(NavControl::Next(window.page + 1));
    }
    row
}

/// Per-chat browsing state. The map never leaves this type; every access is a
/// short critical section with no I/O under the lock.
pub(super) struct SessionStore {
    sessions: Mutex<HashMap<i64, BrowsingSession>>,
    page_size: usize,
}

impl SessionStore {
    pub(super) fn new(page_size: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            page_size: page_size.max(1),
        }
    }

    pub(super) async fn put(&self, chat_id: ChatId, items: Vec<CatalogItem>) {
        let session = BrowsingSession {
            items,
            current_page: 0,
            page_size: self.page_size,
        };
        self.sessions.lock().await.insert(chat_id.0, session);
    }

    #[cfg(test)]
    pub(super) async fn get(&self, chat_id: ChatId) -> Option<BrowsingSession> {
        self.sessions.lock().await.get(&chat_id.0).cloned()
    }

    pub(super) async fn find_item(&self, chat_id: ChatId, item_id: &str) -> Option<CatalogItem> {
        let sessions = self.sessions.lock().await;
        sessions
            .get(&chat_id.0)?
            .items
            .iter()
            .find(|item| item.id == item_id)
            .cloned()
    }

    /// Clamps `requested` into range and stores it as the session's cursor.
    /// `None` means there is nothing to page through: the chat has no session
    /// or its result list is empty.
    pub(super) async fn render_page(&self, chat_id: ChatId, requested: usize) -> Option<RenderedPage> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.get_mut(&chat_id.0)?;
        if session.items.is_empty() {
            return None;
        }

        let window = page_window(session.items.len(), session.page_size, requested);
        session.current_page = window.page;

        Some(RenderedPage {
            total_items: session.items.len(),
            window,
            items: session.items[window.start..window.end].to_vec(),
            navigation: navigation_row(&window),
        })
    }
}
