use super::*;
use crate::download::{download_and_deliver, DownloadRequest};
use crate::formats::{build_format_keyboard, details_caption, resolve_details};
use crate::helpers::{build_results_keyboard, build_results_text, notify, UserNotice};

use thiserror::Error;

pub(super) const CB_ITEM: &str = "book:";
pub(super) const CB_PAGE: &str = "page:";
pub(super) const CB_DOWNLOAD: &str = "dl:";

const ACK_PAGE: &str = "Turning the page...";
const ACK_ITEM: &str = "Opening...";
const ACK_DOWNLOAD: &str = "Starting download...";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub(super) enum CallbackError {
    #[error("invalid page index {0:?}")]
    BadPage(String),
    #[error("missing item id")]
    MissingItem,
    #[error("malformed download payload {0:?}")]
    BadFormat(String),
}

impl CallbackError {
    fn notice(&self) -> UserNotice {
        match self {
            CallbackError::BadPage(_) => UserNotice::BadPage,
            CallbackError::MissingItem | CallbackError::BadFormat(_) => UserNotice::BadFormat,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum CallbackAction {
    Paginate(usize),
    SelectItem(String),
    SelectFormat { item_id: String, format_path: String },
    /// Unprefixed payload from keyboards sent before prefixes existed.
    Legacy(String),
    Malformed(CallbackError),
    Ignored,
}

/// Classifies a callback payload by prefix. Never fails: bad payloads come
/// back as `Malformed`.
pub(super) fn decode_callback(data: &str) -> CallbackAction {
    if let Some(raw) = data.strip_prefix(CB_PAGE) {
        return match raw.trim().parse::<i64>() {
            Ok(page) => CallbackAction::Paginate(usize::try_from(page).unwrap_or(0)),
            Err(_) => CallbackAction::Malformed(CallbackError::BadPage(raw.to_string())),
        };
    }

    if let Some(raw) = data.strip_prefix(CB_ITEM) {
        let item_id = raw.trim();
        if item_id.is_empty() {
            return CallbackAction::Malformed(CallbackError::MissingItem);
        }
        return CallbackAction::SelectItem(item_id.to_string());
    }

    if let Some(raw) = data.strip_prefix(CB_DOWNLOAD) {
        // Split on the first separator only; format paths may contain ':'.
        let mut parts = raw.splitn(2, ':');
        let item_id = parts.next().unwrap_or_default().trim();
        let format_path = parts.next().unwrap_or_default().trim();
        if item_id.is_empty() || format_path.is_empty() {
            return CallbackAction::Malformed(CallbackError::BadFormat(raw.to_string()));
        }
        return CallbackAction::SelectFormat {
            item_id: item_id.to_string(),
            format_path: format_path.to_string(),
        };
    }

    let legacy = data.trim();
    if legacy.is_empty() {
        return CallbackAction::Ignored;
    }
    if !legacy.chars().all(|c| c.is_ascii_digit()) {
        warn!("unprefixed callback payload {:?} treated as item id", legacy);
    }
    CallbackAction::Legacy(legacy.to_string())
}

/// A callback query reduced to what the state machine needs.
#[derive(Debug, Clone)]
pub(super) struct Interaction {
    pub(super) callback_id: String,
    pub(super) chat_id: ChatId,
    pub(super) message_id: Option<MessageId>,
    pub(super) user_id: i64,
    pub(super) username: String,
    pub(super) data: String,
}

impl Interaction {
    fn from_query(q: &CallbackQuery) -> Option<Self> {
        let message = q.message.as_ref()?;
        Some(Self {
            callback_id: q.id.clone(),
            chat_id: message.chat.id,
            message_id: Some(message.id),
            user_id: i64::try_from(q.from.id.0).unwrap_or(i64::MAX),
            username: q.from.username.clone().unwrap_or_default(),
            data: q.data.clone().unwrap_or_default(),
        })
    }
}

pub(super) async fn handle_callback(bot: Bot, q: CallbackQuery, state: Arc<AppState>) -> Result<()> {
    let Some(interaction) = Interaction::from_query(&q) else {
        // Inline-mode callbacks carry no chat; just clear the spinner.
        bot.answer_callback_query(q.id).await?;
        return Ok(());
    };
    dispatch_callback(&bot, &state, interaction).await;
    Ok(())
}

pub(super) async fn dispatch_callback(
    transport: &dyn ChatTransport,
    state: &AppState,
    interaction: Interaction,
) {
    let action = decode_callback(&interaction.data);
    debug!(
        "callback from chat {}: {:?}",
        interaction.chat_id.0, action
    );
    let ack = match &action {
        CallbackAction::Paginate(_) => ACK_PAGE,
        CallbackAction::SelectItem(_) | CallbackAction::Legacy(_) => ACK_ITEM,
        CallbackAction::SelectFormat { .. } => ACK_DOWNLOAD,
        CallbackAction::Ignored | CallbackAction::Malformed(_) => "",
    };
    if let Err(err) = transport.answer_callback(&interaction.callback_id, ack).await {
        warn!("failed to answer callback: {:#}", err);
    }

    match action {
        CallbackAction::Ignored => {}
        CallbackAction::Paginate(page) => {
            show_page(transport, state, interaction.chat_id, interaction.message_id, page).await;
        }
        CallbackAction::SelectItem(item_id) | CallbackAction::Legacy(item_id) => {
            show_item_card(transport, state, interaction.chat_id, &item_id).await;
        }
        CallbackAction::SelectFormat {
            item_id,
            format_path,
        } => {
            let request = DownloadRequest {
                chat_id: interaction.chat_id,
                user_id: interaction.user_id,
                username: interaction.username,
                item_id,
                format_path,
            };
            // Failures are already reported to the chat.
            let _ = download_and_deliver(transport, state, &request).await;
        }
        CallbackAction::Malformed(err) => {
            warn!("malformed callback {:?}: {}", interaction.data, err);
            notify(transport, interaction.chat_id, err.notice()).await;
        }
    }
}

/// Re-renders the result list in place, or sends it fresh when there is no
/// message to edit.
async fn show_page(
    transport: &dyn ChatTransport,
    state: &AppState,
    chat_id: ChatId,
    message_id: Option<MessageId>,
    page: usize,
) {
    let Some(rendered) = state.sessions.render_page(chat_id, page).await else {
        notify(transport, chat_id, UserNotice::StaleSession).await;
        return;
    };
    let text = build_results_text(&rendered);
    let keyboard = build_results_keyboard(&rendered);

    let result = match message_id {
        Some(message_id) => transport
            .edit_keyboard(chat_id, message_id, &text, keyboard)
            .await,
        None => transport
            .send_keyboard(chat_id, &text, keyboard)
            .await
            .map(|_| ()),
    };
    if let Err(err) = result {
        error!("failed to show page {}: {:#}", page, err);
    }
}

async fn show_item_card(transport: &dyn ChatTransport, state: &AppState, chat_id: ChatId, item_id: &str) {
    let details =
        match resolve_details(state.catalog.as_ref(), &state.sessions, chat_id, item_id).await {
            Ok(details) => details,
            Err(err) => {
                error!("details for {} failed: {:#}", item_id, err);
                notify(transport, chat_id, UserNotice::DetailsFailed).await;
                return;
            }
        };

    let caption = details_caption(&details);
    let keyboard = build_format_keyboard(item_id, &details.formats);

    if let Some(cover_url) = details.cover_url.as_deref() {
        match state.catalog.fetch_bytes(cover_url).await {
            Ok(cover) if !cover.is_empty() => {
                match transport
                    .send_cover_card(chat_id, cover, &caption, keyboard.clone())
                    .await
                {
                    Ok(()) => return,
                    Err(err) => warn!("cover card for {} failed, sending text: {:#}", item_id, err),
                }
            }
            Ok(_) => debug!("empty cover for {}", item_id),
            Err(err) => warn!("cover fetch for {} failed: {:#}", item_id, err),
        }
    }

    if let Err(err) = transport.send_keyboard(chat_id, &caption, keyboard).await {
        error!("failed to send card for {}: {:#}", item_id, err);
    }
}
