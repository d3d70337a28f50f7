use super::*;
use crate::helpers::{
    build_results_keyboard, build_results_text, library_text, notify, parse_command, UserNotice,
    HELP_TEXT,
};

/// Sender identity, when the message has one.
#[derive(Debug, Clone)]
pub(super) struct Sender {
    pub(super) user_id: i64,
    pub(super) username: String,
}

pub(super) async fn handle_message(bot: Bot, msg: Message, state: Arc<AppState>) -> Result<()> {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let sender = msg.from().map(|user| Sender {
        user_id: i64::try_from(user.id.0).unwrap_or(i64::MAX),
        username: user.username.clone().unwrap_or_default(),
    });
    handle_text(&bot, &state, msg.chat.id, sender, text).await
}

pub(super) async fn handle_text(
    transport: &dyn ChatTransport,
    state: &AppState,
    chat_id: ChatId,
    sender: Option<Sender>,
    text: &str,
) -> Result<()> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(());
    }

    match parse_command(text) {
        Some("start") | Some("help") => {
            transport.send_text(chat_id, HELP_TEXT).await?;
        }
        Some("library") => {
            let Some(sender) = sender else {
                return Ok(());
            };
            show_library(transport, state, chat_id, &sender).await?;
        }
        // Unknown commands are searched as typed.
        Some(other) => {
            debug!("unknown command /{}, searching", other);
            run_search(transport, state, chat_id, text).await?;
        }
        None => run_search(transport, state, chat_id, text).await?,
    }
    Ok(())
}

async fn show_library(
    transport: &dyn ChatTransport,
    state: &AppState,
    chat_id: ChatId,
    sender: &Sender,
) -> Result<()> {
    let items = match state.library.list_library(sender.user_id).await {
        Ok(items) => items,
        Err(err) => {
            error!("library listing failed: {:#}", err);
            transport
                .send_text(chat_id, "Could not load your library.")
                .await?;
            return Ok(());
        }
    };
    transport.send_text(chat_id, &library_text(&items)).await?;
    Ok(())
}

/// Runs a catalog search, replaces the chat's session and shows page one.
pub(super) async fn run_search(
    transport: &dyn ChatTransport,
    state: &AppState,
    chat_id: ChatId,
    query: &str,
) -> Result<()> {
    transport
        .send_text(chat_id, &format!("Searching: {}...", query))
        .await?;

    let items = match state.catalog.search(query).await {
        Ok(items) => items,
        Err(err) => {
            error!("search for {:?} failed: {:#}", query, err);
            notify(transport, chat_id, UserNotice::SearchFailed).await;
            return Ok(());
        }
    };
    if items.is_empty() {
        notify(transport, chat_id, UserNotice::NothingFound).await;
        return Ok(());
    }
    info!("search {:?}: {} results for chat {}", query, items.len(), chat_id.0);

    state.sessions.put(chat_id, items).await;
    let Some(page) = state.sessions.render_page(chat_id, 0).await else {
        notify(transport, chat_id, UserNotice::StaleSession).await;
        return Ok(());
    };
    transport
        .send_keyboard(chat_id, &build_results_text(&page), build_results_keyboard(&page))
        .await?;
    Ok(())
}
