use super::*;

use teloxide::types::InputFile;

/// Outbound side of the chat platform. Handlers only talk to this trait so
/// they can run against a recording fake in tests.
#[async_trait]
pub(super) trait ChatTransport: Send + Sync {
    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<MessageId>;

    async fn send_keyboard(
        &self,
        chat_id: ChatId,
        text: &str,
        keyboard: InlineKeyboardMarkup,
    ) -> Result<MessageId>;

    async fn edit_keyboard(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        text: &str,
        keyboard: InlineKeyboardMarkup,
    ) -> Result<()>;

    async fn send_cover_card(
        &self,
        chat_id: ChatId,
        cover: Vec<u8>,
        caption: &str,
        keyboard: InlineKeyboardMarkup,
    ) -> Result<()>;

    async fn send_file(
        &self,
        chat_id: ChatId,
        path: &Path,
        caption: &str,
        keyboard: Option<InlineKeyboardMarkup>,
    ) -> Result<()>;

    async fn remove_message(&self, chat_id: ChatId, message_id: MessageId) -> Result<()>;

    async fn answer_callback(&self, callback_id: &str, text: &str) -> Result<()>;
}

fn is_message_not_modified_error(err: &teloxide::RequestError) -> bool {
    err.to_string()
        .to_ascii_lowercase()
        .contains("message is not modified")
}

#[async_trait]
impl ChatTransport for Bot {
    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<MessageId> {
        let sent = self.send_message(chat_id, text).await?;
        Ok(sent.id)
    }

    async fn send_keyboard(
        &self,
        chat_id: ChatId,
        text: &str,
        keyboard: InlineKeyboardMarkup,
    ) -> Result<MessageId> {
        let sent = self
            .send_message(chat_id, text)
            .reply_markup(keyboard)
            .await?;
        Ok(sent.id)
    }

    async fn edit_keyboard(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        text: &str,
        keyboard: InlineKeyboardMarkup,
    ) -> Result<()> {
        // Pressing the page indicator re-renders the same page.
        match self
            .edit_message_text(chat_id, message_id, text)
            .reply_markup(keyboard)
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if is_message_not_modified_error(&err) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn send_cover_card(
        &self,
        chat_id: ChatId,
        cover: Vec<u8>,
        caption: &str,
        keyboard: InlineKeyboardMarkup,
    ) -> Result<()> {
        self.send_photo(chat_id, InputFile::memory(cover).file_name("cover.jpg"))
            .caption(caption)
            .reply_markup(keyboard)
            .await?;
        Ok(())
    }

    async fn send_file(
        &self,
        chat_id: ChatId,
        path: &Path,
        caption: &str,
        keyboard: Option<InlineKeyboardMarkup>,
    ) -> Result<()> {
        let mut request = self
            .send_document(chat_id, InputFile::file(path.to_path_buf()))
            .caption(caption);
        if let Some(keyboard) = keyboard {
            request = request.reply_markup(keyboard);
        }
        request.await?;
        Ok(())
    }

    async fn remove_message(&self, chat_id: ChatId, message_id: MessageId) -> Result<()> {
        self.delete_message(chat_id, message_id).await?;
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str, text: &str) -> Result<()> {
        let mut request = self.answer_callback_query(callback_id);
        if !text.is_empty() {
            request = request.text(text);
        }
        request.await?;
        Ok(())
    }
}
