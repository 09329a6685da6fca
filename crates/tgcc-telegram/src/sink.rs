//! The chat surface seam.
//!
//! Everything that renders (accumulator, tracker, bridge) talks to a
//! `ChatSink` rather than to teloxide directly, so the rendering pipeline
//! is testable against a recording mock. `TelegramSink` is the production
//! implementation: HTML parse mode with a plain-text fallback, and typed
//! mapping of the two error shapes the pipeline reacts to.

use std::path::Path;

use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{
    ChatAction, InlineKeyboardButton, InlineKeyboardMarkup, InputFile, MessageId, ParseMode,
};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum SinkError {
    /// Telegram rate limit; the payload carries the advertised wait.
    #[error("rate limited, retry after {0}s")]
    RetryAfter(u64),

    /// Edit with identical content — harmless, always swallowed upstream.
    #[error("message is not modified")]
    NotModified,

    #[error("chat API error: {0}")]
    Other(String),
}

/// Minimal chat surface used by the rendering pipeline.
#[async_trait]
pub trait ChatSink: Send + Sync {
    /// Send an HTML message; returns the new message id.
    async fn send_message(&self, chat_id: i64, html: &str) -> Result<i64, SinkError>;

    /// Send an HTML message with one inline button per `(label, data)`
    /// row; returns the new message id.
    async fn send_with_buttons(
        &self,
        chat_id: i64,
        html: &str,
        buttons: &[(String, String)],
    ) -> Result<i64, SinkError>;

    /// Edit a previously sent message in place.
    async fn edit_message(&self, chat_id: i64, message_id: i64, html: &str)
        -> Result<(), SinkError>;

    /// Upload an in-memory photo; returns the new message id.
    async fn send_photo(
        &self,
        chat_id: i64,
        data: Vec<u8>,
        caption: Option<String>,
    ) -> Result<i64, SinkError>;

    async fn send_document(&self, chat_id: i64, path: &Path) -> Result<(), SinkError>;

    async fn send_voice(&self, chat_id: i64, path: &Path) -> Result<(), SinkError>;

    async fn send_typing(&self, chat_id: i64) -> Result<(), SinkError>;
}

/// Production sink over a teloxide `Bot`.
#[derive(Clone)]
pub struct TelegramSink {
    bot: Bot,
}

impl TelegramSink {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

fn map_error(e: teloxide::RequestError) -> SinkError {
    use teloxide::ApiError;
    match e {
        teloxide::RequestError::RetryAfter(secs) => SinkError::RetryAfter(secs.seconds() as u64),
        teloxide::RequestError::Api(ApiError::MessageNotModified) => SinkError::NotModified,
        other => SinkError::Other(other.to_string()),
    }
}

/// Telegram rejects the whole request on bad HTML; retry those as plain
/// text rather than losing the content.
fn is_parse_rejection(e: &SinkError) -> bool {
    matches!(e, SinkError::Other(msg) if msg.contains("can't parse entities"))
}

#[async_trait]
impl ChatSink for TelegramSink {
    async fn send_message(&self, chat_id: i64, html: &str) -> Result<i64, SinkError> {
        let attempt = self
            .bot
            .send_message(ChatId(chat_id), html)
            .parse_mode(ParseMode::Html)
            .await
            .map_err(map_error);

        match attempt {
            Ok(msg) => Ok(msg.id.0 as i64),
            Err(e) if is_parse_rejection(&e) => {
                warn!(error = %e, "HTML rejected, sending plain text");
                self.bot
                    .send_message(ChatId(chat_id), html)
                    .await
                    .map(|msg| msg.id.0 as i64)
                    .map_err(map_error)
            }
            Err(e) => Err(e),
        }
    }

    async fn send_with_buttons(
        &self,
        chat_id: i64,
        html: &str,
        buttons: &[(String, String)],
    ) -> Result<i64, SinkError> {
        let rows: Vec<Vec<InlineKeyboardButton>> = buttons
            .iter()
            .map(|(label, data)| {
                vec![InlineKeyboardButton::callback(label.clone(), data.clone())]
            })
            .collect();
        self.bot
            .send_message(ChatId(chat_id), html)
            .parse_mode(ParseMode::Html)
            .reply_markup(InlineKeyboardMarkup::new(rows))
            .await
            .map(|msg| msg.id.0 as i64)
            .map_err(map_error)
    }

    async fn edit_message(
        &self,
        chat_id: i64,
        message_id: i64,
        html: &str,
    ) -> Result<(), SinkError> {
        let attempt = self
            .bot
            .edit_message_text(ChatId(chat_id), MessageId(message_id as i32), html)
            .parse_mode(ParseMode::Html)
            .await
            .map(|_| ())
            .map_err(map_error);

        match attempt {
            Err(e) if is_parse_rejection(&e) => {
                warn!(error = %e, "HTML rejected on edit, retrying plain");
                self.bot
                    .edit_message_text(ChatId(chat_id), MessageId(message_id as i32), html)
                    .await
                    .map(|_| ())
                    .map_err(map_error)
            }
            other => other,
        }
    }

    async fn send_photo(
        &self,
        chat_id: i64,
        data: Vec<u8>,
        caption: Option<String>,
    ) -> Result<i64, SinkError> {
        let mut req = self
            .bot
            .send_photo(ChatId(chat_id), InputFile::memory(data));
        if let Some(caption) = caption {
            req = req.caption(caption);
        }
        req.await.map(|msg| msg.id.0 as i64).map_err(map_error)
    }

    async fn send_document(&self, chat_id: i64, path: &Path) -> Result<(), SinkError> {
        self.bot
            .send_document(ChatId(chat_id), InputFile::file(path))
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    async fn send_voice(&self, chat_id: i64, path: &Path) -> Result<(), SinkError> {
        self.bot
            .send_voice(ChatId(chat_id), InputFile::file(path))
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    async fn send_typing(&self, chat_id: i64) -> Result<(), SinkError> {
        self.bot
            .send_chat_action(ChatId(chat_id), ChatAction::Typing)
            .await
            .map(|_| ())
            .map_err(map_error)
    }
}
