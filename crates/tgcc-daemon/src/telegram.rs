//! Telegram front end: long-polling dispatcher, allow-list guard,
//! command interception, media extraction, batcher hand-off.

use std::sync::Arc;

use base64::Engine;
use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{BotCommand, MediaKind, MessageKind};
use tracing::{info, warn};

use tgcc_protocol::outbound::{ContentBlock, ImageSource, Outbound};

use crate::batcher::MessageBatcher;
use crate::bridge::AgentBridge;
use crate::commands;

/// Everything the message handlers need, injected via dptree.
pub struct AgentRuntime {
    pub bridge: Arc<AgentBridge>,
    pub batcher: MessageBatcher,
}

/// Publish the command menu so clients get completion for `/`.
pub async fn publish_command_menu(bot: &Bot) {
    let menu: Vec<BotCommand> = commands::COMMAND_MENU
        .iter()
        .map(|(name, description)| BotCommand::new(name.to_string(), description.to_string()))
        .collect();
    if let Err(e) = bot.set_my_commands(menu).await {
        warn!(error = %e, "setMyCommands failed");
    }
}

/// Drive the long-polling loop until the process exits.
pub async fn run_bot(bot: Bot, runtime: Arc<AgentRuntime>) {
    publish_command_menu(&bot).await;
    info!(agent = %runtime.bridge.agent_id(), "starting Telegram dispatcher");

    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint(handle_message))
        .branch(Update::filter_callback_query().endpoint(handle_callback));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![runtime])
        .default_handler(|_upd| async {})
        .build()
        .dispatch()
        .await;
}

async fn handle_message(bot: Bot, msg: Message, runtime: Arc<AgentRuntime>) -> ResponseResult<()> {
    // Ignore other bots.
    if msg.from.as_ref().map(|u| u.is_bot).unwrap_or(false) {
        return Ok(());
    }
    let Some(from) = msg.from.as_ref() else {
        return Ok(());
    };
    let user_id = from.id.0 as i64;
    let chat_id = msg.chat.id.0;

    // Deny-by-default allow list.
    if !runtime.bridge.is_user_allowed(user_id) {
        return Ok(());
    }

    let text = msg.text().or(msg.caption()).unwrap_or("").to_string();

    // Command interception; unknown slash input falls through to the CLI.
    if text.starts_with('/') {
        if let Some(command) = commands::parse(&text) {
            commands::execute(&runtime.bridge, chat_id, user_id, command).await;
            return Ok(());
        }
    }

    // Media flushes the batch window immediately.
    if let Some(blocks) = extract_media(&bot, &runtime, &msg, &text).await {
        runtime.batcher.flush(chat_id, user_id);
        match blocks {
            MediaPayload::Blocks(blocks) => {
                runtime.bridge.deliver_blocks(chat_id, user_id, blocks).await;
            }
            MediaPayload::Document(message) => {
                let bridge = Arc::clone(&runtime.bridge);
                let (chat, user) = (chat_id, user_id);
                // Already a complete user-message.
                bridge.deliver_outbound(chat, user, message).await;
            }
        }
        return Ok(());
    }

    if text.is_empty() {
        return Ok(());
    }
    runtime.batcher.push(chat_id, user_id, &text);
    Ok(())
}

async fn handle_callback(
    bot: Bot,
    query: CallbackQuery,
    runtime: Arc<AgentRuntime>,
) -> ResponseResult<()> {
    let user_id = query.from.id.0 as i64;
    if !runtime.bridge.is_user_allowed(user_id) {
        return Ok(());
    }
    // Dismiss the button spinner regardless of outcome.
    let _ = bot.answer_callback_query(query.id.clone()).await;

    let Some(data) = query.data.as_deref() else {
        return Ok(());
    };
    let chat_id = query
        .message
        .as_ref()
        .map(|m| m.chat().id.0)
        .unwrap_or(user_id);
    commands::handle_callback(&runtime.bridge, chat_id, user_id, data).await;
    Ok(())
}

enum MediaPayload {
    /// Photo turn: text + base64 image blocks.
    Blocks(Vec<ContentBlock>),
    /// Document turn: a text message naming the saved file.
    Document(Outbound),
}

/// Pull attachments off a message. Photos are downloaded and inlined as
/// base64 blocks; documents are saved under the media dir and referenced
/// by path so the CLI opens them itself.
async fn extract_media(
    bot: &Bot,
    runtime: &Arc<AgentRuntime>,
    msg: &Message,
    caption: &str,
) -> Option<MediaPayload> {
    let MessageKind::Common(common) = &msg.kind else {
        return None;
    };

    match &common.media_kind {
        MediaKind::Photo(photo) => {
            // Largest resolution is last.
            let size = photo.photo.last()?;
            let data = download(bot, &size.file.id).await?;
            let mut blocks = Vec::new();
            if !caption.is_empty() {
                blocks.push(ContentBlock::Text {
                    text: caption.to_string(),
                });
            }
            blocks.push(ContentBlock::Image {
                source: ImageSource::base64(
                    "image/jpeg",
                    base64::engine::general_purpose::STANDARD.encode(&data),
                ),
            });
            Some(MediaPayload::Blocks(blocks))
        }
        MediaKind::Document(document) => {
            let filename = document
                .document
                .file_name
                .clone()
                .unwrap_or_else(|| "attachment.bin".to_string());
            let data = download(bot, &document.document.file.id).await?;

            let media_dir = &runtime.bridge.global().media_dir;
            if std::fs::create_dir_all(media_dir).is_err() {
                return None;
            }
            let path = media_dir.join(format!("{}-{filename}", msg.id.0));
            if std::fs::write(&path, &data).is_err() {
                warn!(path = %path.display(), "failed to persist incoming document");
                return None;
            }
            let mut message = Outbound::document(&path.to_string_lossy(), &filename);
            if !caption.is_empty() {
                message = Outbound::text(format!(
                    "{caption}\n\nThe user attached a file: {filename}\nIt is saved at: {}",
                    path.display()
                ));
            }
            Some(MediaPayload::Document(message))
        }
        _ => None,
    }
}

async fn download(bot: &Bot, file_id: &str) -> Option<Vec<u8>> {
    let file = bot.get_file(file_id.to_string()).await.ok()?;
    let mut buffer = Vec::new();
    bot.download_file(&file.path, &mut buffer).await.ok()?;
    Some(buffer)
}
