//! Typing indicator — refreshes `sendChatAction` every 4 seconds.
//!
//! Telegram's typing status expires after ~5 seconds, so we refresh every
//! 4 s. `TypingHandle::stop()` aborts the loop immediately.

use std::sync::Arc;
use std::time::Duration;

use crate::sink::ChatSink;

const REFRESH_INTERVAL: Duration = Duration::from_secs(4);

/// Handle to a background typing indicator task.
pub struct TypingHandle {
    chat_id: i64,
    task: tokio::task::JoinHandle<()>,
}

impl TypingHandle {
    /// Send the typing action immediately, then every 4 seconds.
    pub fn start(sink: Arc<dyn ChatSink>, chat_id: i64) -> Self {
        let task = tokio::spawn(async move {
            loop {
                let _ = sink.send_typing(chat_id).await;
                tokio::time::sleep(REFRESH_INTERVAL).await;
            }
        });
        TypingHandle { chat_id, task }
    }

    pub fn chat_id(&self) -> i64 {
        self.chat_id
    }

    /// Abort the refresh loop.
    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for TypingHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
