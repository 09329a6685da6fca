//! Short-window message batcher.
//!
//! Telegram users often send a thought as several quick messages; the
//! batcher merges consecutive text messages per (chat, user) within a 2 s
//! window into one user-message. Media flushes the window immediately so
//! attachment ordering is preserved. Merging never reorders.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// One merged user input ready for the CLI.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub chat_id: i64,
    pub user_id: i64,
    pub text: String,
}

struct Pending {
    text: String,
    timer: JoinHandle<()>,
}

/// Per-agent batcher; emits merged batches on an unbounded channel.
#[derive(Clone)]
pub struct MessageBatcher {
    window: Duration,
    out: mpsc::UnboundedSender<Batch>,
    pending: Arc<Mutex<HashMap<(i64, i64), Pending>>>,
}

impl MessageBatcher {
    pub fn new(window: Duration) -> (Self, mpsc::UnboundedReceiver<Batch>) {
        let (out, rx) = mpsc::unbounded_channel();
        (
            Self {
                window,
                out,
                pending: Arc::new(Mutex::new(HashMap::new())),
            },
            rx,
        )
    }

    /// Buffer one text message; the batch flushes when the window closes.
    pub fn push(&self, chat_id: i64, user_id: i64, text: &str) {
        let key = (chat_id, user_id);
        let mut pending = self.pending.lock().unwrap();

        if let Some(entry) = pending.get_mut(&key) {
            entry.text.push('\n');
            entry.text.push_str(text);
            return;
        }

        let this = self.clone();
        let window = self.window;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            this.flush(chat_id, user_id);
        });
        pending.insert(
            key,
            Pending {
                text: text.to_string(),
                timer,
            },
        );
    }

    /// Emit whatever is buffered for (chat, user) right now. Used by the
    /// window timer and by media arrivals.
    pub fn flush(&self, chat_id: i64, user_id: i64) {
        let entry = self.pending.lock().unwrap().remove(&(chat_id, user_id));
        if let Some(entry) = entry {
            entry.timer.abort();
            let _ = self.out.send(Batch {
                chat_id,
                user_id,
                text: entry.text,
            });
        }
    }

    /// Flush every outstanding window (shutdown path).
    pub fn flush_all(&self) {
        let keys: Vec<(i64, i64)> = self.pending.lock().unwrap().keys().copied().collect();
        for (chat_id, user_id) in keys {
            self.flush(chat_id, user_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn merges_messages_within_window() {
        let (batcher, mut rx) = MessageBatcher::new(Duration::from_millis(50));
        batcher.push(1, 7, "first");
        batcher.push(1, 7, "second");

        let batch = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.text, "first\nsecond");
        assert_eq!(batch.chat_id, 1);
    }

    #[tokio::test]
    async fn separate_chats_do_not_merge() {
        let (batcher, mut rx) = MessageBatcher::new(Duration::from_millis(30));
        batcher.push(1, 7, "one");
        batcher.push(2, 7, "two");

        let a = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        let b = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        let mut texts = vec![a.text, b.text];
        texts.sort();
        assert_eq!(texts, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn explicit_flush_preempts_the_window() {
        let (batcher, mut rx) = MessageBatcher::new(Duration::from_secs(60));
        batcher.push(1, 7, "buffered");
        batcher.flush(1, 7);

        let batch = timeout(Duration::from_millis(100), rx.recv())
            .await
            .expect("flush must emit immediately")
            .unwrap();
        assert_eq!(batch.text, "buffered");
    }

    #[tokio::test]
    async fn flush_without_pending_emits_nothing() {
        let (batcher, mut rx) = MessageBatcher::new(Duration::from_millis(30));
        batcher.flush(1, 7);
        assert!(
            timeout(Duration::from_millis(80), rx.recv()).await.is_err(),
            "no batch expected"
        );
    }
}
