//! Stream accumulator: folds the CLI's fine-grained deltas into one
//! Telegram message per turn, edited in place.
//!
//! All chat calls go through a single `tokio::sync::Mutex` held across
//! the call, so concurrent handlers cannot race to create two messages:
//! the first caller owns creation, everyone after it edits. Edits are
//! throttled to one per interval with a single deferred timer; Telegram
//! rate limits back the interval off up to a cap and retry the same edit.

use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use tgcc_core::types::TurnUsage;
use tgcc_protocol::events::{BlockDelta, BlockStart, StreamEvent};

use crate::html;
use crate::sink::{ChatSink, SinkError};

/// Upper bound for the backed-off edit interval.
const EDIT_INTERVAL_CAP: Duration = Duration::from_secs(5);
/// Thinking content kept in the final blockquote.
const THINKING_LIMIT: usize = 1024;

#[derive(Debug, Clone)]
pub struct AccumOptions {
    /// Minimum time between in-place edits.
    pub edit_interval: Duration,
    /// Characters of source text before the message is split.
    pub split_threshold: usize,
}

impl Default for AccumOptions {
    fn default() -> Self {
        Self {
            edit_interval: Duration::from_millis(1000),
            split_threshold: 4000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActiveBlock {
    None,
    Text,
    Thinking,
    ToolUse,
    Image,
}

struct AccumState {
    message_id: Option<i64>,
    text: String,
    thinking: String,
    image_b64: String,
    block: ActiveBlock,
    last_edit_at: Option<Instant>,
    edit_interval: Duration,
    pending_edit: bool,
    /// Bumped on reset/finalize so deferred timers no-op.
    generation: u64,
    tool_indicators: Vec<String>,
    message_ids: Vec<i64>,
    usage: Option<TurnUsage>,
    finished: bool,
}

/// One accumulator per (process, chat) pair. Cheap to clone.
#[derive(Clone)]
pub struct StreamAccumulator {
    sink: Arc<dyn ChatSink>,
    chat_id: i64,
    opts: AccumOptions,
    state: Arc<Mutex<AccumState>>,
}

impl StreamAccumulator {
    pub fn new(sink: Arc<dyn ChatSink>, chat_id: i64, opts: AccumOptions) -> Self {
        Self {
            sink,
            chat_id,
            state: Arc::new(Mutex::new(AccumState {
                message_id: None,
                text: String::new(),
                thinking: String::new(),
                image_b64: String::new(),
                block: ActiveBlock::None,
                last_edit_at: None,
                edit_interval: opts.edit_interval,
                pending_edit: false,
                generation: 0,
                tool_indicators: Vec::new(),
                message_ids: Vec::new(),
                usage: None,
                finished: false,
            })),
            opts,
        }
    }

    /// Fold one streaming event.
    pub async fn handle(&self, event: &StreamEvent) {
        match event {
            StreamEvent::MessageStart => self.soft_reset().await,
            StreamEvent::ContentBlockStart { block, .. } => match block {
                BlockStart::Text => {
                    let mut s = self.state.lock().await;
                    s.block = ActiveBlock::Text;
                    // Narrative resumed; tool indicators are stale.
                    s.tool_indicators.clear();
                }
                BlockStart::Thinking => {
                    let mut s = self.state.lock().await;
                    s.block = ActiveBlock::Thinking;
                    if s.text.is_empty() && !s.finished {
                        let placeholder = html::expandable_quote("💭 Thinking…");
                        self.emit(&mut s, &placeholder).await;
                    }
                }
                BlockStart::ToolUse { name, .. } => {
                    let mut s = self.state.lock().await;
                    s.block = ActiveBlock::ToolUse;
                    s.tool_indicators.push(name.clone());
                    self.throttled_flush(&mut s).await;
                }
                BlockStart::Image => {
                    let mut s = self.state.lock().await;
                    s.block = ActiveBlock::Image;
                    s.image_b64.clear();
                }
            },
            StreamEvent::ContentBlockDelta { delta, .. } => match delta {
                BlockDelta::Text(t) => {
                    if t.is_empty() {
                        return;
                    }
                    let mut s = self.state.lock().await;
                    s.text.push_str(t);
                    self.throttled_flush(&mut s).await;
                }
                BlockDelta::Thinking(t) => {
                    let mut s = self.state.lock().await;
                    s.thinking.push_str(t);
                }
                BlockDelta::Image(data) => {
                    let mut s = self.state.lock().await;
                    s.image_b64.push_str(data);
                }
                // Tool input streams to the sub-agent tracker, not here.
                BlockDelta::InputJson(_) => {}
            },
            StreamEvent::ContentBlockStop { .. } => {
                let mut s = self.state.lock().await;
                if s.block == ActiveBlock::Image {
                    self.deliver_image(&mut s).await;
                }
                s.block = ActiveBlock::None;
            }
            StreamEvent::MessageStop => self.finalize().await,
        }
    }

    /// Attach the turn's usage before finalization.
    pub async fn set_usage(&self, usage: TurnUsage) {
        self.state.lock().await.usage = Some(usage);
    }

    /// Final edit: thinking blockquote + rendered body + usage footer.
    /// Idempotent — the second call is a no-op.
    pub async fn finalize(&self) {
        let mut s = self.state.lock().await;
        if s.finished {
            return;
        }
        s.finished = true;
        s.generation += 1;
        s.pending_edit = false;

        let mut final_html = String::new();
        if !s.thinking.is_empty() {
            let shown = truncate_chars(&s.thinking, THINKING_LIMIT);
            final_html.push_str(&html::expandable_quote(&html::escape_html(&shown)));
        }
        if !s.text.is_empty() {
            if !final_html.is_empty() {
                final_html.push('\n');
            }
            final_html.push_str(self.render_body(&s).trim_end());
        }
        if let Some(usage) = &s.usage {
            if !final_html.is_empty() {
                final_html.push_str("\n\n");
                final_html.push_str(&html::escape_html(&usage.footer()));
            }
        }

        if final_html.is_empty() {
            return;
        }
        self.emit(&mut s, &final_html).await;
    }

    /// New turn, same chat message: clear buffers and timers but keep the
    /// message id so the next edit overwrites in place.
    pub async fn soft_reset(&self) {
        let mut s = self.state.lock().await;
        s.generation += 1;
        s.pending_edit = false;
        s.text.clear();
        s.thinking.clear();
        s.image_b64.clear();
        s.tool_indicators.clear();
        s.block = ActiveBlock::None;
        s.usage = None;
        s.finished = false;
    }

    /// Fresh message for the next turn.
    pub async fn reset(&self) {
        self.soft_reset().await;
        let mut s = self.state.lock().await;
        s.message_id = None;
        s.message_ids.clear();
        s.last_edit_at = None;
        s.edit_interval = self.opts.edit_interval;
    }

    pub async fn current_message_id(&self) -> Option<i64> {
        self.state.lock().await.message_id
    }

    /// Every chat message id this accumulator has produced this turn.
    pub async fn all_message_ids(&self) -> Vec<i64> {
        self.state.lock().await.message_ids.clone()
    }

    /// Edit now if the interval has elapsed, else schedule one deferred
    /// edit at the deadline.
    async fn throttled_flush(&self, s: &mut AccumState) {
        if s.finished {
            return;
        }
        let now = Instant::now();
        let due = s
            .last_edit_at
            .map_or(true, |at| now.duration_since(at) >= s.edit_interval);

        if due {
            self.flush(s).await;
            return;
        }
        if s.pending_edit {
            return;
        }
        s.pending_edit = true;
        let delay = s.edit_interval - now.duration_since(s.last_edit_at.unwrap_or(now));
        let generation = s.generation;
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut s = this.state.lock().await;
            if s.generation != generation || s.finished {
                return;
            }
            s.pending_edit = false;
            this.flush(&mut s).await;
        });
    }

    /// Render the rolling buffer and push it out, splitting into a new
    /// message whenever the source exceeds the threshold.
    async fn flush(&self, s: &mut AccumState) {
        while s.text.len() > self.opts.split_threshold {
            let (head, tail) = html::split_first(&s.text, self.opts.split_threshold);
            if tail.is_empty() {
                break;
            }
            s.text = head;
            let rendered = self.render_body(s);
            let rendered = rendered.trim_end();
            if !rendered.is_empty() {
                self.emit(s, rendered).await;
            }
            // Everything after the split goes to a fresh message.
            s.message_id = None;
            s.text = tail;
        }

        let rendered = self.render_body(s);
        let rendered = rendered.trim_end();
        if rendered.is_empty() {
            return;
        }
        self.emit(s, rendered).await;
    }

    fn render_body(&self, s: &AccumState) -> String {
        let mut body = html::render_html(&s.text).trim_end().to_string();
        for name in &s.tool_indicators {
            if !body.is_empty() {
                body.push_str("\n\n");
            }
            body.push_str(&format!("<i>Using {}…</i>", html::escape_html(name)));
        }
        body
    }

    /// One send-or-edit, serialized by the caller's lock. Rate limits
    /// double the interval (capped), honor the advertised wait and retry;
    /// "not modified" is swallowed; other errors are logged and dropped.
    async fn emit(&self, s: &mut AccumState, content: &str) {
        match s.message_id {
            None => match self.sink.send_message(self.chat_id, content).await {
                Ok(id) => {
                    s.message_id = Some(id);
                    s.message_ids.push(id);
                    s.last_edit_at = Some(Instant::now());
                }
                Err(e) => warn!(error = %e, "chat send failed"),
            },
            Some(id) => loop {
                match self.sink.edit_message(self.chat_id, id, content).await {
                    Ok(()) => {
                        s.last_edit_at = Some(Instant::now());
                        break;
                    }
                    Err(SinkError::RetryAfter(secs)) => {
                        s.edit_interval = (s.edit_interval * 2).min(EDIT_INTERVAL_CAP);
                        debug!(retry_after = secs, interval = ?s.edit_interval, "rate limited, backing off");
                        tokio::time::sleep(Duration::from_secs(secs)).await;
                    }
                    Err(SinkError::NotModified) => break,
                    Err(e) => {
                        warn!(error = %e, "chat edit failed");
                        break;
                    }
                }
            },
        }
    }

    /// Decode the buffered base64 image and send it as a photo, falling
    /// back to an inline note when the data does not decode.
    async fn deliver_image(&self, s: &mut AccumState) {
        let data = std::mem::take(&mut s.image_b64);
        if data.is_empty() {
            return;
        }
        match base64::engine::general_purpose::STANDARD.decode(data.trim()) {
            Ok(bytes) => match self.sink.send_photo(self.chat_id, bytes, None).await {
                Ok(id) => s.message_ids.push(id),
                Err(e) => {
                    warn!(error = %e, "photo upload failed");
                    self.push_note(s, "[image could not be sent]").await;
                }
            },
            Err(e) => {
                warn!(error = %e, "image block did not decode");
                self.push_note(s, "[image could not be sent]").await;
            }
        }
    }

    async fn push_note(&self, s: &mut AccumState, note: &str) {
        if !s.text.is_empty() {
            s.text.push_str("\n\n");
        }
        s.text.push_str(note);
        self.flush(s).await;
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{cut}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::mock::{Call, MockSink};

    fn accumulator(sink: Arc<MockSink>) -> StreamAccumulator {
        StreamAccumulator::new(
            sink,
            7,
            AccumOptions {
                edit_interval: Duration::from_millis(30),
                split_threshold: 4000,
            },
        )
    }

    fn text_delta(t: &str) -> StreamEvent {
        StreamEvent::ContentBlockDelta {
            index: 0,
            delta: BlockDelta::Text(t.to_string()),
        }
    }

    fn block_start(block: BlockStart) -> StreamEvent {
        StreamEvent::ContentBlockStart { index: 0, block }
    }

    #[tokio::test]
    async fn simple_turn_sends_then_edits() {
        let sink = Arc::new(MockSink::new());
        let acc = accumulator(Arc::clone(&sink));

        acc.handle(&StreamEvent::MessageStart).await;
        acc.handle(&block_start(BlockStart::Text)).await;
        acc.handle(&text_delta("Hello! ")).await;
        acc.handle(&text_delta("Here is my response.")).await;
        acc.handle(&StreamEvent::ContentBlockStop { index: 0 }).await;
        acc.handle(&StreamEvent::MessageStop).await;

        assert_eq!(sink.send_count(), 1, "exactly one message created");
        let id = sink.sent_ids()[0];
        let final_text = sink.last_text_of(id).unwrap();
        assert!(final_text.contains("Hello!"));
        assert!(final_text.contains("Here is my response."));
        assert!(!final_text.contains("blockquote"));
        assert_eq!(acc.all_message_ids().await, vec![id]);
    }

    #[tokio::test]
    async fn thinking_then_text_renders_blockquote() {
        let sink = Arc::new(MockSink::new());
        let acc = accumulator(Arc::clone(&sink));

        acc.handle(&StreamEvent::MessageStart).await;
        acc.handle(&block_start(BlockStart::Thinking)).await;
        acc.handle(&StreamEvent::ContentBlockDelta {
            index: 0,
            delta: BlockDelta::Thinking("analyzing the problem".to_string()),
        })
        .await;
        acc.handle(&StreamEvent::ContentBlockStop { index: 0 }).await;
        acc.handle(&block_start(BlockStart::Text)).await;
        acc.handle(&text_delta("Here is the answer")).await;
        acc.handle(&StreamEvent::ContentBlockStop { index: 1 }).await;
        acc.handle(&StreamEvent::MessageStop).await;

        let calls = sink.calls();
        let placeholder = calls.iter().find_map(|c| match c {
            Call::Send { text, .. } => Some(text.clone()),
            _ => None,
        });
        assert!(placeholder.unwrap().contains("💭 Thinking…"));

        let id = sink.sent_ids()[0];
        let final_text = sink.last_text_of(id).unwrap();
        assert!(final_text.contains("<blockquote expandable>analyzing the problem</blockquote>"));
        assert!(final_text.contains("Here is the answer"));
    }

    #[tokio::test]
    async fn tool_use_indicator_is_rendered() {
        let sink = Arc::new(MockSink::new());
        let acc = accumulator(Arc::clone(&sink));

        acc.handle(&block_start(BlockStart::ToolUse {
            id: "tu_1".to_string(),
            name: "Bash".to_string(),
        }))
        .await;
        acc.handle(&StreamEvent::ContentBlockStop { index: 0 }).await;

        let id = sink.sent_ids()[0];
        assert!(sink
            .last_text_of(id)
            .unwrap()
            .contains("<i>Using Bash…</i>"));
    }

    #[tokio::test]
    async fn splits_at_paragraph_break_over_threshold() {
        let sink = Arc::new(MockSink::new());
        let acc = accumulator(Arc::clone(&sink));

        let body = format!("{}\n\n{}", "A".repeat(3000), "B".repeat(2000));
        acc.handle(&block_start(BlockStart::Text)).await;
        acc.handle(&text_delta(&body)).await;
        acc.handle(&StreamEvent::MessageStop).await;

        assert!(sink.send_count() >= 2, "split must open a second message");
        for call in sink.calls() {
            match call {
                Call::Send { text, .. } | Call::Edit { text, .. } => {
                    assert!(text.len() <= 4200, "chunk too large: {}", text.len());
                }
                _ => {}
            }
        }
        let ids = acc.all_message_ids().await;
        assert_eq!(ids, sink.sent_ids());
    }

    #[tokio::test]
    async fn rate_limit_backs_off_and_retries_without_duplicate_send() {
        let sink = Arc::new(MockSink::new());
        let acc = accumulator(Arc::clone(&sink));

        acc.handle(&text_delta("first")).await;
        assert_eq!(sink.send_count(), 1);

        sink.edit_failures
            .lock()
            .unwrap()
            .push_back(SinkError::RetryAfter(1));

        // Let the throttle window pass so the next delta edits immediately.
        tokio::time::sleep(Duration::from_millis(40)).await;
        let started = Instant::now();
        acc.handle(&text_delta(" second")).await;

        assert!(
            started.elapsed() >= Duration::from_secs(1),
            "must honor the advertised retry-after"
        );
        assert_eq!(sink.send_count(), 1, "retry must not create a new message");

        let id = sink.sent_ids()[0];
        assert!(sink.last_text_of(id).unwrap().contains("second"));

        // The interval doubled from the configured 30ms.
        let s = acc.state.lock().await;
        assert_eq!(s.edit_interval, Duration::from_millis(60));
    }

    #[tokio::test]
    async fn concurrent_deltas_create_exactly_one_message() {
        let sink = Arc::new(MockSink::with_delay(Duration::from_millis(20)));
        let acc = accumulator(Arc::clone(&sink));

        let mut handles = Vec::new();
        for i in 0..8 {
            let acc = acc.clone();
            handles.push(tokio::spawn(async move {
                acc.handle(&text_delta(&format!("part{i} "))).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        acc.handle(&StreamEvent::MessageStop).await;

        assert_eq!(sink.send_count(), 1, "one creation, the rest are edits");
    }

    #[tokio::test]
    async fn finalize_is_idempotent() {
        let sink = Arc::new(MockSink::new());
        let acc = accumulator(Arc::clone(&sink));

        acc.handle(&text_delta("done")).await;
        acc.finalize().await;
        let after_first = sink.calls().len();
        acc.finalize().await;
        assert_eq!(sink.calls().len(), after_first);
    }

    #[tokio::test]
    async fn empty_deltas_never_reach_the_chat() {
        let sink = Arc::new(MockSink::new());
        let acc = accumulator(Arc::clone(&sink));

        acc.handle(&text_delta("")).await;
        acc.handle(&StreamEvent::MessageStop).await;
        assert!(sink.calls().is_empty());
    }

    #[tokio::test]
    async fn soft_reset_keeps_message_id_full_reset_clears_it() {
        let sink = Arc::new(MockSink::new());
        let acc = accumulator(Arc::clone(&sink));

        acc.handle(&text_delta("turn one")).await;
        let id = acc.current_message_id().await;
        assert!(id.is_some());

        acc.soft_reset().await;
        assert_eq!(acc.current_message_id().await, id);

        acc.reset().await;
        assert_eq!(acc.current_message_id().await, None);
    }

    #[tokio::test]
    async fn usage_footer_appears_in_final_edit() {
        let sink = Arc::new(MockSink::new());
        let acc = accumulator(Arc::clone(&sink));

        acc.handle(&text_delta("body")).await;
        acc.set_usage(TurnUsage {
            input_tokens: 12_000,
            output_tokens: 3_000,
            cost_usd: Some(0.05),
            ..Default::default()
        })
        .await;
        acc.finalize().await;

        let id = sink.sent_ids()[0];
        let text = sink.last_text_of(id).unwrap();
        assert!(text.contains("↩ 12k in · 3k out · $0.0500"));
    }

    #[tokio::test]
    async fn image_block_becomes_photo() {
        let sink = Arc::new(MockSink::new());
        let acc = accumulator(Arc::clone(&sink));

        acc.handle(&block_start(BlockStart::Image)).await;
        acc.handle(&StreamEvent::ContentBlockDelta {
            index: 0,
            delta: BlockDelta::Image(
                base64::engine::general_purpose::STANDARD.encode(b"fake-image"),
            ),
        })
        .await;
        acc.handle(&StreamEvent::ContentBlockStop { index: 0 }).await;

        assert!(matches!(
            sink.calls().as_slice(),
            [Call::Photo { bytes: 10, .. }]
        ));
    }

    #[tokio::test]
    async fn undecodable_image_falls_back_to_note() {
        let sink = Arc::new(MockSink::new());
        let acc = accumulator(Arc::clone(&sink));

        acc.handle(&block_start(BlockStart::Image)).await;
        acc.handle(&StreamEvent::ContentBlockDelta {
            index: 0,
            delta: BlockDelta::Image("!!not-base64!!".to_string()),
        })
        .await;
        acc.handle(&StreamEvent::ContentBlockStop { index: 0 }).await;

        let id = sink.sent_ids()[0];
        assert!(sink
            .last_text_of(id)
            .unwrap()
            .contains("[image could not be sent]"));
    }
}
