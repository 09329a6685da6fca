pub mod accum;
pub mod html;
pub mod sink;
pub mod subagent;
pub mod typing;

pub use accum::{AccumOptions, StreamAccumulator};
pub use sink::{ChatSink, SinkError, TelegramSink};
pub use subagent::SubAgentTracker;
pub use typing::TypingHandle;
