pub mod discover;
pub mod types;

pub use discover::{discover_sessions, project_slug};
pub use types::SessionInfo;
