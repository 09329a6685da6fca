pub mod events;
pub mod outbound;
pub mod partial;
