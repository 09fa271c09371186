pub mod core;
pub mod errors;
pub mod participant;
pub mod receiver;
pub mod room;
pub mod sender;
pub mod store;
pub mod sync;

#[cfg(test)]
mod tests;

pub use crate::core::{remove_segment, Removal, SegmentConfig, DEFAULT_CAPACITY, DEFAULT_SEGMENT_NAME};
pub use crate::errors::{ChatError, Result};
pub use crate::participant::{ChatConfig, Participant};
pub use crate::room::{ChatRoom, MAX_MESSAGE_LEN};
pub use crate::store::{Message, MessageId, ParticipantId, MAX_MESSAGES};
