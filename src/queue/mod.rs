//! Search queue: each user's record of intent to be matched

pub mod entry;
pub mod manager;

pub use entry::{decode_entry, encode_entry, QUEUE_COLLECTION};
pub use manager::SearchQueueManager;
