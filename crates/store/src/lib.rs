//! Stellar store: in-RAM lifecycle journal, status board and auxiliary cache.

#![forbid(unsafe_code)]

pub mod cache;
pub mod journal;
pub mod status;

pub use cache::TtlCache;
pub use journal::{EventHub, Subscription, DEFAULT_JOURNAL_CAP, DEFAULT_QUEUE_CAP};
pub use status::StatusBoard;
