//! Storage Layer
//!
//! SQLite-backed transactional store. The store exclusively owns all on-disk
//! state; other components reach rows through it.

pub mod migrations;
pub mod sqlite;

pub use sqlite::{FtsHit, ProjectRow, QueueEntry, StorageItem, Store, StoreStats};
