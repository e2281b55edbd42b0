//! The `persistence` module holds the durable backlog: messages for a remote
//! site that could not be handed to a transport yet.
//!
//! `BacklogStore` is the contract the remote site workers use. `SledBacklog`
//! implements it on top of `sled`, an embedded key-value store.

use serde::{Deserialize, Serialize};

use crate::broker::message::Message;
use crate::utils::error::PersistenceError;

pub mod sled_store;

pub use sled_store::SledBacklog;

/// Identifies one stored record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId {
    pub dest_site: u32,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacklogRecord {
    pub id: RecordId,
    /// Milliseconds since UNIX epoch at which the record was saved.
    pub enqueued_at: i64,
    pub message: Message,
}

pub trait BacklogStore: Send + Sync {
    fn save(&self, dest_site: u32, msg: &Message) -> Result<RecordId, PersistenceError>;

    /// Oldest record for `dest_site`, by save time.
    fn find_oldest(&self, dest_site: u32) -> Result<Option<BacklogRecord>, PersistenceError>;

    fn remove(&self, id: &RecordId) -> Result<(), PersistenceError>;

    /// Flush pending writes to disk.
    fn sync(&self) -> Result<(), PersistenceError>;

    fn pending(&self, dest_site: u32) -> Result<usize, PersistenceError>;

    /// Up to `limit` records for `dest_site`, oldest first.
    fn records(&self, dest_site: u32, limit: usize) -> Result<Vec<BacklogRecord>, PersistenceError>;
}
