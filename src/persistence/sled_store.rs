use std::path::Path;

use chrono::Utc;
use sled::Db;
use tracing::{debug, warn};

use crate::broker::message::Message;
use crate::persistence::{BacklogRecord, BacklogStore, RecordId};
use crate::utils::error::PersistenceError;

#[derive(Clone)]
pub struct SledBacklog {
    db: Db,
}

impl SledBacklog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    pub(crate) fn tree(&self, dest_site: u32) -> Result<sled::Tree, PersistenceError> {
        Ok(self.db.open_tree(format!("site-{dest_site}"))?)
    }
}

impl BacklogStore for SledBacklog {
    fn save(&self, dest_site: u32, msg: &Message) -> Result<RecordId, PersistenceError> {
        let enqueued_at = Utc::now().timestamp_millis();
        // Zero-padded so lexicographic key order is save order.
        let key = format!("{:020}_{:020}", enqueued_at, self.db.generate_id()?);
        let record = BacklogRecord {
            id: RecordId {
                dest_site,
                key: key.clone(),
            },
            enqueued_at,
            message: msg.clone(),
        };
        let serialized = serde_json::to_vec(&record)?;
        self.tree(dest_site)?.insert(key.as_bytes(), serialized)?;
        debug!(dest_site, key, "saved message to backlog");
        Ok(record.id)
    }

    fn find_oldest(&self, dest_site: u32) -> Result<Option<BacklogRecord>, PersistenceError> {
        let tree = self.tree(dest_site)?;
        while let Some((key, value)) = tree.first()? {
            match serde_json::from_slice(&value) {
                Ok(record) => return Ok(Some(record)),
                Err(e) => {
                    // An undecodable record would otherwise block the site forever.
                    warn!(dest_site, error = %e, "dropping corrupt backlog record");
                    tree.remove(key)?;
                }
            }
        }
        Ok(None)
    }

    fn remove(&self, id: &RecordId) -> Result<(), PersistenceError> {
        self.tree(id.dest_site)?.remove(id.key.as_bytes())?;
        Ok(())
    }

    fn sync(&self) -> Result<(), PersistenceError> {
        self.db.flush()?;
        Ok(())
    }

    fn pending(&self, dest_site: u32) -> Result<usize, PersistenceError> {
        Ok(self.tree(dest_site)?.len())
    }

    fn records(&self, dest_site: u32, limit: usize) -> Result<Vec<BacklogRecord>, PersistenceError> {
        let tree = self.tree(dest_site)?;
        let mut out = Vec::new();
        for entry in tree.iter().take(limit) {
            let (_, value) = entry?;
            out.push(serde_json::from_slice(&value)?);
        }
        Ok(out)
    }
}

impl std::fmt::Debug for SledBacklog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledBacklog")
            .field("db", &"sled::Db")
            .finish()
    }
}
