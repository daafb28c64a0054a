use anyhow::Result;
use std::sync::Arc;
use tracing::debug;

use crate::models::control::{BlockListDocument, BlockListEntry};
use crate::storage::KeyValueStore;

/// Operator-maintained blocklist stored as one JSON document under a
/// well-known key. A missing or unparsable document reads as `None`, which
/// callers must treat as "fail closed".
pub struct BlockList {
    list_key: String,
    kv: Arc<dyn KeyValueStore>,
}

impl BlockList {
    pub fn new(list_key: impl Into<String>, kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            list_key: list_key.into(),
            kv,
        }
    }

    pub fn list_key(&self) -> &str {
        &self.list_key
    }

    /// Seed an empty document if the key does not exist yet.
    pub async fn init(&self) -> Result<()> {
        if self.kv.get(&self.list_key).await?.is_none() {
            self.save(&BlockListDocument::default()).await?;
        }
        Ok(())
    }

    pub async fn get(&self) -> Result<Option<BlockListDocument>> {
        let Some(raw) = self.kv.get(&self.list_key).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(document) => Ok(Some(document)),
            Err(e) => {
                debug!(key = %self.list_key, error = ?e, "blocklist document unparsable");
                Ok(None)
            }
        }
    }

    pub async fn add(&self, entry: BlockListEntry) -> Result<bool> {
        let Some(mut document) = self.get().await? else {
            return Ok(false);
        };
        if document.list_items.contains(&entry) {
            return Ok(false);
        }
        document.list_items.push(entry);
        self.save(&document).await?;
        Ok(true)
    }

    pub async fn remove(&self, entry: &BlockListEntry) -> Result<bool> {
        let Some(mut document) = self.get().await? else {
            return Ok(false);
        };
        let before = document.list_items.len();
        document.list_items.retain(|item| item != entry);
        if document.list_items.len() == before {
            return Ok(false);
        }
        self.save(&document).await?;
        Ok(true)
    }

    pub async fn clear(&self) -> Result<()> {
        self.save(&BlockListDocument::default()).await
    }

    async fn save(&self, document: &BlockListDocument) -> Result<()> {
        self.kv
            .set(&self.list_key, &serde_json::to_string(document)?)
            .await
    }
}

/// First entry matching the node/task pair, if any.
pub fn matching_entry<'a>(
    document: &'a BlockListDocument,
    node_name: &str,
    task_name: &str,
) -> Option<&'a BlockListEntry> {
    document
        .list_items
        .iter()
        .find(|entry| entry.matches(node_name, task_name))
}
