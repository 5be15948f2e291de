use std::collections::BTreeMap;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::Result;

/// Storage of serialized (possibly encrypted) file records, keyed by
/// context id and content hash.
///
/// The persistent key/value service is an external collaborator; this trait
/// is the seam it plugs into. In-process callers must not cache around it:
/// writes invalidate.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// All record payloads in a context.
    async fn list(&self, context_id: &str) -> Result<Vec<String>>;

    /// One record payload by content hash.
    async fn get(&self, context_id: &str, hash: &str) -> Result<Option<String>>;

    /// Insert or replace a record payload.
    async fn put(&self, context_id: &str, hash: &str, payload: String) -> Result<()>;

    /// Remove a record payload.
    async fn delete(&self, context_id: &str, hash: &str) -> Result<()>;
}

/// In-memory store for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    contexts: DashMap<String, BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FileStore for MemoryStore {
    async fn list(&self, context_id: &str) -> Result<Vec<String>> {
        Ok(self
            .contexts
            .get(context_id)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get(&self, context_id: &str, hash: &str) -> Result<Option<String>> {
        Ok(self
            .contexts
            .get(context_id)
            .and_then(|table| table.get(hash).cloned()))
    }

    async fn put(&self, context_id: &str, hash: &str, payload: String) -> Result<()> {
        self.contexts
            .entry(context_id.to_string())
            .or_default()
            .insert(hash.to_string(), payload);
        Ok(())
    }

    async fn delete(&self, context_id: &str, hash: &str) -> Result<()> {
        if let Some(mut table) = self.contexts.get_mut(context_id) {
            table.remove(hash);
        }
        Ok(())
    }
}
