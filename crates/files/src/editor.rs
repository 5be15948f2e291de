use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use xxhash_rust::xxh3::xxh3_64;

use crate::{
    FileError, Result,
    collection::FileCollection,
    record::{ContextRef, FileRecord},
};

/// An edit applied to a stored file.
#[derive(Debug, Clone)]
pub enum EditOp {
    /// Replace an inclusive 1-based line range with new content.
    Range {
        start_line: usize,
        end_line: usize,
        content: String,
    },
    /// Replace an exact substring.
    Replace {
        old_string: String,
        new_string: String,
        replace_all: bool,
    },
}

/// Applies edits to stored files.
///
/// Edits on one file id are serialized through a per-id FIFO queue, so
/// concurrent submissions all land and none is lost. The write protocol is
/// upload-new-then-delete-old: if the upload fails, the previous payload
/// stays reachable under the same logical file id.
pub struct FileEditor {
    collection: Arc<FileCollection>,
    queues: DashMap<String, Arc<Mutex<()>>>,
}

impl FileEditor {
    pub fn new(collection: Arc<FileCollection>) -> Self {
        Self {
            collection,
            queues: DashMap::new(),
        }
    }

    /// Apply one edit to the file with the given id in the given context.
    pub async fn edit(&self, context: &ContextRef, file_id: &str, op: EditOp) -> Result<FileRecord> {
        let queue = self.queues.entry(file_id.to_string()).or_default().clone();
        let _serialized = queue.lock().await;

        let record = self
            .collection
            .load(std::slice::from_ref(context), None)
            .await?
            .into_iter()
            .find(|record| record.id == file_id)
            .ok_or_else(|| FileError::NotFound(file_id.to_string()))?;

        let transfer = self.collection.transfer();
        let current = transfer.download(&record.url).await?;
        let edited = apply_edit(&current, &op)?;

        let new_hash = format!("{:016x}", xxh3_64(edited.as_bytes()));

        // Upload first; only a successful upload may retire the old payload.
        let receipt = transfer
            .upload(&edited, &record.filename, &new_hash, Some(&context.context_id))
            .await?;

        let old_url = record.url.clone();
        let old_hash = record.hash.clone();

        let mut updated = record;
        updated.url = receipt.url;
        updated.gcs = receipt.gcs;
        updated.hash = new_hash;
        updated.size = edited.len() as u64;
        updated.timestamp = jiff::Timestamp::now().to_string();

        self.collection.store_record(context, &updated).await?;

        if old_hash != updated.hash {
            self.collection.delete_record(context, &old_hash).await?;
        }

        if let Err(e) = transfer.delete(&old_url).await {
            log::warn!("failed to delete superseded payload at {old_url}: {e}");
        }

        Ok(updated)
    }
}

fn apply_edit(content: &str, op: &EditOp) -> Result<String> {
    match op {
        EditOp::Range {
            start_line,
            end_line,
            content: replacement,
        } => {
            let lines: Vec<&str> = content.split('\n').collect();

            if *start_line == 0 || start_line > end_line || *end_line > lines.len() {
                return Err(FileError::InvalidInput(format!(
                    "line range {start_line}..{end_line} is invalid for a {}-line file",
                    lines.len()
                )));
            }

            let mut edited: Vec<&str> = Vec::with_capacity(lines.len());
            edited.extend(&lines[..start_line - 1]);
            edited.extend(replacement.split('\n'));
            edited.extend(&lines[*end_line..]);

            Ok(edited.join("\n"))
        }
        EditOp::Replace {
            old_string,
            new_string,
            replace_all,
        } => {
            if !content.contains(old_string.as_str()) {
                return Err(FileError::InvalidInput(format!(
                    "search string {old_string:?} not found in file"
                )));
            }

            if *replace_all {
                Ok(content.replace(old_string, new_string))
            } else {
                Ok(content.replacen(old_string, new_string, 1))
            }
        }
    }
}
