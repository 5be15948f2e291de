use std::sync::Arc;

use llm::messages::chat::{ChatMessage, ContentPart, MessageContent};
use secrecy::{ExposeSecret, SecretString};
use xxhash_rust::xxh3::xxh3_64;

use crate::{
    FileError, FileStore, FileTransfer, Result,
    crypto,
    record::{ContextRef, FileRecord, default_context, file_placeholder},
};

/// Result of synchronizing a chat history against the file collections.
#[derive(Debug)]
pub struct SyncOutcome {
    /// The history with file parts replaced by textual placeholders.
    pub history: Vec<ChatMessage>,
    /// The records resolved for the referenced files, for downstream tool
    /// calls.
    pub records: Vec<FileRecord>,
}

/// Per-context file registry with encrypted metadata at rest.
pub struct FileCollection {
    store: Arc<dyn FileStore>,
    transfer: Arc<dyn FileTransfer>,
    system_key: Option<SecretString>,
}

impl FileCollection {
    pub fn new(store: Arc<dyn FileStore>, transfer: Arc<dyn FileTransfer>, system_key: Option<SecretString>) -> Self {
        Self {
            store,
            transfer,
            system_key,
        }
    }

    /// The transfer used for payload movement; shared with the editor.
    pub fn transfer(&self) -> Arc<dyn FileTransfer> {
        Arc::clone(&self.transfer)
    }

    /// Merged records across the given contexts, optionally filtered to the
    /// files visible in the given chats.
    pub async fn load(&self, contexts: &[ContextRef], chat_filter: Option<&[String]>) -> Result<Vec<FileRecord>> {
        let mut records = Vec::new();

        for context in contexts {
            records.extend(self.load_context(context).await?);
        }

        if let Some(chat_ids) = chat_filter {
            records.retain(|record| record.in_collection.matches(chat_ids));
        }

        Ok(records)
    }

    /// Walk the chat history, register every referenced file in its owning
    /// collection (the default context for new files), tag it with the chat
    /// id, and replace the file part with a textual placeholder.
    pub async fn sync_and_strip(
        &self,
        history: Vec<ChatMessage>,
        contexts: &[ContextRef],
        chat_id: &str,
    ) -> Result<SyncOutcome> {
        let Some(write_context) = default_context(contexts) else {
            return Ok(SyncOutcome {
                history,
                records: Vec::new(),
            });
        };

        let mut resolved: Vec<FileRecord> = Vec::new();
        let mut rewritten = Vec::with_capacity(history.len());

        for mut message in history {
            if let MessageContent::Parts(parts) = &message.content {
                let mut replaced = Vec::with_capacity(parts.len());

                for part in parts {
                    match part {
                        ContentPart::File {
                            url,
                            gcs,
                            hash,
                            filename,
                        } => {
                            let record = self
                                .resolve_file(
                                    contexts,
                                    write_context,
                                    url.as_deref(),
                                    gcs.as_deref(),
                                    hash.as_deref(),
                                    filename.as_deref(),
                                    chat_id,
                                )
                                .await?;

                            replaced.push(ContentPart::Text {
                                text: file_placeholder(&record.display_filename, &record.hash),
                            });

                            if !resolved.iter().any(|seen| seen.hash == record.hash) {
                                resolved.push(record);
                            }
                        }
                        other => replaced.push(other.clone()),
                    }
                }

                message.content = MessageContent::Parts(replaced);
            }

            rewritten.push(message);
        }

        Ok(SyncOutcome {
            history: rewritten,
            records: resolved,
        })
    }

    /// Register content under a context: hash it, hand the payload to the
    /// file handler, and insert a record. Re-uploading existing content
    /// reuses the record and appends a filename alias.
    pub async fn write_file(
        &self,
        context: &ContextRef,
        content: &str,
        filename: &str,
        tags: Option<Vec<String>>,
        notes: Option<String>,
    ) -> Result<FileRecord> {
        if filename.is_empty() {
            return Err(FileError::InvalidInput("filename must not be empty".to_string()));
        }

        let hash = format!("{:016x}", xxh3_64(content.as_bytes()));

        if let Some(mut existing) = self.load_record(context, &hash).await? {
            if existing.filename != filename && !existing.aliases.iter().any(|alias| alias == filename) {
                existing.aliases.push(filename.to_string());
                self.store_record(context, &existing).await?;
            }

            return Ok(existing);
        }

        let receipt = self
            .transfer
            .upload(content, filename, &hash, Some(&context.context_id))
            .await?;

        let record = FileRecord {
            id: uuid_string(),
            hash,
            url: receipt.url,
            gcs: receipt.gcs,
            filename: filename.to_string(),
            display_filename: filename.to_string(),
            mime_type: guess_mime(filename).to_string(),
            size: content.len() as u64,
            timestamp: jiff::Timestamp::now().to_string(),
            tags,
            notes,
            aliases: Vec::new(),
            in_collection: Default::default(),
        };

        self.store_record(context, &record).await?;

        Ok(record)
    }

    /// Fetch one record by content hash.
    pub async fn load_record(&self, context: &ContextRef, hash: &str) -> Result<Option<FileRecord>> {
        let Some(payload) = self.store.get(&context.context_id, hash).await? else {
            return Ok(None);
        };

        Ok(self.parse_record(context, &payload))
    }

    /// Persist a record into its context, encrypting per the context keys.
    pub async fn store_record(&self, context: &ContextRef, record: &FileRecord) -> Result<()> {
        let json = serde_json::to_string(record).map_err(|e| FileError::Store(format!("serialize record: {e}")))?;

        let payload = crypto::encrypt(
            &json,
            context.context_key.as_ref().map(|key| key.expose_secret()),
            self.system_key.as_ref().map(|key| key.expose_secret()),
        );

        self.store.put(&context.context_id, &record.hash, payload).await
    }

    /// Remove a record from its context.
    pub async fn delete_record(&self, context: &ContextRef, hash: &str) -> Result<()> {
        self.store.delete(&context.context_id, hash).await
    }

    async fn load_context(&self, context: &ContextRef) -> Result<Vec<FileRecord>> {
        let payloads = self.store.list(&context.context_id).await?;

        Ok(payloads
            .iter()
            .filter_map(|payload| self.parse_record(context, payload))
            .collect())
    }

    fn parse_record(&self, context: &ContextRef, payload: &str) -> Option<FileRecord> {
        let decrypted = crypto::decrypt(
            payload,
            context.context_key.as_ref().map(|key| key.expose_secret()),
            self.system_key.as_ref().map(|key| key.expose_secret()),
        );

        match serde_json::from_str(&decrypted) {
            Ok(record) => Some(record),
            Err(e) => {
                log::warn!("skipping unreadable file record in context {}: {e}", context.context_id);
                None
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn resolve_file(
        &self,
        contexts: &[ContextRef],
        write_context: &ContextRef,
        url: Option<&str>,
        gcs: Option<&str>,
        hash: Option<&str>,
        filename: Option<&str>,
        chat_id: &str,
    ) -> Result<FileRecord> {
        // Look for an existing record in any context, matched by hash, url
        // or gcs reference.
        for context in contexts {
            for mut record in self.load_context(context).await? {
                let hit = hash.is_some_and(|hash| record.hash == hash)
                    || url.is_some_and(|url| record.url == url)
                    || gcs.is_some_and(|gcs| record.gcs.as_deref() == Some(gcs));

                if hit {
                    record.in_collection.add_chat(chat_id);
                    self.store_record(context, &record).await?;
                    return Ok(record);
                }
            }
        }

        // Unknown file: register it in the default context.
        let reference = url
            .or(gcs)
            .or(hash)
            .ok_or_else(|| FileError::InvalidInput("file part carries no url, gcs or hash".to_string()))?;

        let filename = filename
            .map(str::to_string)
            .or_else(|| url.and_then(|url| url.rsplit('/').next().map(str::to_string)))
            .unwrap_or_else(|| "file".to_string());

        let mut record = FileRecord {
            id: uuid_string(),
            hash: hash
                .map(str::to_string)
                .unwrap_or_else(|| format!("{:016x}", xxh3_64(reference.as_bytes()))),
            url: url.unwrap_or_default().to_string(),
            gcs: gcs.map(str::to_string),
            filename: filename.clone(),
            display_filename: filename,
            mime_type: guess_mime(url.unwrap_or_default()).to_string(),
            size: 0,
            timestamp: jiff::Timestamp::now().to_string(),
            tags: None,
            notes: None,
            aliases: Vec::new(),
            in_collection: Default::default(),
        };

        record.in_collection.add_chat(chat_id);
        self.store_record(write_context, &record).await?;

        Ok(record)
    }
}

fn uuid_string() -> String {
    format!("file-{}", uuid::Uuid::new_v4())
}

fn guess_mime(filename: &str) -> &'static str {
    let lower = filename.to_ascii_lowercase();

    if lower.ends_with(".txt") || lower.ends_with(".md") {
        "text/plain"
    } else if lower.ends_with(".json") {
        "application/json"
    } else if lower.ends_with(".png") {
        "image/png"
    } else if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
        "image/jpeg"
    } else if lower.ends_with(".pdf") {
        "application/pdf"
    } else {
        "application/octet-stream"
    }
}

#[cfg(test)]
mod tests {
    use llm::messages::chat::ChatRole;
    use secrecy::SecretString;

    use super::*;
    use crate::{MemoryStore, MemoryTransfer};

    fn collection() -> FileCollection {
        FileCollection::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryTransfer::new()),
            Some(SecretString::from("system-key".to_string())),
        )
    }

    fn keyed_context(id: &str, key: &str, default: bool) -> ContextRef {
        ContextRef {
            context_id: id.to_string(),
            context_key: Some(SecretString::from(key.to_string())),
            default,
        }
    }

    #[tokio::test]
    async fn write_then_load_round_trips_through_encryption() {
        let collection = collection();
        let context = keyed_context("u", "user-key", true);

        let record = collection
            .write_file(&context, "hello", "hello.txt", None, None)
            .await
            .unwrap();

        assert_eq!(record.filename, "hello.txt");
        assert_eq!(record.mime_type, "text/plain");
        assert!(record.in_collection.is_absent());

        let loaded = collection.load(std::slice::from_ref(&context), None).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0], record);
    }

    #[tokio::test]
    async fn duplicate_uploads_reuse_the_record_and_alias() {
        let collection = collection();
        let context = keyed_context("u", "user-key", true);

        let first = collection
            .write_file(&context, "same content", "a.txt", None, None)
            .await
            .unwrap();
        let second = collection
            .write_file(&context, "same content", "b.txt", None, None)
            .await
            .unwrap();

        assert_eq!(first.hash, second.hash);
        assert_eq!(second.filename, "a.txt");

        let loaded = collection.load(std::slice::from_ref(&context), None).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].aliases, vec!["b.txt".to_string()]);
    }

    #[tokio::test]
    async fn sync_and_strip_tags_files_across_contexts() {
        let collection = collection();
        let user_context = keyed_context("u", "user-key", true);
        let workspace_context = ContextRef::new("w");
        let contexts = vec![user_context.clone(), workspace_context.clone()];

        let uf = collection
            .write_file(&user_context, "user file", "uf.txt", None, None)
            .await
            .unwrap();
        let wf = collection
            .write_file(&workspace_context, "workspace file", "wf.txt", None, None)
            .await
            .unwrap();
        let untouched = collection
            .write_file(&workspace_context, "unrelated", "other.txt", None, None)
            .await
            .unwrap();

        let history = vec![ChatMessage {
            role: ChatRole::User,
            name: None,
            content: MessageContent::Parts(vec![
                ContentPart::Text {
                    text: "see attachments".to_string(),
                },
                ContentPart::File {
                    url: Some(uf.url.clone()),
                    gcs: None,
                    hash: Some(uf.hash.clone()),
                    filename: Some("uf.txt".to_string()),
                },
                ContentPart::File {
                    url: Some(wf.url.clone()),
                    gcs: None,
                    hash: Some(wf.hash.clone()),
                    filename: Some("wf.txt".to_string()),
                },
            ]),
            tool_calls: None,
            tool_call_id: None,
        }];

        let outcome = collection.sync_and_strip(history, &contexts, "c").await.unwrap();

        assert_eq!(outcome.records.len(), 2);

        // Both referenced records now carry the chat id, each in its own
        // context; the unreferenced one is untouched.
        let chat = vec!["c".to_string()];
        let visible = collection.load(&contexts, Some(&chat)).await.unwrap();
        let hashes: Vec<_> = visible.iter().map(|record| record.hash.as_str()).collect();

        assert!(hashes.contains(&uf.hash.as_str()));
        assert!(hashes.contains(&wf.hash.as_str()));
        assert!(!hashes.contains(&untouched.hash.as_str()));

        // File parts were replaced by placeholders.
        let MessageContent::Parts(parts) = &outcome.history[0].content else {
            panic!("expected parts");
        };

        assert!(matches!(&parts[1], ContentPart::Text { text } if text.contains("uf.txt") && text.contains(&uf.hash)));
        assert!(matches!(&parts[2], ContentPart::Text { text } if text.contains("wf.txt")));
        assert!(
            parts
                .iter()
                .all(|part| !matches!(part, ContentPart::File { .. }))
        );
    }

    #[tokio::test]
    async fn unknown_files_register_in_the_default_context() {
        let collection = collection();
        let contexts = vec![keyed_context("u", "user-key", true), ContextRef::new("w")];

        let history = vec![ChatMessage {
            role: ChatRole::User,
            name: None,
            content: MessageContent::Parts(vec![ContentPart::File {
                url: Some("https://files.example/report.pdf".to_string()),
                gcs: None,
                hash: None,
                filename: None,
            }]),
            tool_calls: None,
            tool_call_id: None,
        }];

        let outcome = collection.sync_and_strip(history, &contexts, "c1").await.unwrap();

        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].display_filename, "report.pdf");

        let in_default = collection.load(&contexts[..1], None).await.unwrap();
        assert_eq!(in_default.len(), 1);
        assert!(in_default[0].in_collection.matches(&["c1".to_string()]));
    }
}
