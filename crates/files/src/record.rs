use std::collections::BTreeSet;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

/// Collection membership of a file record.
///
/// Absent means the file was uploaded to the context but never referenced in
/// a conversation. `true` makes it globally available within the context.
/// A set scopes it to specific chats; the wildcard `"*"` inside the set
/// matches every chat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Membership {
    /// Never referenced in a conversation.
    #[default]
    Absent,
    /// Globally available in the context when `true`.
    Global(bool),
    /// Scoped to the listed chat ids.
    Chats(BTreeSet<String>),
}

impl Membership {
    /// Whether serialization may omit the field.
    pub fn is_absent(&self) -> bool {
        matches!(self, Membership::Absent)
    }

    /// Filter evaluation: global membership and chat-id membership coexist;
    /// either grants visibility.
    pub fn matches(&self, chat_ids: &[String]) -> bool {
        match self {
            Membership::Absent => false,
            Membership::Global(global) => *global,
            Membership::Chats(chats) => {
                chats.contains("*") || chat_ids.iter().any(|chat_id| chats.contains(chat_id))
            }
        }
    }

    /// Record that a chat referenced the file. Global membership already
    /// covers every chat and is left alone.
    pub fn add_chat(&mut self, chat_id: &str) {
        match self {
            Membership::Absent | Membership::Global(false) => {
                *self = Membership::Chats(BTreeSet::from([chat_id.to_string()]));
            }
            Membership::Global(true) => {}
            Membership::Chats(chats) => {
                chats.insert(chat_id.to_string());
            }
        }
    }
}

/// A content-addressed file record within one context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: String,
    /// 64-bit content hash, hex encoded. One record per hash per context.
    pub hash: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcs: Option<String>,
    pub filename: String,
    pub display_filename: String,
    pub mime_type: String,
    pub size: u64,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Filename aliases collected from duplicate uploads of the same content.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(default, skip_serializing_if = "Membership::is_absent")]
    pub in_collection: Membership,
}

/// A logical namespace owning a file collection and an optional user
/// encryption key.
#[derive(Debug, Clone)]
pub struct ContextRef {
    pub context_id: String,
    pub context_key: Option<SecretString>,
    pub default: bool,
}

impl ContextRef {
    /// An unkeyed, non-default context.
    pub fn new(context_id: impl Into<String>) -> Self {
        Self {
            context_id: context_id.into(),
            context_key: None,
            default: false,
        }
    }
}

/// The context that receives writes: the first marked default, else the
/// first listed.
pub fn default_context(contexts: &[ContextRef]) -> Option<&ContextRef> {
    contexts.iter().find(|context| context.default).or_else(|| contexts.first())
}

/// The textual placeholder substituted for a stripped file part.
pub fn file_placeholder(filename: &str, hash: &str) -> String {
    format!("[file: {filename}, hash: {hash}] available via file tools")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chats(ids: &[&str]) -> Membership {
        Membership::Chats(ids.iter().map(|id| id.to_string()).collect())
    }

    #[test]
    fn absent_membership_never_matches() {
        assert!(!Membership::Absent.matches(&["c1".to_string()]));
    }

    #[test]
    fn global_membership_matches_every_chat() {
        assert!(Membership::Global(true).matches(&["anything".to_string()]));
        assert!(!Membership::Global(false).matches(&["anything".to_string()]));
    }

    #[test]
    fn chat_sets_match_intersections_and_wildcard() {
        assert!(chats(&["a", "b"]).matches(&["b".to_string()]));
        assert!(!chats(&["a", "b"]).matches(&["c".to_string()]));
        assert!(chats(&["*"]).matches(&["whatever".to_string()]));
    }

    #[test]
    fn membership_serializes_as_bool_or_set() {
        assert_eq!(serde_json::to_value(Membership::Global(true)).unwrap(), serde_json::json!(true));
        assert_eq!(
            serde_json::to_value(chats(&["c1"])).unwrap(),
            serde_json::json!(["c1"])
        );
    }

    #[test]
    fn adding_a_chat_upgrades_absent_to_a_set() {
        let mut membership = Membership::Absent;
        membership.add_chat("c9");
        assert!(membership.matches(&["c9".to_string()]));

        membership.add_chat("c10");
        assert!(membership.matches(&["c10".to_string()]));

        let mut global = Membership::Global(true);
        global.add_chat("c1");
        assert_eq!(global, Membership::Global(true));
    }

    #[test]
    fn default_context_prefers_the_marked_one() {
        let mut second = ContextRef::new("w");
        second.default = true;

        let contexts = vec![ContextRef::new("u"), second];
        assert_eq!(default_context(&contexts).unwrap().context_id, "w");

        let unmarked = vec![ContextRef::new("u"), ContextRef::new("w")];
        assert_eq!(default_context(&unmarked).unwrap().context_id, "u");
    }
}
