//! Content-addressed file collections carried through chat history.
//!
//! Chat transport carries file references, never raw bytes: the model sees
//! an in-provider media reference or a textual placeholder, and the actual
//! payload lives with the file-handler collaborator. Each context owns a
//! collection of records keyed by content hash; metadata at rest is
//! encrypted with a two-layer AES-256-CBC scheme when the context carries a
//! user key.

mod collection;
mod crypto;
mod editor;
mod error;
mod handler;
mod record;
mod store;

pub use collection::{FileCollection, SyncOutcome};
pub use editor::{EditOp, FileEditor};
pub use error::FileError;
pub use handler::{FileHandlerClient, FileTransfer, MemoryTransfer, UploadReceipt};
pub use record::{ContextRef, FileRecord, Membership, default_context, file_placeholder};
pub use store::{FileStore, MemoryStore};

/// Result alias for file operations.
pub type Result<T> = std::result::Result<T, FileError>;
