// MsgTable - message table on an in-memory key/value store with JSONL snapshots

pub mod config;
pub mod jsonl;
pub mod models;
pub mod store;
pub mod substrate;
pub mod table;
pub mod timefmt;

// Re-export main types for convenience
pub use config::Config;
pub use models::{Message, NewMessage, now_ms};
pub use store::{MemoryStore, Snapshotter};
pub use substrate::Substrate;
pub use table::{MessageTable, TableKeys};
