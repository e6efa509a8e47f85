//! 记忆层：对话消息与长期检索

pub mod conversation;
pub mod long_term;

pub use conversation::{Message, Role};
pub use long_term::{InMemoryLongTerm, LongTermMemory, NoopLongTerm};
