//! 记忆层：按会话保存的对话历史

pub mod conversation;

pub use conversation::{ConversationStore, Message, Role, Session};
