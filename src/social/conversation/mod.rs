//! 私信会话模块

pub mod api;
pub mod listener;
pub mod models;
pub mod service;

pub use api::MessageApi;
pub use listener::{ConversationListener, EmptyConversationListener};
pub use models::{ConversationSnapshot, Message};
pub use service::ConversationView;
