//! 好友关系模块
//!
//! 好友申请状态机、好友列表与未读徽标、用户搜索与关注

pub mod api;
pub mod listener;
pub mod models;
pub mod service;

// 重新导出主要类型
pub use api::FriendApi;
pub use listener::{EmptyFriendListener, FriendListener};
pub use models::{Friend, FriendRequest, FriendSnapshot, FriendStatus, PendingRequest, Relationship};
pub use service::FriendService;
