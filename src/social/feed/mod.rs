//! 社区动态模块：帖子、评论、点赞计数

pub mod api;
pub mod listener;
pub mod models;
pub mod service;

pub use api::FeedApi;
pub use listener::{EmptyFeedListener, FeedListener};
pub use models::{Comment, FeedFilter, LikeOutcome, MediaType, Post, PostDraft, Tag};
pub use service::FeedView;
