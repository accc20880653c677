//! 通知与未读数模块

pub mod api;
pub mod listener;
pub mod models;
pub mod service;

pub use api::NotificationApi;
pub use listener::{EmptyNotificationListener, NotificationListener};
pub use models::{NewNotification, Notification, NotificationKind, NotificationSnapshot};
pub use service::NotificationCenter;
