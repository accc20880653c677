pub mod api;
pub mod auth;
pub mod listener;
pub mod models;
pub mod service;

pub use auth::{AuthProvider, AuthSession, AuthUser, GoTrueAuth};
pub use listener::{EmptySessionListener, SessionListener};
pub use models::{Identity, ProfileSummary, ProfileUpdate, Registration};
pub use service::SessionStore;
