pub mod api;
pub mod backoff;
pub mod session;

pub use backoff::Backoff;
pub use session::{ChatSession, SessionConfig, SessionEvent};
