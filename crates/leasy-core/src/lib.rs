pub mod errors;
pub mod ids;
pub mod wire;

pub use errors::ChatError;
pub use wire::{ChatPayload, ClientFrame, RoutingIdentity};
