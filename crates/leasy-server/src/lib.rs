pub mod handlers;
pub mod liveness;
pub mod registry;
pub mod router;
pub mod server;

pub use registry::{Connection, ConnectionRegistry, RoutingKey};
pub use router::MessageRouter;
pub use server::{start, start_with_metrics, ServerConfig, ServerHandle};
