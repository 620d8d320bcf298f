pub mod orchestrator;
pub mod server;

pub use orchestrator::{Gateway, ServiceRoute};
pub use server::{gateway_router, serve, ClientIdentity};
