pub mod client;
pub mod error;
pub mod types;

pub use client::ServerClient;
pub use error::ServerError;
pub use types::{AgentMetadata, HeartbeatResponse};
