pub mod auth;
pub mod bootstrap;
pub mod error;
pub mod handler;
pub mod logger;
pub mod orchestrator;
pub mod router;
pub mod state;
pub mod streaming;

pub use error::{ErrorKind, ProxyError};
pub use handler::build_router;
pub use state::AppState;
