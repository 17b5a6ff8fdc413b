//! HTTP surface: configuration, handlers, router, and graceful shutdown.

pub mod config;
pub mod handlers;
pub mod middleware;
pub mod module;
pub mod shutdown;

pub use config::*;
pub use handlers::{ApiBackend, AppState};
pub use module::NetworkModule;
pub use shutdown::*;
