//! Huddle API
//!
//! HTTP gateway in front of [`huddle_sfu::SfuManager`]: room creation and
//! lookup over JSON, plus a WebSocket adapter that turns each socket into a
//! signaling connection for one peer.

pub mod bootstrap;
pub mod config;
pub mod http;
pub mod logging;

pub use bootstrap::{load_config, run, start};
pub use config::{Config, LoggingConfig, ServerConfig};
pub use http::{create_router, serve, AppError, AppResult, AppState};
pub use logging::init_logging;
