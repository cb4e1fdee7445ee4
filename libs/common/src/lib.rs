//! wisesrv basic library
//!
//! Provides basic functions shared by the service and its tooling:
//! - logging setup
//! - configuration file loading
//! - shutdown signal handling

pub mod config_loader;
pub mod error;
pub mod logging;
pub mod shutdown;

// Re-exports for convenience
pub use config_loader::{load_config_from_file, load_config_with_env};
pub use error::{Error, Result};
pub use logging::{init_logging, LogConfig, LogFormat};
