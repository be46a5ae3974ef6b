//! relata-server: configuration and the request surface.
//!
//! This crate wires a storage backend to the domain resolver:
//! - [`config`]: file/env configuration with startup verification
//! - [`adapters`]: implement the domain reader traits over a [`relata_storage::DataStore`]
//! - [`service`]: the `AuthorizationService` exposed to transport layers

pub mod adapters;
pub mod config;
pub mod service;

pub use config::ServerConfig;
pub use service::{AuthorizationService, ServiceError, ServiceResult};

/// Initializes the global `tracing` subscriber from the logging settings.
///
/// Call once at startup, after `ServerConfig::verify` has accepted the
/// configuration.
pub fn init_logging(settings: &config::LoggingSettings) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(settings.level.clone()));

    match settings.format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .init();
        }
        _ => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}
