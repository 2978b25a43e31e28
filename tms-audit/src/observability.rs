//! Tracing subscriber initialisation

use tracing_subscriber::EnvFilter;

use crate::config::AuditConfig;

/// Initialize JSON tracing using the configured log level.
///
/// Falls back to `info` when the directive does not parse. Calling this more
/// than once is harmless: later calls leave the installed subscriber in place.
pub fn init_tracing(config: &AuditConfig) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .try_init()
        .is_ok();

    if installed {
        tracing::info!(
            service = %config.service_name,
            environment = %config.environment,
            "Tracing initialized"
        );
    }
}
