pub mod log;
pub mod metrics;

use tracing_subscriber::EnvFilter;

/// Install the global subscriber: env-filtered, INFO by default. Access
/// lines go through `target: "access"` at INFO.
pub fn setup_logging() {
	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
		)
		.init();
}
