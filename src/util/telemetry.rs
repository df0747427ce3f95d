//! Tracing setup for the agent.
//!
//! The filter comes from the agent configuration (`log_filter`, also set by
//! `SLIVER_LOG`), then `RUST_LOG`, then [`DEFAULT_LOG_FILTER`].

use tracing_subscriber::EnvFilter;

/// Filter used when nothing else is configured.
pub const DEFAULT_LOG_FILTER: &str = "sliver_agent=info";

/// Build the log filter from explicit directives or the environment.
///
/// # Errors
///
/// Directives that do not parse.
pub fn log_filter(directives: Option<&str>) -> Result<EnvFilter, String> {
    let directives = directives
        .map(str::to_owned)
        .or_else(|| std::env::var(EnvFilter::DEFAULT_ENV).ok())
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_owned());
    EnvFilter::try_new(&directives).map_err(|e| format!("log filter `{directives}`: {e}"))
}

/// Install the default subscriber unless one is already set.
pub fn init_tracing() {
    let _ = init_tracing_with(None);
}

/// Install an fmt subscriber filtered by `directives`, naming worker threads
/// in each line. Returns false when a subscriber was already installed.
///
/// # Errors
///
/// Directives that do not parse.
pub fn init_tracing_with(directives: Option<&str>) -> Result<bool, String> {
    let filter = log_filter(directives)?;
    if tracing::dispatcher::has_been_set() {
        return Ok(false);
    }
    Ok(tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init()
        .is_ok())
}
