//! Logging configuration
//!
//! Initializes tracing for the application. `STAGEGATE_LOG` takes precedence
//! over the configured level and accepts full filter directives
//! (`stagegate=debug,reqwest=warn`).

use tracing_subscriber::{EnvFilter, fmt};

/// Environment variable holding the log filter
pub const LOG_ENV: &str = "STAGEGATE_LOG";

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initializes logging with the specified level
///
/// Does nothing if a global subscriber is already installed.
pub fn init_logging(level: &str) {
    let _ = fmt()
        .with_env_filter(filter(level))
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_twice() {
        init_logging("debug");
        init_logging("not a level!!");
    }
}
