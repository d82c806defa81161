//! # Daemon configuration.
//!
//! [`Config`] carries the knobs that are plain data; the store, bus, and
//! monitor factory are constructor parameters on
//! [`Keepalived`](crate::Keepalived) because they are live collaborators,
//! not settings.
//!
//! # Example
//! ```
//! use keepvisor::{Config, DEFAULT_HANDLER_COUNT};
//!
//! let mut cfg = Config::default();
//! cfg.deregistration_handler = "cleanup".to_string();
//!
//! assert_eq!(cfg.handler_count, DEFAULT_HANDLER_COUNT);
//! ```

use crate::keepalived::DEFAULT_HANDLER_COUNT;

/// Configuration for the keepalive daemon.
#[derive(Clone, Debug)]
pub struct Config {
    /// Handler named on deregistration events so downstream pipelines can
    /// react to entities retiring. Empty means no special handling.
    pub deregistration_handler: String,

    /// Number of workers draining the inbound keepalive channel. Values
    /// below 1 are clamped to 1.
    pub handler_count: usize,
}

impl Default for Config {
    /// Provides a default configuration:
    /// - `deregistration_handler = ""`
    /// - `handler_count = 10`
    fn default() -> Self {
        Self {
            deregistration_handler: String::new(),
            handler_count: DEFAULT_HANDLER_COUNT,
        }
    }
}
