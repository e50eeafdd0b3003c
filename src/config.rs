//! # Global runtime configuration.
//!
//! [`Config`] defines the session runtime's behavior: durable storage
//! locations, pairing and reconnect delays, the connect timeout, the
//! bulk-reload budget, and the health-check / keep-alive intervals.
//!
//! # Example
//! ```
//! use std::time::Duration;
//! use linkvisor::Config;
//!
//! let mut cfg = Config::default();
//! cfg.reconnect_delay = Duration::from_secs(5);
//! cfg.max_reload_attempts = 3;
//!
//! assert_eq!(cfg.max_reload_attempts, 3);
//! ```

use std::path::PathBuf;
use std::time::Duration;

/// Global configuration for the session runtime.
///
/// Controls storage paths, state-machine timings, the bulk-reconnect budget,
/// and event-channel behavior.
#[derive(Clone, Debug)]
pub struct Config {
    /// Path of the durable session registry (JSON, tenant → device ids).
    pub sessions_file: PathBuf,
    /// Root directory for per-device credential blobs.
    pub auth_dir: PathBuf,
    /// Delay after a `Connecting` signal before requesting a pairing code
    /// (avoids racing transport setup).
    pub pairing_delay: Duration,
    /// Delay before re-dialing after a transient disconnect.
    pub reconnect_delay: Duration,
    /// Maximum time a link may stay in `Connecting`/`AwaitingPairing`
    /// before it is force-failed.
    pub connect_timeout: Duration,
    /// Wait before the first bulk-reload pass at startup.
    pub startup_delay: Duration,
    /// Observation window after a bulk-reload pass before counting
    /// open devices.
    pub observe_window: Duration,
    /// Maximum number of bulk-reload passes per trigger.
    pub max_reload_attempts: u32,
    /// Interval of the self-healing health check.
    pub health_interval: Duration,
    /// Interval of the per-subscriber keep-alive signal.
    pub keepalive_interval: Duration,
    /// Capacity of each per-tenant event channel.
    pub event_capacity: usize,
}

impl Default for Config {
    /// Provides a default configuration:
    /// - `sessions_file = "sessions.json"`, `auth_dir = "auth"`
    /// - `pairing_delay = 3s`, `reconnect_delay = 5s`
    /// - `connect_timeout = 120s`
    /// - `startup_delay = 15s`, `observe_window = 30s`, `max_reload_attempts = 3`
    /// - `health_interval = 10min`, `keepalive_interval = 30s`
    /// - `event_capacity = 32`
    fn default() -> Self {
        Self {
            sessions_file: PathBuf::from("sessions.json"),
            auth_dir: PathBuf::from("auth"),
            pairing_delay: Duration::from_secs(3),
            reconnect_delay: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(120),
            startup_delay: Duration::from_secs(15),
            observe_window: Duration::from_secs(30),
            max_reload_attempts: 3,
            health_interval: Duration::from_secs(600),
            keepalive_interval: Duration::from_secs(30),
            event_capacity: 32,
        }
    }
}
