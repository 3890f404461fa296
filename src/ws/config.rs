#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use bon::Builder;

const DEFAULT_CONNECTION_TIMEOUT_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_INITIAL_BACKOFF_DURATION: Duration = Duration::from_secs(1);
const DEFAULT_MAX_BACKOFF_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_BUFFER_SIZE: usize = 1000;

/// Configuration for a single endpoint's connection behavior.
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct Config {
    /// Whether a lost or failed connection is retried automatically
    #[builder(default = true)]
    pub auto_reconnect: bool,
    /// Maximum time to wait for the transport to open before reporting a timeout
    #[builder(default = DEFAULT_CONNECTION_TIMEOUT_DURATION)]
    pub connection_timeout: Duration,
    /// Reconnection strategy configuration
    #[builder(default)]
    pub reconnect: ReconnectConfig,
    /// Outbound buffering configuration
    #[builder(default)]
    pub queue: QueueConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Configuration for automatic reconnection behavior.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts before giving up.
    /// `None` means infinite retries.
    pub max_attempts: Option<u32>,
    /// Delay before the first reconnection attempt
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Randomize each delay by up to a quarter in either direction
    pub jitter: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: Some(DEFAULT_MAX_RECONNECT_ATTEMPTS),
            initial_delay: DEFAULT_INITIAL_BACKOFF_DURATION,
            max_delay: DEFAULT_MAX_BACKOFF_DURATION,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            jitter: true,
        }
    }
}

/// Configuration for buffering messages sent while disconnected.
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct QueueConfig {
    /// Maximum number of buffered messages; the oldest are evicted beyond this
    #[builder(default = DEFAULT_BUFFER_SIZE)]
    pub buffer_size: usize,
    /// Buffer messages while disconnected instead of rejecting them
    #[builder(default = true)]
    pub enabled: bool,
    /// Flush the buffer as soon as the connection opens
    #[builder(default = true)]
    pub replay_on_connect: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
