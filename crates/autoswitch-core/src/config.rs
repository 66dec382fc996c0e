//! Configuration
//!
//! `SwitchConfig` is the single explicit configuration object. It is loaded
//! from TOML or built in code, and threaded through constructors; nothing
//! below the bootstrap layer reads the process environment.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchConfig {
    /// Number of service slots (one serving worker each)
    pub slots: usize,
    /// Wait between sending shutdown and force-killing a worker
    pub grace_period_ms: u64,
    /// Worker-side drain window after receiving shutdown
    pub drain_period_ms: u64,
    /// How long a successor may take to report listening
    pub ready_timeout_ms: u64,
    /// Explicit host-delegated switch; `None` defers to the environment
    pub host_delegated: Option<bool>,
    /// Control endpoint for host-delegated mode
    pub control_endpoint: Option<String>,
    /// Retry policy for failed replacements
    pub replacement: ReplacementConfig,
    /// Respawn policy for unplanned exits
    pub restart: RestartConfig,
}

impl SwitchConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file
    ///
    /// # Errors
    /// Returns `ConfigError::Read` or `ConfigError::Parse`.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Parse configuration from TOML text
    ///
    /// # Errors
    /// Returns `ConfigError::Parse` on malformed input.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants that serde cannot express
    ///
    /// # Errors
    /// Returns `ConfigError::NoSlots` when `slots` is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slots == 0 {
            return Err(ConfigError::NoSlots);
        }
        Ok(())
    }

    /// With slot count
    #[inline]
    #[must_use]
    pub fn with_slots(mut self, slots: usize) -> Self {
        self.slots = slots;
        self
    }

    /// With grace period
    #[inline]
    #[must_use]
    pub fn with_grace_period(mut self, period: Duration) -> Self {
        self.grace_period_ms = duration_ms(period);
        self
    }

    /// With drain period
    #[inline]
    #[must_use]
    pub fn with_drain_period(mut self, period: Duration) -> Self {
        self.drain_period_ms = duration_ms(period);
        self
    }

    /// With successor ready timeout
    #[inline]
    #[must_use]
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout_ms = duration_ms(timeout);
        self
    }

    /// Force host-delegated mode on or off
    #[inline]
    #[must_use]
    pub fn with_host_delegated(mut self, enabled: bool) -> Self {
        self.host_delegated = Some(enabled);
        self
    }

    /// With control endpoint
    #[inline]
    #[must_use]
    pub fn with_control_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.control_endpoint = Some(endpoint.into());
        self
    }

    /// With replacement policy
    #[inline]
    #[must_use]
    pub fn with_replacement(mut self, replacement: ReplacementConfig) -> Self {
        self.replacement = replacement;
        self
    }

    /// With restart policy
    #[inline]
    #[must_use]
    pub fn with_restart(mut self, restart: RestartConfig) -> Self {
        self.restart = restart;
        self
    }

    /// Grace period as a duration
    #[inline]
    #[must_use]
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// Drain period as a duration
    #[inline]
    #[must_use]
    pub fn drain_period(&self) -> Duration {
        Duration::from_millis(self.drain_period_ms)
    }

    /// Ready timeout as a duration
    #[inline]
    #[must_use]
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            slots: 1,
            grace_period_ms: 1000,
            drain_period_ms: 1000,
            ready_timeout_ms: 30_000,
            host_delegated: None,
            control_endpoint: None,
            replacement: ReplacementConfig::default(),
            restart: RestartConfig::default(),
        }
    }
}

/// Retry policy for a replacement that could not be brought up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplacementConfig {
    /// Attempts before the switch is abandoned and the old worker kept
    pub max_attempts: u32,
    /// Delay between attempts
    pub backoff: BackoffConfig,
}

impl Default for ReplacementConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Respawn policy for unplanned worker exits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    /// Maximum respawns per slot within the window
    pub max_restarts: usize,
    /// Sliding window for counting respawns
    pub window_ms: u64,
    /// Delay before each respawn
    pub backoff: BackoffConfig,
}

impl RestartConfig {
    /// Restart window as a duration
    #[inline]
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            window_ms: 60_000,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Backoff strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffConfig {
    /// Same delay every time
    Fixed {
        /// Delay in milliseconds
        delay_ms: u64,
    },

    /// Delay multiplied on every attempt
    Exponential {
        /// First delay in milliseconds
        initial_ms: u64,
        /// Upper bound in milliseconds
        max_ms: u64,
        /// Growth factor
        #[serde(default = "default_multiplier")]
        multiplier: f64,
    },
}

const fn default_multiplier() -> f64 {
    2.0
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::Exponential {
            initial_ms: 100,
            max_ms: 5_000,
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Delay before the given attempt (1-based)
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            Self::Exponential {
                initial_ms,
                max_ms,
                multiplier,
            } => {
                let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
                #[allow(clippy::cast_precision_loss)]
                let delay = (*initial_ms as f64) * multiplier.powi(exponent);
                #[allow(clippy::cast_precision_loss)]
                let capped = delay.min(*max_ms as f64).max(0.0);
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let millis = capped.round() as u64;
                Duration::from_millis(millis)
            }
        }
    }
}

/// How a worker asks to be retired; resolved once at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportMode {
    /// Disconnect is sent to this system's supervisor over the bridge
    Channel,
    /// `recycle` is written to an external host manager's control endpoint
    HostDelegated(ControlEndpoint),
}

/// Address of a host manager's control endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEndpoint {
    /// TCP socket
    Tcp(SocketAddr),
    /// Unix domain socket
    #[cfg(unix)]
    Unix(PathBuf),
    /// Windows named pipe
    #[cfg(windows)]
    NamedPipe(String),
}

impl std::str::FromStr for ControlEndpoint {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ConfigError::InvalidEndpoint(s.to_string()));
        }
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Self::Tcp(addr));
        }
        #[cfg(windows)]
        if s.starts_with(r"\\.\pipe\") {
            return Ok(Self::NamedPipe(s.to_string()));
        }
        #[cfg(unix)]
        {
            Ok(Self::Unix(PathBuf::from(s)))
        }
        #[cfg(not(unix))]
        {
            Err(ConfigError::InvalidEndpoint(s.to_string()))
        }
    }
}

impl std::fmt::Display for ControlEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "{addr}"),
            #[cfg(unix)]
            Self::Unix(path) => write!(f, "{}", path.display()),
            #[cfg(windows)]
            Self::NamedPipe(name) => f.write_str(name),
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
