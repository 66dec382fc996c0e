//! Error types for autoswitch
//!
//! One enum per concern, mirroring the failure taxonomy of the switch
//! protocol:
//! - Oracle failures (version source unreachable or empty)
//! - Transport failures (retirement signal could not be delivered)
//! - Launch failures (replacement process could not be started)
//! - Workload faults (the user's entry point failed)

use crate::state_machine::WorkerState;
use crate::types::{SlotId, WorkerId};
use std::path::PathBuf;

/// Umbrella error for the whole crate
#[derive(Debug, thiserror::Error)]
pub enum SwitchError {
    /// Version oracle failure
    #[error("oracle error: {0}")]
    Oracle(#[from] OracleError),

    /// Retirement transport failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Wire protocol failure
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Worker launch failure
    #[error("launch error: {0}")]
    Launch(#[from] LaunchError),

    /// Configuration failure
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Worker runtime failure
    #[error("worker error: {0}")]
    Worker(#[from] WorkerError),

    /// Supervisor failure
    #[error("supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),
}

impl SwitchError {
    /// Process exit code this error maps to
    #[inline]
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        1
    }

    /// Check if the operation that produced this error may succeed when retried
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Oracle(err) => err.is_retryable(),
            Self::Transport(_) | Self::Launch(_) => true,
            Self::Protocol(_) | Self::Config(_) | Self::Worker(_) | Self::Supervisor(_) => false,
        }
    }
}

/// Version oracle errors
///
/// `NoVersion` is kept apart from the failure variants so that callers can
/// tell "the source answered, but has nothing" from "the source is broken".
#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    /// The source was reachable but holds no version
    #[error("no version available")]
    NoVersion,

    /// Reading a version file failed
    #[error("failed to read version from {path}: {source}")]
    Io {
        /// File that was read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Integrator-defined failure
    #[error("version source failed: {0}")]
    Source(String),
}

impl OracleError {
    /// Create a source error from any displayable value
    #[inline]
    pub fn failed(message: impl std::fmt::Display) -> Self {
        Self::Source(message.to_string())
    }

    /// Transient failures are worth another query
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::NoVersion)
    }
}

/// Retirement transport errors
///
/// Always swallowed at the drift gate: the next gate invocation retries.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Supervisor link is gone
    #[error("supervisor channel closed")]
    ChannelClosed,

    /// Control endpoint could not be reached
    #[error("control endpoint {endpoint} unreachable: {source}")]
    EndpointUnreachable {
        /// Endpoint address
        endpoint: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Writing to the channel or endpoint failed
    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),

    /// Message could not be encoded
    #[error("encoding failed: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Wire protocol errors
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Malformed JSON line
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// First line on a bridge connection was not a handshake
    #[error("expected hello handshake")]
    MissingHandshake,

    /// Handshake carried a token from another session
    #[error("handshake token mismatch for worker {0}")]
    TokenMismatch(WorkerId),

    /// Connection closed mid-handshake
    #[error("connection closed before handshake")]
    ClosedBeforeHandshake,

    /// Socket failure
    #[error("bridge I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Worker launch errors
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    /// The OS refused to start the process
    #[error("failed to spawn worker {worker_id}: {source}")]
    Spawn {
        /// Worker that could not be started
        worker_id: WorkerId,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The current executable could not be located for re-execution
    #[error("cannot resolve current executable: {0}")]
    CurrentExe(#[source] std::io::Error),

    /// Launcher-specific failure
    #[error("launcher failed: {0}")]
    Other(String),
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Host-delegated mode needs a control endpoint
    #[error("host-delegated mode requires a control endpoint (set IISNODE_CONTROL_PIPE)")]
    MissingControlEndpoint,

    /// Endpoint string could not be understood
    #[error("invalid control endpoint: {0}")]
    InvalidEndpoint(String),

    /// Worker bootstrap variables were present but unusable
    #[error("invalid worker bootstrap variable {name}: {value}")]
    InvalidBootstrap {
        /// Variable name
        name: &'static str,
        /// Offending value
        value: String,
    },

    /// At least one slot is required
    #[error("slot count must be at least 1")]
    NoSlots,

    /// Config file could not be read
    #[error("failed to read config {path}: {source}")]
    Read {
        /// File path
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Config file could not be parsed
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Lifecycle state machine errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    /// Transition not in the allowed table
    #[error("illegal worker transition {from:?} -> {to:?}")]
    IllegalTransition {
        /// Current state
        from: WorkerState,
        /// Requested state
        to: WorkerState,
    },
}

/// Worker runtime errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Startup version fetch failed
    #[error("startup version fetch failed: {0}")]
    StartupVersion(#[source] OracleError),

    /// Entry point returned an error
    #[error("workload failed: {0}")]
    Workload(String),

    /// Entry point panicked
    #[error("workload panicked: {0}")]
    Panicked(String),

    /// Could not connect to the supervisor
    #[error("supervisor link failed: {0}")]
    Link(#[source] ProtocolError),
}

/// Supervisor errors
///
/// Every variant is fatal for the process tree and maps to exit code 1.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// Initial version fetch failed
    #[error("initial version fetch failed: {0}")]
    InitialVersion(#[source] OracleError),

    /// Initial worker could not be launched
    #[error("initial launch failed: {0}")]
    InitialLaunch(#[source] LaunchError),

    /// A worker reported a workload fault
    #[error("worker {worker_id} runner failed: {error}")]
    RunnerFailed {
        /// Failing worker
        worker_id: WorkerId,
        /// Reported error text
        error: String,
    },

    /// A slot kept crashing past the restart budget
    #[error("slot {slot} exceeded {restarts} restarts within the restart window")]
    CrashLoop {
        /// Crashing slot
        slot: SlotId,
        /// Restarts counted in the window
        restarts: usize,
    },

    /// Control bridge could not be bound
    #[error("control bridge failed: {0}")]
    Bridge(#[source] std::io::Error),

    /// Supervisor task vanished
    #[error("supervisor task terminated unexpectedly")]
    Terminated,
}
