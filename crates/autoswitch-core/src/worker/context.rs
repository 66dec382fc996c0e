//! Handle given to the user's entry point

use crate::bridge::SupervisorLink;
use crate::error::OracleError;
use crate::gate::DriftGate;
use crate::protocol::WorkerMessage;
use crate::types::{VersionToken, WorkerId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Everything a workload needs from the runtime
///
/// Cheap to clone; hand a clone to every connection handler.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    worker_id: Option<WorkerId>,
    version: VersionToken,
    gate: DriftGate,
    link: Option<SupervisorLink>,
    listening_sent: Arc<AtomicBool>,
    shutdown: watch::Receiver<bool>,
}

impl WorkerContext {
    pub(crate) fn new(
        worker_id: Option<WorkerId>,
        version: VersionToken,
        gate: DriftGate,
        link: Option<SupervisorLink>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            worker_id,
            version,
            gate,
            link,
            listening_sent: Arc::new(AtomicBool::new(false)),
            shutdown,
        }
    }

    /// Supervisor-assigned id; `None` in host-delegated mode
    #[inline]
    #[must_use]
    pub fn worker_id(&self) -> Option<WorkerId> {
        self.worker_id
    }

    /// Version fixed at startup
    #[inline]
    #[must_use]
    pub fn version(&self) -> &VersionToken {
        &self.version
    }

    /// The drift gate
    #[inline]
    #[must_use]
    pub fn gate(&self) -> &DriftGate {
        &self.gate
    }

    /// Shorthand for `gate().check()`
    ///
    /// # Errors
    /// Propagates oracle failures.
    pub async fn check_drift(&self) -> Result<(), OracleError> {
        self.gate.check().await
    }

    /// Report that the workload accepts traffic
    ///
    /// The supervisor retires a predecessor only after this arrives. Only
    /// the first call sends anything.
    pub async fn mark_listening(&self) {
        if self.listening_sent.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(version = %self.version, "worker listening");

        if let Some(link) = &self.link {
            if let Err(err) = link.send(&WorkerMessage::Listening).await {
                warn!(%err, "failed to report listening");
            }
        }
    }

    /// Whether a shutdown has been requested
    #[inline]
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once a shutdown has been requested
    pub async fn shutdown_requested(&self) {
        let mut shutdown = self.shutdown.clone();
        let _ = shutdown.wait_for(|requested| *requested).await;
    }
}
