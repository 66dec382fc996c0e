//! Drift gate
//!
//! The workload calls [`DriftGate::check`] once per unit of work. The first
//! call that observes a version different from the worker's fixed version
//! sends exactly one retirement signal; every later call returns at once
//! without touching the oracle.
//!
//! # Invariant
//!
//! `signal_sent` flips false -> true through a single compare-and-swap, so
//! any number of concurrent checks that observe the same drift produce one
//! signal. A failed delivery flips it back, letting the next check retry.

use crate::error::OracleError;
use crate::oracle::VersionOracle;
use crate::transport::RetirementTransport;
use crate::types::VersionToken;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Per-worker drift detector
///
/// Cheap to clone; clones share the same flag.
#[derive(Clone)]
pub struct DriftGate {
    inner: Arc<GateInner>,
}

struct GateInner {
    fixed_version: VersionToken,
    oracle: Arc<dyn VersionOracle>,
    transport: Arc<dyn RetirementTransport>,
    signal_sent: AtomicBool,
}

impl DriftGate {
    /// Create a gate for a worker running `fixed_version`
    #[must_use]
    pub fn new(
        fixed_version: VersionToken,
        oracle: Arc<dyn VersionOracle>,
        transport: Arc<dyn RetirementTransport>,
    ) -> Self {
        Self {
            inner: Arc::new(GateInner {
                fixed_version,
                oracle,
                transport,
                signal_sent: AtomicBool::new(false),
            }),
        }
    }

    /// Check for drift at a unit-of-work boundary
    ///
    /// Transport failures are logged and swallowed; they never fail the
    /// caller's unit of work.
    ///
    /// # Errors
    /// Oracle failures are returned to the caller and do not trigger
    /// retirement.
    pub async fn check(&self) -> Result<(), OracleError> {
        let inner = &self.inner;
        if inner.signal_sent.load(Ordering::Acquire) {
            return Ok(());
        }

        let expected = inner.oracle.fetch_version().await?;
        if expected == inner.fixed_version {
            return Ok(());
        }

        if inner
            .signal_sent
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        debug!(
            running = %inner.fixed_version,
            expected = %expected,
            transport = inner.transport.name(),
            "version drift detected"
        );

        if let Err(err) = inner.transport.signal_retirement().await {
            inner.signal_sent.store(false, Ordering::Release);
            warn!(%err, "retirement signal failed; will retry on next check");
        }
        Ok(())
    }

    /// Version this worker was started with
    #[inline]
    #[must_use]
    pub fn fixed_version(&self) -> &VersionToken {
        &self.inner.fixed_version
    }

    /// Whether the retirement signal has been delivered
    #[inline]
    #[must_use]
    pub fn signal_sent(&self) -> bool {
        self.inner.signal_sent.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for DriftGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriftGate")
            .field("fixed_version", &self.inner.fixed_version)
            .field("signal_sent", &self.signal_sent())
            .finish_non_exhaustive()
    }
}
