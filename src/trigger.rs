//! Trigger monitor.
//!
//! The scope never reports a discrete "triggered" event over the SCPI link,
//! so readiness is inferred from the trigger mode: a running mode means a
//! fresh acquisition is available.

use crate::context::{AcquisitionContext, Stage};
use crate::error::{DaqError, FaultSignature, TransportError};
use crate::instrument::InstrumentSession;
use crate::pv::definitions::TRIG_STATE;
use crate::pv::registry::{Publish, PvRegistry, ServerState};
use crate::pv::PvValue;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

/// Trigger mode query.
pub const TRIG_MODE_QUERY: &str = "TRIG_MODE?";

/// Trigger mode reported after the scope was stopped from its front panel.
pub const STOPPED_MODE: &str = "STOP";

/// Modes in which the scope keeps acquiring.
pub const RUNNING_MODES: &[&str] = &["AUTO", "NORM", "NORMAL", "RUN"];

/// Consecutive faults of one signature that end the server.
pub const FAULT_THRESHOLD: u32 = 2;

/// Outcome of one trigger check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// A running mode was reported; acquisition may proceed.
    Ready,
    /// Any other mode.
    Idle,
    /// The scope was stopped externally; a server `Stop` was requested.
    Stopped,
    /// The query failed.
    Fault(FaultSignature),
}

impl Readiness {
    /// Whether an acquisition should follow.
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }
}

/// Whether a reported trigger mode counts as running.
pub fn is_running_mode(mode: &str) -> bool {
    RUNNING_MODES.contains(&mode)
}

/// Polls the trigger mode and decides whether to acquire.
pub struct TriggerMonitor {
    session: Arc<InstrumentSession>,
    registry: Arc<dyn PvRegistry>,
}

impl TriggerMonitor {
    pub fn new(session: Arc<InstrumentSession>, registry: Arc<dyn PvRegistry>) -> Self {
        Self { session, registry }
    }

    /// One trigger check.
    pub async fn check(&self, ctx: &mut AcquisitionContext) -> Readiness {
        let started = Instant::now();
        let mode = match self.session.query(TRIG_MODE_QUERY).await {
            Ok(mode) => mode,
            Err(err) => return self.on_fault(ctx, err).await,
        };
        ctx.reset_faults();

        if mode == STOPPED_MODE {
            warn!("Scope was stopped externally; stopping server");
            self.registry.request_server_state(ServerState::Stop);
            return Readiness::Stopped;
        }

        if let Err(err) = self
            .registry
            .publish(TRIG_STATE, PvValue::from(mode.as_str()), Publish::if_changed())
        {
            warn!(error = %err, "Failed to publish trigger state");
        }

        if !is_running_mode(&mode) {
            return Readiness::Idle;
        }
        ctx.acq_count += 1;
        ctx.trig_time = Some(Utc::now());
        ctx.timing.set(Stage::TriggerDetection, started.elapsed());
        debug!(acquisition = ctx.acq_count, %mode, "Ready for acquisition");
        Readiness::Ready
    }

    async fn on_fault(&self, ctx: &mut AcquisitionContext, err: DaqError) -> Readiness {
        // Session queries only fail on the link; anything else is a bad exchange.
        let signature = err
            .as_transport()
            .map_or(FaultSignature::Protocol, TransportError::signature);

        let count = ctx.record_fault(signature);
        if count == FAULT_THRESHOLD {
            error!(
                fault = %signature,
                count,
                "Processing stopped: repeated fault in trigger query"
            );
            self.registry.request_server_state(ServerState::Exit);
        } else {
            warn!(fault = %signature, count, error = %err, "Fault during trigger query");
        }
        self.session.clear_status().await;
        Readiness::Fault(signature)
    }
}
