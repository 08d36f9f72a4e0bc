//! PV registry boundary.
//!
//! The publish/subscribe framework that serves PVs to clients is an external
//! collaborator. The device server talks to it only through [`PvRegistry`]:
//! publish a value, read the last published value, inspect a PV, and drive or
//! observe the server state. The registry also owns the loop cadence
//! ([`PvRegistry::next_cycle`]).
//!
//! [`LocalRegistry`] is an in-process implementation used by the binary and
//! the tests. Publications are broadcast to subscribers; client writes
//! ("puts") are validated and queued for the control loop.

use super::{PvDecl, PvValue};
use crate::error::{AppResult, DaqError};
use crate::pv::definitions::{SERVER, SLEEP};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, trace, warn};

/// Capacity of the publication broadcast channel.
const PUBLICATION_CAPACITY: usize = 1024;

/// Server state driven by clients or by fault escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerState {
    /// Polling and acquisition enabled.
    Start,
    /// No polling; setters are still applied.
    Stop,
    /// Clear request; behaves like `Stop`.
    Clear,
    /// Terminate the control loop.
    Exit,
}

impl ServerState {
    /// Registry text of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerState::Start => "Start",
            ServerState::Stop => "Stop",
            ServerState::Clear => "Clear",
            ServerState::Exit => "Exit",
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServerState {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Start" => Ok(ServerState::Start),
            "Stop" => Ok(ServerState::Stop),
            "Clear" => Ok(ServerState::Clear),
            "Exit" => Ok(ServerState::Exit),
            other => Err(DaqError::InvalidValue {
                pv: SERVER.to_string(),
                reason: format!("unknown server state '{}'", other),
            }),
        }
    }
}

/// Publication options.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Publish {
    /// Explicit timestamp; wall clock at publication when `None`.
    pub timestamp: Option<DateTime<Utc>>,
    /// Skip the publication when the value equals the last published one.
    pub if_changed: bool,
}

impl Publish {
    /// Unconditional publication at wall-clock time.
    pub fn always() -> Self {
        Self::default()
    }

    /// Change-gated publication at wall-clock time.
    pub fn if_changed() -> Self {
        Self {
            if_changed: true,
            ..Self::default()
        }
    }

    /// Use an explicit timestamp.
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Registry view of one PV.
#[derive(Debug, Clone, PartialEq)]
pub struct PvInfo {
    /// Last published value.
    pub value: PvValue,
    /// Whether the PV is an enumerated choice.
    pub discrete: bool,
    /// Whether clients may write the PV.
    pub writable: bool,
}

/// What the control loop does with the next cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    /// Trigger check and conditional acquisition.
    Acquire,
    /// Low-frequency maintenance.
    Maintain,
}

/// A published value, as seen by subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct Publication {
    pub name: String,
    pub value: PvValue,
    pub timestamp: DateTime<Utc>,
}

/// A validated client write waiting for the control loop.
#[derive(Debug, Clone, PartialEq)]
pub struct PutRequest {
    pub name: String,
    pub value: PvValue,
}

/// Boundary to the PV publish/subscribe framework.
#[async_trait]
pub trait PvRegistry: Send + Sync {
    /// Publish a value. Returns whether a publication happened.
    fn publish(&self, name: &str, value: PvValue, options: Publish) -> AppResult<bool>;

    /// Last published value of a PV.
    fn current_value(&self, name: &str) -> Option<PvValue>;

    /// Value and flags of a PV.
    fn pv_info(&self, name: &str) -> Option<PvInfo>;

    /// Current server state.
    fn server_state(&self) -> ServerState;

    /// Request a server state transition.
    fn request_server_state(&self, state: ServerState);

    /// Receiver notified on every server state request.
    fn watch_server_state(&self) -> watch::Receiver<ServerState>;

    /// Wait out the cycle sleep and decide what the next cycle does.
    async fn next_cycle(&self) -> Cadence;
}

struct PvRecord {
    decl: PvDecl,
    value: PvValue,
    timestamp: DateTime<Utc>,
}

/// In-process PV registry.
pub struct LocalRegistry {
    prefix: String,
    pvs: RwLock<HashMap<String, PvRecord>>,
    state_tx: watch::Sender<ServerState>,
    publications: broadcast::Sender<Publication>,
    puts: mpsc::UnboundedSender<PutRequest>,
    periodic_interval: Duration,
    last_maintenance: Mutex<Instant>,
}

impl LocalRegistry {
    /// Create a registry serving `decls` under `prefix`.
    ///
    /// Returns the registry and the receiving end of the client-put queue,
    /// which belongs to the control loop. The server starts in `Stop`.
    pub fn new(
        prefix: impl Into<String>,
        decls: Vec<PvDecl>,
        periodic_interval: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<PutRequest>) {
        let now = Utc::now();
        let pvs = decls
            .into_iter()
            .map(|decl| {
                let record = PvRecord {
                    value: decl.initial.clone(),
                    decl,
                    timestamp: now,
                };
                (record.decl.name.clone(), record)
            })
            .collect();
        let (state_tx, _) = watch::channel(ServerState::Stop);
        let (publications, _) = broadcast::channel(PUBLICATION_CAPACITY);
        let (puts, put_rx) = mpsc::unbounded_channel();

        let registry = Self {
            prefix: prefix.into(),
            pvs: RwLock::new(pvs),
            state_tx,
            publications,
            puts,
            periodic_interval,
            last_maintenance: Mutex::new(Instant::now()),
        };
        (registry, put_rx)
    }

    /// Device prefix of all PV names.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Subscribe to publications.
    pub fn subscribe(&self) -> broadcast::Receiver<Publication> {
        self.publications.subscribe()
    }

    /// Timestamp of the last publication of a PV.
    pub fn timestamp(&self, name: &str) -> Option<DateTime<Utc>> {
        self.pvs.read().get(name).map(|record| record.timestamp)
    }

    /// Client write. Validated here, applied by the control loop.
    pub fn put(&self, name: &str, value: impl Into<PvValue>) -> AppResult<()> {
        let value = {
            let pvs = self.pvs.read();
            let record = pvs
                .get(name)
                .ok_or_else(|| DaqError::UnknownPv(name.to_string()))?;
            if !record.decl.writable {
                return Err(DaqError::ReadOnly(name.to_string()));
            }
            record.decl.normalize(value.into())?
        };
        debug!(pv = %name, %value, "Put request queued");
        self.puts
            .send(PutRequest {
                name: name.to_string(),
                value,
            })
            .map_err(|_| DaqError::LoopClosed)
    }

    fn cycle_sleep(&self) -> Duration {
        let seconds = self
            .current_value(SLEEP)
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        if seconds.is_finite() && seconds > 0.0 {
            Duration::from_secs_f64(seconds)
        } else {
            Duration::ZERO
        }
    }
}

#[async_trait]
impl PvRegistry for LocalRegistry {
    fn publish(&self, name: &str, value: PvValue, options: Publish) -> AppResult<bool> {
        let timestamp = options.timestamp.unwrap_or_else(Utc::now);
        let value = {
            let mut pvs = self.pvs.write();
            let record = pvs
                .get_mut(name)
                .ok_or_else(|| DaqError::UnknownPv(name.to_string()))?;
            let value = record.decl.normalize(value)?;
            if options.if_changed && record.value == value {
                return Ok(false);
            }
            if let (Some(alarm), Some(v)) = (record.decl.alarm, value.as_f64()) {
                if v < alarm.low || v > alarm.high {
                    warn!(pv = %name, value = v, low = alarm.low, high = alarm.high, "Value outside alarm limits");
                }
            }
            record.value = value.clone();
            record.timestamp = timestamp;
            value
        };
        trace!(pv = %format!("{}{}", self.prefix, name), %value, "publish");
        // No subscribers is not an error.
        let _ = self.publications.send(Publication {
            name: name.to_string(),
            value,
            timestamp,
        });
        Ok(true)
    }

    fn current_value(&self, name: &str) -> Option<PvValue> {
        self.pvs.read().get(name).map(|record| record.value.clone())
    }

    fn pv_info(&self, name: &str) -> Option<PvInfo> {
        self.pvs.read().get(name).map(|record| PvInfo {
            value: record.value.clone(),
            discrete: record.decl.kind.is_discrete(),
            writable: record.decl.writable,
        })
    }

    fn server_state(&self) -> ServerState {
        *self.state_tx.borrow()
    }

    fn request_server_state(&self, state: ServerState) {
        debug!(%state, "Server state requested");
        self.state_tx.send_replace(state);
        if let Err(err) = self.publish(SERVER, PvValue::from(state.as_str()), Publish::always()) {
            warn!(error = %err, "Failed to publish server state");
        }
    }

    fn watch_server_state(&self) -> watch::Receiver<ServerState> {
        self.state_tx.subscribe()
    }

    async fn next_cycle(&self) -> Cadence {
        tokio::time::sleep(self.cycle_sleep()).await;
        let mut last = self.last_maintenance.lock();
        if last.elapsed() >= self.periodic_interval {
            *last = Instant::now();
            Cadence::Maintain
        } else {
            Cadence::Acquire
        }
    }
}
