//! Settings synchronizer.
//!
//! Reads every queryable setting back from the instrument and republishes the
//! PVs whose value differs from the last published one. Used at startup,
//! when the server starts, and after a panel recall.

use crate::command::CommandMap;
use crate::error::AppResult;
use crate::instrument::InstrumentSession;
use crate::pv::registry::{Publish, PvRegistry};
use crate::pv::PvValue;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Walks the command map and adopts the instrument's current settings.
pub struct SettingsSynchronizer {
    session: Arc<InstrumentSession>,
    registry: Arc<dyn PvRegistry>,
    commands: Arc<CommandMap>,
}

impl SettingsSynchronizer {
    pub fn new(
        session: Arc<InstrumentSession>,
        registry: Arc<dyn PvRegistry>,
        commands: Arc<CommandMap>,
    ) -> Self {
        Self {
            session,
            registry,
            commands,
        }
    }

    /// Synchronize all settings; returns the number of PVs published.
    ///
    /// A transport fault ends the walk early and is logged, never returned.
    /// Every publication of one call carries the same timestamp.
    pub async fn synchronize(&self) -> usize {
        info!(entries = self.commands.len(), "Adopting local settings");
        let timestamp = Utc::now();
        let mut changed = 0;

        for entry in self.commands.entries() {
            let reply = match self.session.query(&entry.query()).await {
                Ok(reply) => reply,
                Err(err) if err.is_transport() => {
                    error!(pv = %entry.pv, error = %err, "Transport fault while adopting settings");
                    break;
                }
                Err(err) => {
                    debug!(pv = %entry.pv, error = %err, "Error reading setting");
                    continue;
                }
            };

            let value = match self.coerce(&entry.pv, &reply) {
                Ok(Some(value)) => value,
                Ok(None) => continue,
                Err(err) => {
                    debug!(pv = %entry.pv, error = %err, "Setting skipped");
                    continue;
                }
            };

            match self.registry.publish(&entry.pv, value, Publish::if_changed().at(timestamp)) {
                Ok(true) => {
                    debug!(pv = %entry.pv, reply = %reply, "Setting adopted");
                    changed += 1;
                }
                Ok(false) => {}
                Err(err) => debug!(pv = %entry.pv, error = %err, "Setting rejected"),
            }
        }

        if changed == 0 {
            info!("Local setting did not change");
        } else {
            info!(changed, "Local settings adopted");
        }
        changed
    }

    /// Convert a reply into the PV's value kind.
    ///
    /// Discrete PVs take the reply text as is (legality is checked on
    /// publication). Everything else keeps its current representation.
    fn coerce(&self, pv: &str, reply: &str) -> AppResult<Option<PvValue>> {
        let Some(info) = self.registry.pv_info(pv) else {
            return Ok(None);
        };
        if info.discrete {
            return Ok(Some(PvValue::from(reply.trim())));
        }
        info.value.coerce_like(pv, reply).map(Some)
    }
}
