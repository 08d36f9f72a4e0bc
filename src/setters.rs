//! Client write handlers.
//!
//! Writes arrive through the registry's put queue and are applied by the
//! control loop between cycles. PVs without a setter are simply published.

use crate::command::CommandTemplate;
use crate::error::{AppResult, DaqError};
use crate::pv::definitions::{INSTR_CMD_R, REC_LENGTH_S, SETUP, STATUS, TRIGGER};
use crate::pv::registry::{PutRequest, ServerState};
use crate::pv::{PvValue, SetterKind};
use crate::server::DeviceServer;
use tracing::{debug, error, warn};

const STORE_PANEL: &str = "Store Panel";
const RECALL_PANEL: &str = "Recall Panel";
const FORCE_TRIGGER: &str = "Force!";

impl DeviceServer {
    /// Apply one client write.
    pub async fn apply(&mut self, put: PutRequest) {
        let Some(setter) = self.commands.setter(&put.name) else {
            self.publish(&put.name, put.value);
            return;
        };
        debug!(pv = %put.name, value = %put.value, ?setter, "Applying write");

        let result = match setter {
            SetterKind::Scpi => self.set_scpi(&put.name, &put.value).await,
            SetterKind::Vbs => self.set_vbs(&put.name, &put.value).await,
            SetterKind::Setup => self.set_setup(&put.value).await,
            SetterKind::Trigger => self.set_trigger(&put.value).await,
            SetterKind::RecordLength => self.set_record_length(&put.value).await,
            SetterKind::InstrumentCommand => self.set_instrument_command(&put.name, &put.value).await,
            SetterKind::ServerState => self.set_server_state(&put.value),
            SetterKind::CycleSleep => {
                self.publish(&put.name, put.value.clone());
                Ok(())
            }
        };

        if let Err(err) = result {
            error!(pv = %put.name, error = %err, "Write failed");
            if err.is_transport() {
                self.session.clear_status().await;
            }
        }
    }

    async fn set_scpi(&self, pv: &str, value: &PvValue) -> AppResult<()> {
        let command = match self.commands.template(pv) {
            Some(CommandTemplate::Special { raw }) if !raw.contains('?') => raw.trim().to_string(),
            _ => self
                .commands
                .command(pv)
                .ok_or_else(|| no_command(pv))?
                .to_string(),
        };
        if let Some(reply) = self.session.command(&format!("{} {}", command, value)).await? {
            debug!(pv, reply = %reply, "Reply to setting");
        }
        self.publish(pv, value.clone());
        Ok(())
    }

    async fn set_vbs(&self, pv: &str, value: &PvValue) -> AppResult<()> {
        let path = self
            .commands
            .template(pv)
            .and_then(CommandTemplate::vbs_path)
            .ok_or_else(|| no_command(pv))?;
        self.session
            .write(&format!("VBS {} = \"{}\"", path, value))
            .await?;
        self.publish(pv, value.clone());
        Ok(())
    }

    async fn set_setup(&self, value: &PvValue) -> AppResult<()> {
        let action = value.to_string();
        let status = match action.as_str() {
            STORE_PANEL => {
                self.session.write("PANEL_SETUP STORE,\"LATEST\"").await?;
                format!("Panel setup action: {}", action)
            }
            RECALL_PANEL => {
                if self.registry.server_state() == ServerState::Start {
                    warn!("Please set server to Stop before recalling the panel");
                    self.publish(SETUP, PvValue::from("Setup"));
                    return Ok(());
                }
                self.session.write("PANEL_SETUP RECALL,\"LATEST\"").await?;
                "Panel setup recalled".to_string()
            }
            _ => return Ok(()),
        };

        self.publish(SETUP, PvValue::from("Setup"));
        self.publish(STATUS, PvValue::from(status));
        if action == RECALL_PANEL {
            self.synchronizer.synchronize().await;
        }
        Ok(())
    }

    async fn set_trigger(&self, value: &PvValue) -> AppResult<()> {
        if value.as_text() == Some(FORCE_TRIGGER) {
            self.session.write("ARM").await?;
            self.publish(TRIGGER, PvValue::from("Trigger"));
        }
        Ok(())
    }

    async fn set_record_length(&mut self, value: &PvValue) -> AppResult<()> {
        let memory_size = value.to_string().to_uppercase();
        self.session.write(&format!("MEMORY_SIZE {}", memory_size)).await?;
        self.publish(REC_LENGTH_S, value.clone());
        if let Err(err) = self.periodic.refresh_parameters(&mut self.ctx).await {
            warn!(error = %err, "Failed to refresh horizontal parameters");
        }
        Ok(())
    }

    async fn set_instrument_command(&self, pv: &str, value: &PvValue) -> AppResult<()> {
        let command = value.to_string();
        self.publish(INSTR_CMD_R, PvValue::from(""));
        let reply = self.session.command(&command).await;
        self.publish(pv, value.clone());
        if let Some(reply) = reply? {
            self.publish(INSTR_CMD_R, PvValue::from(reply));
        }
        Ok(())
    }

    fn set_server_state(&self, value: &PvValue) -> AppResult<()> {
        let state: ServerState = value.to_string().parse()?;
        self.registry.request_server_state(state);
        Ok(())
    }
}

fn no_command(pv: &str) -> DaqError {
    DaqError::InvalidValue {
        pv: pv.to_string(),
        reason: "no instrument command defined".into(),
    }
}
