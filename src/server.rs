//! Device server and control loop.
//!
//! [`DeviceServer`] owns the acquisition context and one instance of every
//! component. A single task runs [`DeviceServer::run`], which
//!
//! - reacts to server state changes (`Start` reconfigures the scope and
//!   resynchronizes settings; `Stop`/`Clear` pause polling; `Exit` ends the
//!   loop),
//! - applies queued client writes between cycles,
//! - while started, runs either a trigger check with conditional acquisition
//!   or a maintenance pass, as decided by the registry's cadence policy.

use crate::command::CommandMap;
use crate::config::ServerConfig;
use crate::context::AcquisitionContext;
use crate::error::{AppResult, DaqError};
use crate::instrument::{InstrumentSession, CLEAR_STATUS};
use crate::periodic::PeriodicUpdater;
use crate::pv::definitions::{SLEEP, STATUS, VERSION, VISA_RESOURCE};
use crate::pv::registry::{Cadence, Publish, PutRequest, PvRegistry, ServerState};
use crate::pv::{PvDecl, PvValue};
use crate::sync::SettingsSynchronizer;
use crate::trigger::{is_running_mode, TriggerMonitor, TRIG_MODE_QUERY};
use crate::waveform::{AcquisitionReport, WaveformAcquisitor};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Binary transfer setup sent on every start.
const TRANSFER_SETUP: &[&str] = &["COMM_FORMAT DEF9,WORD,BIN", "COMM_ORDER HI", "COMM_HEADER OFF"];

/// Attempts made while waiting for a running trigger mode after start.
pub const READY_ATTEMPTS: u32 = 5;

/// Delay before each readiness attempt.
pub const READY_DELAY: Duration = Duration::from_millis(100);

/// Open the instrument: clear the I/O buffers, identify, clear status.
///
/// Any failure is a fatal startup fault.
pub async fn identify(session: &InstrumentSession) -> AppResult<String> {
    let startup = |step: &str, err: DaqError| {
        DaqError::Startup(format!("{} on {} failed: {}", step, session.resource(), err))
    };
    let mut link = session.lock().await;
    debug!(resource = session.resource(), timeout = ?link.timeout(), "Opening instrument");

    link.clear().await.map_err(|e| startup("buffer clear", e))?;
    let idn = link.query("*IDN?").await.map_err(|e| startup("*IDN? query", e))?;
    info!(idn = %idn, "Instrument identified");

    let vendor = idn.to_ascii_uppercase();
    if !(vendor.contains("LECROY") || vendor.contains("TELEDYNE")) {
        warn!(idn = %idn, "Instrument may not be a LeCroy/Teledyne oscilloscope");
    }

    link.write(CLEAR_STATUS).await.map_err(|e| startup("status clear", e))?;
    Ok(idn)
}

/// Oscilloscope device server.
pub struct DeviceServer {
    pub(crate) session: Arc<InstrumentSession>,
    pub(crate) registry: Arc<dyn PvRegistry>,
    pub(crate) commands: Arc<CommandMap>,
    pub(crate) ctx: AcquisitionContext,
    pub(crate) trigger: TriggerMonitor,
    pub(crate) acquisitor: WaveformAcquisitor,
    pub(crate) periodic: PeriodicUpdater,
    pub(crate) synchronizer: SettingsSynchronizer,
    settle: Duration,
    ready_delay: Duration,
}

impl DeviceServer {
    /// Assemble the server around an opened session.
    pub fn new(
        session: Arc<InstrumentSession>,
        registry: Arc<dyn PvRegistry>,
        decls: &[PvDecl],
        config: &ServerConfig,
    ) -> Self {
        let commands = Arc::new(CommandMap::build(decls));
        Self {
            trigger: TriggerMonitor::new(session.clone(), registry.clone()),
            acquisitor: WaveformAcquisitor::new(session.clone(), registry.clone()),
            periodic: PeriodicUpdater::new(session.clone(), registry.clone(), config.channels),
            synchronizer: SettingsSynchronizer::new(
                session.clone(),
                registry.clone(),
                commands.clone(),
            ),
            session,
            registry,
            commands,
            ctx: AcquisitionContext::new(),
            settle: config.settle(),
            ready_delay: READY_DELAY,
        }
    }

    /// Override the delay between readiness attempts.
    pub fn with_ready_delay(mut self, delay: Duration) -> Self {
        self.ready_delay = delay;
        self
    }

    /// Acquisition state, for inspection.
    pub fn context(&self) -> &AcquisitionContext {
        &self.ctx
    }

    /// Command map built from the declarations.
    pub fn commands(&self) -> &CommandMap {
        &self.commands
    }

    /// Identify the instrument, publish the static PVs, adopt the current
    /// settings and request `Start`.
    pub async fn startup(&mut self, cycle_sleep: Duration) -> AppResult<()> {
        let idn = identify(&self.session).await?;

        self.publish(VISA_RESOURCE, PvValue::from(self.session.resource()));
        self.publish(VERSION, PvValue::from(env!("CARGO_PKG_VERSION")));
        self.publish(SLEEP, PvValue::Float(cycle_sleep.as_secs_f64()));
        self.publish(STATUS, PvValue::from(idn));

        self.synchronizer.synchronize().await;
        self.registry.request_server_state(ServerState::Start);
        Ok(())
    }

    /// Run until `Exit`.
    pub async fn run(mut self, mut puts: mpsc::UnboundedReceiver<PutRequest>) -> AppResult<()> {
        let mut states = self.registry.watch_server_state();
        let mut state = *states.borrow_and_update();
        let mut puts_open = true;
        info!(%state, "Control loop started");
        self.on_server_state(state).await;

        while state != ServerState::Exit {
            if state == ServerState::Start {
                while let Ok(put) = puts.try_recv() {
                    self.apply(put).await;
                }
                if !states.has_changed().unwrap_or(false) {
                    match self.registry.next_cycle().await {
                        Cadence::Acquire => {
                            self.poll().await;
                        }
                        Cadence::Maintain => self.maintain().await,
                    }
                }
            } else {
                tokio::select! {
                    changed = states.changed() => {
                        if changed.is_err() {
                            warn!("Server state channel closed");
                            break;
                        }
                        state = *states.borrow_and_update();
                        self.on_server_state(state).await;
                        continue;
                    }
                    put = puts.recv(), if puts_open => match put {
                        Some(put) => self.apply(put).await,
                        None => puts_open = false,
                    },
                }
            }

            if states.has_changed().unwrap_or(false) {
                state = *states.borrow_and_update();
                self.on_server_state(state).await;
            }
        }

        info!("Server is exited");
        Ok(())
    }

    /// React to a server state change.
    pub async fn on_server_state(&mut self, state: ServerState) {
        match state {
            ServerState::Start => {
                info!("Starting device");
                self.start_device().await;
            }
            ServerState::Stop => info!("Device stopped"),
            ServerState::Clear => info!("Device cleared"),
            ServerState::Exit => info!("Exit requested"),
        }
    }

    async fn start_device(&mut self) {
        if let Err(err) = self.configure().await {
            error!(error = %err, "Failed to configure data transfer");
            self.session.clear_status().await;
        }
        self.synchronizer.synchronize().await;
        if let Err(err) = self.session.write("TRIG_MODE AUTO").await {
            warn!(error = %err, "Failed to set trigger mode");
        }
        self.wait_for_ready().await;
        self.maintain().await;
    }

    /// Configure the binary waveform transfer format.
    pub async fn configure(&self) -> AppResult<()> {
        let mut link = self.session.lock().await;
        for command in TRANSFER_SETUP {
            link.write(command).await?;
        }
        debug!("Data transfer configured");
        Ok(())
    }

    /// Wait a bounded time for a running trigger mode.
    pub async fn wait_for_ready(&self) -> bool {
        for attempt in 1..=READY_ATTEMPTS {
            tokio::time::sleep(self.ready_delay).await;
            match self.session.query(TRIG_MODE_QUERY).await {
                Ok(mode) if is_running_mode(&mode) => {
                    debug!(attempt, %mode, "Scope ready");
                    return true;
                }
                Ok(mode) => debug!(attempt, %mode, "Scope not ready yet"),
                Err(err) => debug!(attempt, error = %err, "Readiness query failed"),
            }
        }
        let waited = self.ready_delay * READY_ATTEMPTS;
        warn!(?waited, "Scope may not be ready");
        false
    }

    /// Trigger check followed by an acquisition when ready.
    pub async fn poll(&mut self) -> Option<AcquisitionReport> {
        if !self.trigger.check(&mut self.ctx).await.is_ready() {
            return None;
        }
        if !self.settle.is_zero() {
            tokio::time::sleep(self.settle).await;
        }
        Some(self.acquisitor.acquire(&mut self.ctx).await)
    }

    /// Maintenance pass.
    pub async fn maintain(&mut self) {
        self.periodic.update(&mut self.ctx).await;
    }

    pub(crate) fn publish(&self, name: &str, value: PvValue) {
        if let Err(err) = self.registry.publish(name, value, Publish::always()) {
            warn!(pv = %name, error = %err, "Publication failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::mock::MockScope;
    use crate::pv::definitions::declarations;
    use crate::pv::registry::LocalRegistry;

    fn fixture(scope: &MockScope) -> (Arc<LocalRegistry>, DeviceServer, mpsc::UnboundedReceiver<PutRequest>) {
        let mut config = ServerConfig::default();
        config.channels = 2;
        config.settle_ms = 0;
        let decls = declarations(config.channels, "TCPIP::mock::INSTR");
        let session = Arc::new(InstrumentSession::new("TCPIP::mock::INSTR", scope.clone()));
        let (registry, puts) = LocalRegistry::new(config.prefix(), decls.clone(), Duration::from_secs(3600));
        let registry = Arc::new(registry);
        let server = DeviceServer::new(session, registry.clone(), &decls, &config)
            .with_ready_delay(Duration::from_millis(1));
        (registry, server, puts)
    }

    #[tokio::test]
    async fn startup_identifies_and_requests_start() {
        let scope = MockScope::lecroy(2);
        let (registry, mut server, _puts) = fixture(&scope);
        server.startup(Duration::from_millis(20)).await.unwrap();

        let sent = scope.sent();
        assert_eq!(&sent[..2], &["*IDN?".to_string(), "*CLS".to_string()]);
        assert_eq!(registry.server_state(), ServerState::Start);
        assert_eq!(registry.current_value(SLEEP), Some(PvValue::Float(0.02)));
        assert_eq!(
            registry.current_value(VISA_RESOURCE),
            Some(PvValue::from("TCPIP::mock::INSTR"))
        );
    }

    #[tokio::test]
    async fn startup_fails_without_identification() {
        let scope = MockScope::new();
        let (_registry, mut server, _puts) = fixture(&scope);
        let err = server.startup(Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, DaqError::Startup(_)));
    }

    #[tokio::test]
    async fn start_configures_transfer_and_forces_auto_mode() {
        let scope = MockScope::lecroy(2);
        scope.set_reply("TRIG_MODE?", "STOP");
        let (_registry, mut server, _puts) = fixture(&scope);

        server.on_server_state(ServerState::Start).await;
        let sent = scope.sent();
        let position = |cmd: &str| sent.iter().position(|c| c == cmd);
        assert!(position("COMM_FORMAT DEF9,WORD,BIN").is_some());
        assert!(position("COMM_ORDER HI") < position("TRIG_MODE AUTO"));
        // The write is read back, so the scope is ready on the first attempt.
        let forced = position("TRIG_MODE AUTO").unwrap();
        assert_eq!(sent[forced..].iter().filter(|c| *c == "TRIG_MODE?").count(), 1);
        assert_eq!(server.context().enabled_channels.len(), 2);
    }

    #[tokio::test]
    async fn readiness_wait_is_bounded() {
        let scope = MockScope::lecroy(2);
        scope.script(TRIG_MODE_QUERY, vec!["SINGLE"; READY_ATTEMPTS as usize]);
        let (_registry, server, _puts) = fixture(&scope);

        assert!(!server.wait_for_ready().await);
        let queries = scope.sent().iter().filter(|c| *c == TRIG_MODE_QUERY).count();
        assert_eq!(queries, READY_ATTEMPTS as usize);
    }

    #[tokio::test]
    async fn start_continues_when_scope_never_runs() {
        let scope = MockScope::lecroy(2);
        // One reply for the settings pass, then every readiness attempt.
        scope.script(TRIG_MODE_QUERY, vec!["SINGLE"; READY_ATTEMPTS as usize + 1]);
        let (registry, mut server, _puts) = fixture(&scope);

        server.on_server_state(ServerState::Start).await;
        let sent = scope.sent();
        let forced = sent.iter().position(|c| c == "TRIG_MODE AUTO").unwrap();
        let after = &sent[forced..];
        assert_eq!(
            after.iter().filter(|c| *c == TRIG_MODE_QUERY).count(),
            READY_ATTEMPTS as usize
        );
        // Maintenance still runs after the wait gives up.
        assert!(after.contains(&"TIME_DIV?".to_string()));
        assert_eq!(server.context().enabled_channels.len(), 2);
        assert_eq!(registry.current_value("trigMode"), Some(PvValue::from("SINGLE")));
    }

    #[tokio::test]
    async fn idle_mode_does_not_acquire() {
        let scope = MockScope::lecroy(1);
        scope.set_reply("TRIG_MODE?", "SINGLE");
        let (_registry, mut server, _puts) = fixture(&scope);
        server.maintain().await;

        assert!(server.poll().await.is_none());
        assert!(!scope.sent().iter().any(|c| c.ends_with(":WF? DAT1")));
    }
}
