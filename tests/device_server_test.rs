//! End-to-end tests of the device server against the simulated scope.

use lecroy_daq::config::ServerConfig;
use lecroy_daq::context::AcquisitionContext;
use lecroy_daq::error::FaultSignature;
use lecroy_daq::instrument::mock::{MockScope, Scripted};
use lecroy_daq::instrument::InstrumentSession;
use lecroy_daq::pv::definitions::{declarations, ACQ_COUNT, SERVER, TRIG_STATE};
use lecroy_daq::pv::registry::{LocalRegistry, Publication, PutRequest, PvRegistry, ServerState};
use lecroy_daq::pv::PvValue;
use lecroy_daq::server::DeviceServer;
use lecroy_daq::trigger::{Readiness, TriggerMonitor};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

const RESOURCE: &str = "TCPIP::mock::INSTR";

/// Server over a four-channel declaration set.
fn create_server(
    scope: &MockScope,
) -> (Arc<LocalRegistry>, DeviceServer, mpsc::UnboundedReceiver<PutRequest>) {
    let mut config = ServerConfig::default();
    config.channels = 4;
    config.settle_ms = 0;
    let decls = declarations(config.channels, RESOURCE);
    let session = Arc::new(InstrumentSession::new(RESOURCE, scope.clone()));
    let (registry, puts) =
        LocalRegistry::new(config.prefix(), decls.clone(), Duration::from_secs(3600));
    let registry = Arc::new(registry);
    let server = DeviceServer::new(session, registry.clone(), &decls, &config)
        .with_ready_delay(Duration::from_millis(1));
    (registry, server, puts)
}

fn create_monitor(scope: &MockScope) -> (Arc<LocalRegistry>, TriggerMonitor) {
    let session = Arc::new(InstrumentSession::new(RESOURCE, scope.clone()));
    let (registry, _puts) =
        LocalRegistry::new("lecroy0:", declarations(1, RESOURCE), Duration::from_secs(3600));
    let registry = Arc::new(registry);
    let monitor = TriggerMonitor::new(session, registry.clone());
    (registry, monitor)
}

fn drain(rx: &mut broadcast::Receiver<Publication>) -> Vec<Publication> {
    let mut out = Vec::new();
    while let Ok(publication) = rx.try_recv() {
        out.push(publication);
    }
    out
}

#[tokio::test]
async fn test_external_stop_stops_server() {
    let scope = MockScope::lecroy(1);
    scope.script("TRIG_MODE?", ["RUN", "RUN", "STOP"]);
    let (registry, monitor) = create_monitor(&scope);
    registry.request_server_state(ServerState::Start);
    let mut ctx = AcquisitionContext::new();

    assert_eq!(monitor.check(&mut ctx).await, Readiness::Ready);
    assert_eq!(monitor.check(&mut ctx).await, Readiness::Ready);
    assert_eq!(registry.server_state(), ServerState::Start);

    assert_eq!(monitor.check(&mut ctx).await, Readiness::Stopped);
    assert_eq!(registry.server_state(), ServerState::Stop);
    assert_eq!(ctx.acq_count, 2);
    assert!(ctx.faults_clear());
    // STOP is not a trigger state worth publishing.
    assert_eq!(registry.current_value(TRIG_STATE), Some(PvValue::from("RUN")));
}

#[tokio::test]
async fn test_repeated_timeout_requests_exit_once() {
    let scope = MockScope::lecroy(1);
    scope.script("TRIG_MODE?", vec![Scripted::Fault(FaultSignature::Timeout); 3]);
    let (registry, monitor) = create_monitor(&scope);
    registry.request_server_state(ServerState::Start);
    let mut rx = registry.subscribe();
    let mut ctx = AcquisitionContext::new();

    let first = monitor.check(&mut ctx).await;
    assert_eq!(first, Readiness::Fault(FaultSignature::Timeout));
    assert_eq!(registry.server_state(), ServerState::Start);

    monitor.check(&mut ctx).await;
    assert_eq!(registry.server_state(), ServerState::Exit);

    monitor.check(&mut ctx).await;
    assert_eq!(ctx.fault_count(FaultSignature::Timeout), 3);

    let exits = drain(&mut rx)
        .into_iter()
        .filter(|p| p.name == SERVER && p.value == PvValue::from("Exit"))
        .count();
    assert_eq!(exits, 1);
    assert_eq!(scope.sent().iter().filter(|c| *c == "*CLS").count(), 3);
}

#[tokio::test]
async fn test_norm_trigger_publishes_enabled_channels() {
    let scope = MockScope::lecroy(2);
    let (registry, mut server, _puts) = create_server(&scope);

    server.on_server_state(ServerState::Start).await;
    // Starting forces AUTO; the scope then switches to NORM.
    scope.set_reply("TRIG_MODE?", "NORM");
    let mut rx = registry.subscribe();

    let report = server.poll().await.expect("scope in NORM should acquire");
    assert!(!report.aborted);
    assert_eq!(report.published, vec![1, 2]);
    assert_eq!(server.context().acq_count, 1);

    let published = drain(&mut rx);
    let named = |name: &str| published.iter().filter(|p| p.name == name).count();
    assert_eq!(named(TRIG_STATE), 1);
    assert_eq!(named(ACQ_COUNT), 1);
    for channel in ["c01", "c02"] {
        assert_eq!(named(&format!("{}Waveform", channel)), 1);
        assert_eq!(named(&format!("{}Peak2Peak", channel)), 1);
        assert_eq!(named(&format!("{}Mean", channel)), 1);
    }
    assert!(!published
        .iter()
        .any(|p| p.name.starts_with("c03") || p.name.starts_with("c04")));

    let trig_time = server.context().trig_time.expect("trigger time recorded");
    assert!(published
        .iter()
        .filter(|p| p.name.starts_with("c0") || p.name == ACQ_COUNT)
        .all(|p| p.timestamp == trig_time));
    assert_eq!(registry.current_value(ACQ_COUNT), Some(PvValue::Int(1)));
}

#[tokio::test]
async fn test_second_check_does_not_republish_trigger_state() {
    let scope = MockScope::lecroy(1);
    let (registry, mut server, _puts) = create_server(&scope);
    server.on_server_state(ServerState::Start).await;
    let mut rx = registry.subscribe();

    server.poll().await;
    server.poll().await;

    let states = drain(&mut rx)
        .into_iter()
        .filter(|p| p.name == TRIG_STATE)
        .count();
    assert_eq!(states, 1);
    assert_eq!(server.context().acq_count, 2);
}

#[tokio::test]
async fn test_run_loop_ends_on_exit_put() {
    let scope = MockScope::lecroy(2);
    let (registry, mut server, puts) = create_server(&scope);
    server.startup(Duration::from_millis(5)).await.unwrap();
    assert_eq!(registry.server_state(), ServerState::Start);

    let client = registry.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.put(SERVER, "Exit").unwrap();
    });

    tokio::time::timeout(Duration::from_secs(5), server.run(puts))
        .await
        .expect("control loop should exit")
        .unwrap();

    assert_eq!(registry.server_state(), ServerState::Exit);
    let acquisitions = registry.current_value(ACQ_COUNT).and_then(|v| v.as_i64());
    assert!(acquisitions.unwrap_or(0) > 0);
}

#[tokio::test]
async fn test_stopped_server_still_applies_writes() {
    let scope = MockScope::lecroy(2);
    let (registry, server, puts) = create_server(&scope);
    assert_eq!(registry.server_state(), ServerState::Stop);

    registry.put("c01VoltsPerDiv", 0.5).unwrap();
    registry.put(SERVER, "Exit").unwrap();

    tokio::time::timeout(Duration::from_secs(5), server.run(puts))
        .await
        .expect("control loop should exit")
        .unwrap();

    let sent = scope.sent();
    assert!(sent.contains(&"C1:VOLT_DIV 0.5".to_string()));
    // Never started: no trigger polling.
    assert!(!sent.iter().any(|c| c == "TRIG_MODE?"));
    assert_eq!(
        registry.current_value("c01VoltsPerDiv"),
        Some(PvValue::Float(0.5))
    );
}

#[tokio::test]
async fn test_put_validation_rejects_bad_writes() {
    let scope = MockScope::lecroy(1);
    let (registry, _server, _puts) = create_server(&scope);

    assert!(registry.put("trigMode", "FREE").is_err());
    assert!(registry.put(ACQ_COUNT, 3i64).is_err());
    assert!(registry.put("nope", 1.0).is_err());
    assert!(registry.put("trigMode", "NORM").is_ok());
}

#[tokio::test]
async fn test_integer_write_does_not_break_resync() {
    let scope = MockScope::lecroy(1);
    let (registry, mut server, mut puts) = create_server(&scope);

    registry.put("c01VoltsPerDiv", 1i64).unwrap();
    let put = puts.try_recv().unwrap();
    server.apply(put).await;
    assert_eq!(
        registry.current_value("c01VoltsPerDiv"),
        Some(PvValue::Float(1.0))
    );

    scope.set_reply("C1:VOLT_DIV?", "5.00E-01");
    server.on_server_state(ServerState::Start).await;
    assert_eq!(
        registry.current_value("c01VoltsPerDiv"),
        Some(PvValue::Float(0.5))
    );
}
