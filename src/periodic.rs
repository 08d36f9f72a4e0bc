//! Low-frequency maintenance.
//!
//! Refreshes the enabled-channel set and the horizontal parameters, then
//! republishes the loss counter and the timing diagnostics. Nothing here may
//! halt acquisition: failures are logged and swallowed.

use crate::context::AcquisitionContext;
use crate::error::AppResult;
use crate::instrument::InstrumentSession;
use crate::pv::definitions::{
    LOST_TRIGS, ON_OFF, REC_LENGTH_R, SAMPLING_RATE, TIME_PER_DIV, TIMING, T_AXIS,
};
use crate::pv::registry::{Publish, PvRegistry};
use crate::pv::{channel_pv, PvValue};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Refreshes horizontal parameters, channel flags and diagnostics.
pub struct PeriodicUpdater {
    session: Arc<InstrumentSession>,
    registry: Arc<dyn PvRegistry>,
    channels: u8,
}

impl PeriodicUpdater {
    pub fn new(session: Arc<InstrumentSession>, registry: Arc<dyn PvRegistry>, channels: u8) -> Self {
        Self {
            session,
            registry,
            channels,
        }
    }

    /// One maintenance pass.
    pub async fn update(&self, ctx: &mut AcquisitionContext) {
        if let Err(err) = self.refresh_parameters(ctx).await {
            error!(error = %err, "Error updating scope parameters");
            if err.is_transport() {
                self.session.clear_status().await;
            }
        }

        self.publish(LOST_TRIGS, PvValue::Int(ctx.lost_triggers), Publish::always());
        self.publish(TIMING, PvValue::FloatArray(ctx.timing.to_vec()), Publish::always());
    }

    /// Query channel enables and the horizontal scale and publish the
    /// derived PVs.
    pub async fn refresh_parameters(&self, ctx: &mut AcquisitionContext) -> AppResult<()> {
        let (enabled, time_per_div) = {
            let mut link = self.session.lock().await;
            let mut enabled = BTreeSet::new();
            for channel in 1..=self.channels {
                let trace = link.query(&format!("C{}:TRACE?", channel)).await?;
                if trace.contains("ON") {
                    enabled.insert(channel);
                }
            }
            let time_per_div = link.query_f64("TIME_DIV?").await?;
            (enabled, time_per_div)
        };

        for channel in 1..=self.channels {
            let flag = if enabled.contains(&channel) { "ON" } else { "OFF" };
            self.publish(&channel_pv(channel, ON_OFF), PvValue::from(flag), Publish::if_changed());
        }
        if enabled != ctx.enabled_channels {
            debug!(?enabled, "Enabled channels changed");
        }
        ctx.enabled_channels = enabled;
        ctx.time_per_div = time_per_div;

        let x_increment = ctx.x_increment();
        self.publish(T_AXIS, PvValue::FloatArray(ctx.time_axis()), Publish::always());
        self.publish(REC_LENGTH_R, PvValue::Float(ctx.npoints as f64), Publish::if_changed());
        self.publish(TIME_PER_DIV, PvValue::Float(time_per_div), Publish::if_changed());
        if x_increment > 0.0 {
            self.publish(SAMPLING_RATE, PvValue::Float(1.0 / x_increment), Publish::if_changed());
        }
        Ok(())
    }

    fn publish(&self, name: &str, value: PvValue, options: Publish) {
        if let Err(err) = self.registry.publish(name, value, options) {
            warn!(pv = %name, error = %err, "Publication failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Stage;
    use crate::error::FaultSignature;
    use crate::instrument::mock::{MockScope, Scripted};
    use crate::pv::definitions::declarations;
    use crate::pv::registry::LocalRegistry;
    use std::time::Duration;

    fn fixture(enabled: u8) -> (MockScope, Arc<LocalRegistry>, PeriodicUpdater) {
        let scope = MockScope::lecroy(enabled);
        let session = Arc::new(InstrumentSession::new("mock", scope.clone()));
        let (registry, _puts) =
            LocalRegistry::new("lecroy0:", declarations(4, "mock"), Duration::from_secs(3600));
        let registry = Arc::new(registry);
        let updater = PeriodicUpdater::new(session, registry.clone(), 4);
        (scope, registry, updater)
    }

    #[tokio::test]
    async fn enabled_channels_and_horizontal_pvs_are_refreshed() {
        let (_scope, registry, updater) = fixture(2);
        let mut ctx = AcquisitionContext::new();
        updater.update(&mut ctx).await;

        assert_eq!(ctx.enabled_channels.iter().copied().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(registry.current_value("c02OnOff"), Some(PvValue::from("ON")));
        assert_eq!(registry.current_value("c03OnOff"), Some(PvValue::from("OFF")));
        assert_eq!(registry.current_value(TIME_PER_DIV), Some(PvValue::Float(2e-6)));
        assert_eq!(registry.current_value(REC_LENGTH_R), Some(PvValue::Float(1000.0)));

        let rate = registry.current_value(SAMPLING_RATE).and_then(|v| v.as_f64()).unwrap();
        assert!((rate - 1000.0 / (10.0 * 2e-6)).abs() < 1.0);
        match registry.current_value(T_AXIS) {
            Some(PvValue::FloatArray(axis)) => assert_eq!(axis.len(), 1000),
            other => panic!("unexpected tAxis {:?}", other),
        }
    }

    #[tokio::test]
    async fn unchanged_parameters_are_not_republished() {
        let (_scope, registry, updater) = fixture(2);
        let mut ctx = AcquisitionContext::new();
        updater.update(&mut ctx).await;

        let mut rx = registry.subscribe();
        updater.update(&mut ctx).await;
        let names: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok()).map(|p| p.name).collect();

        assert!(!names.iter().any(|n| n.ends_with(ON_OFF)));
        assert!(!names.contains(&TIME_PER_DIV.to_string()));
        assert!(!names.contains(&REC_LENGTH_R.to_string()));
        assert!(!names.contains(&SAMPLING_RATE.to_string()));
        assert!(names.contains(&T_AXIS.to_string()));
        assert!(names.contains(&LOST_TRIGS.to_string()));
        assert!(names.contains(&TIMING.to_string()));
    }

    #[tokio::test]
    async fn counters_and_timing_are_always_republished() {
        let (scope, registry, updater) = fixture(1);
        let mut rx = registry.subscribe();
        scope.script("C1:TRACE?", [Scripted::Fault(FaultSignature::Timeout)]);

        let mut ctx = AcquisitionContext::new();
        ctx.lost_triggers = 3;
        ctx.timing.set(Stage::TriggerDetection, Duration::from_millis(1));
        updater.update(&mut ctx).await;

        // The failed refresh is swallowed; diagnostics still go out.
        assert!(scope.sent().contains(&"*CLS".to_string()));
        let names: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok()).map(|p| p.name).collect();
        assert_eq!(names, vec![LOST_TRIGS.to_string(), TIMING.to_string()]);
        assert_eq!(registry.current_value(LOST_TRIGS), Some(PvValue::Int(3)));

        updater.update(&mut ctx).await;
        let names: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok()).map(|p| p.name).collect();
        assert!(names.contains(&LOST_TRIGS.to_string()));
        assert!(names.contains(&TIMING.to_string()));
    }
}
