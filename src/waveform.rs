//! Waveform retrieval, decoding and statistics.
//!
//! A waveform transfer (`C<n>:WF? DAT1`) returns a descriptor block followed
//! by signed 16-bit samples in the byte order selected with `COMM_ORDER`.
//! The descriptor is skipped as a fixed-size block and samples are scaled
//! with the channel's current vertical scale:
//!
//! ```text
//! volts = sample * volts_per_div / SAMPLES_PER_DIVISION + offset
//! ```

use crate::context::{AcquisitionContext, Stage, Timing};
use crate::error::{AppResult, DaqError};
use crate::instrument::InstrumentSession;
use crate::pv::definitions::{ACQ_COUNT, MEAN, PEAK2PEAK, WAVEFORM};
use crate::pv::registry::{Publish, PvRegistry};
use crate::pv::{channel_pv, PvValue};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

/// Bytes of the waveform descriptor preceding the samples.
pub const DESCRIPTOR_LEN: usize = 346;

/// Raw sample counts per vertical division.
pub const SAMPLES_PER_DIVISION: f64 = 25.0;

/// Decode a raw waveform payload into volts.
pub fn decode(channel: u8, raw: &[u8], volts_per_div: f64, offset: f64) -> AppResult<Vec<f64>> {
    if raw.len() <= DESCRIPTOR_LEN {
        return Err(DaqError::Decode {
            channel,
            reason: format!(
                "payload of {} bytes has no samples after the {}-byte descriptor",
                raw.len(),
                DESCRIPTOR_LEN
            ),
        });
    }
    let body = &raw[DESCRIPTOR_LEN..];
    if body.len() % 2 != 0 {
        return Err(DaqError::Decode {
            channel,
            reason: format!("odd sample byte count {}", body.len()),
        });
    }

    let gain = volts_per_div / SAMPLES_PER_DIVISION;
    Ok(body
        .chunks_exact(2)
        .map(|pair| f64::from(i16::from_be_bytes([pair[0], pair[1]])) * gain + offset)
        .collect())
}

/// Summary statistics of a decoded waveform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaveformStats {
    pub peak_to_peak: f64,
    pub mean: f64,
}

impl WaveformStats {
    /// Statistics of `samples`; zero for an empty sequence.
    pub fn of(samples: &[f64]) -> Self {
        if samples.is_empty() {
            return Self {
                peak_to_peak: 0.0,
                mean: 0.0,
            };
        }
        let (min, max) = samples
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        Self {
            peak_to_peak: max - min,
            mean: samples.iter().sum::<f64>() / samples.len() as f64,
        }
    }
}

/// Result of one acquisition cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcquisitionReport {
    /// Channels whose waveform and statistics were published.
    pub published: Vec<u8>,
    /// A transport fault ended the cycle early.
    pub aborted: bool,
}

/// Retrieves, decodes and publishes the waveforms of enabled channels.
pub struct WaveformAcquisitor {
    session: Arc<InstrumentSession>,
    registry: Arc<dyn PvRegistry>,
}

impl WaveformAcquisitor {
    pub fn new(session: Arc<InstrumentSession>, registry: Arc<dyn PvRegistry>) -> Self {
        Self { session, registry }
    }

    /// Acquire every enabled channel after a positive trigger decision.
    ///
    /// All publications carry the trigger decision time. A decode or
    /// coercion fault skips the channel; a transport fault ends the cycle,
    /// counts a lost trigger and clears the instrument status.
    pub async fn acquire(&self, ctx: &mut AcquisitionContext) -> AcquisitionReport {
        let trig_time = *ctx.trig_time.get_or_insert_with(Utc::now);
        let channels: Vec<u8> = ctx.enabled_channels.iter().copied().collect();
        debug!(?channels, acquisition = ctx.acq_count, "Acquiring waveforms");

        if let Err(err) = self.registry.publish(
            ACQ_COUNT,
            PvValue::Int(ctx.acq_count),
            Publish::always().at(trig_time),
        ) {
            warn!(error = %err, "Failed to publish acquisition count");
        }

        ctx.timing.reset_acquisition();
        let started = Instant::now();
        let mut report = AcquisitionReport::default();

        for channel in channels {
            match self.acquire_channel(channel, trig_time, &mut ctx.timing).await {
                Ok(npoints) => {
                    ctx.npoints = npoints;
                    report.published.push(channel);
                }
                Err(err) if err.is_transport() => {
                    error!(channel, error = %err, "Transport fault while acquiring waveform");
                    ctx.lost_triggers += 1;
                    report.aborted = true;
                    self.session.clear_status().await;
                    break;
                }
                Err(err) => {
                    warn!(channel, error = %err, "Skipping channel for this cycle");
                }
            }
        }

        ctx.timing.set(Stage::AcquireWaveforms, started.elapsed());
        debug!(timing = ?ctx.timing, "Acquisition finished");
        report
    }

    async fn acquire_channel(
        &self,
        channel: u8,
        trig_time: DateTime<Utc>,
        timing: &mut Timing,
    ) -> AppResult<usize> {
        let (raw, volts_per_div, offset) = {
            let mut link = self.session.lock().await;

            let started = Instant::now();
            link.write(&format!("C{}:WF? DAT1", channel)).await?;
            let raw = link.read_raw().await?;
            timing.add(Stage::QueryWaveform, started.elapsed());

            let started = Instant::now();
            let volts_per_div = link.query_f64(&format!("C{}:VOLT_DIV?", channel)).await?;
            let offset = link.query_f64(&format!("C{}:OFFSET?", channel)).await?;
            timing.add(Stage::Preamble, started.elapsed());
            (raw, volts_per_div, offset)
        };

        let volts = decode(channel, &raw, volts_per_div, offset)?;
        let stats = WaveformStats::of(&volts);
        let npoints = volts.len();

        let started = Instant::now();
        let at = Publish::always().at(trig_time);
        self.registry
            .publish(&channel_pv(channel, WAVEFORM), PvValue::FloatArray(volts), at)?;
        self.registry
            .publish(&channel_pv(channel, PEAK2PEAK), PvValue::Float(stats.peak_to_peak), at)?;
        self.registry
            .publish(&channel_pv(channel, MEAN), PvValue::Float(stats.mean), at)?;
        timing.add(Stage::PublishWaveform, started.elapsed());

        debug!(channel, npoints, p2p = stats.peak_to_peak, mean = stats.mean, "Waveform published");
        Ok(npoints)
    }
}
