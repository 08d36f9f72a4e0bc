//! Acquisition context.
//!
//! All mutable per-run state of the control loop lives here: enabled
//! channels, the last trigger decision, counters, consecutive-fault tallies
//! and the timing diagnostics. The control loop owns the context and lends
//! it to one component at a time.

use crate::error::FaultSignature;
use crate::pv::definitions::NDIVSX;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

/// Record length assumed until the first waveform is decoded.
pub const DEFAULT_NPOINTS: usize = 1000;

/// Stages reported in the timing diagnostics, in publication order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    TriggerDetection,
    AcquireWaveforms,
    Preamble,
    QueryWaveform,
    PublishWaveform,
}

impl Stage {
    /// All stages in publication order.
    pub const ALL: [Stage; 5] = [
        Stage::TriggerDetection,
        Stage::AcquireWaveforms,
        Stage::Preamble,
        Stage::QueryWaveform,
        Stage::PublishWaveform,
    ];

    /// Diagnostic name of the stage.
    pub fn name(&self) -> &'static str {
        match self {
            Stage::TriggerDetection => "trigger_detection",
            Stage::AcquireWaveforms => "acquire_wf",
            Stage::Preamble => "preamble",
            Stage::QueryWaveform => "query_wf",
            Stage::PublishWaveform => "publish_wf",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Elapsed seconds per stage for the most recent cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Timing {
    elapsed: [f64; Stage::ALL.len()],
}

impl Timing {
    /// Overwrite a stage.
    pub fn set(&mut self, stage: Stage, elapsed: Duration) {
        self.elapsed[stage.index()] = elapsed.as_secs_f64();
    }

    /// Accumulate into a stage (per-channel stages within one acquisition).
    pub fn add(&mut self, stage: Stage, elapsed: Duration) {
        self.elapsed[stage.index()] += elapsed.as_secs_f64();
    }

    /// Reset the per-acquisition stages before a new acquisition.
    pub fn reset_acquisition(&mut self) {
        for stage in [
            Stage::AcquireWaveforms,
            Stage::Preamble,
            Stage::QueryWaveform,
            Stage::PublishWaveform,
        ] {
            self.elapsed[stage.index()] = 0.0;
        }
    }

    /// Seconds recorded for a stage.
    pub fn get(&self, stage: Stage) -> f64 {
        self.elapsed[stage.index()]
    }

    /// Ordered sequence for publication, rounded to microseconds.
    pub fn to_vec(&self) -> Vec<f64> {
        self.elapsed
            .iter()
            .map(|s| (s * 1e6).round() / 1e6)
            .collect()
    }
}

/// Mutable state of the control loop.
#[derive(Debug, Clone)]
pub struct AcquisitionContext {
    /// Channels reported ON by the last periodic update.
    pub enabled_channels: BTreeSet<u8>,
    /// Time of the last positive trigger decision.
    pub trig_time: Option<DateTime<Utc>>,
    /// Positive trigger decisions so far.
    pub acq_count: i64,
    /// Ready decisions whose acquisition was aborted by a transport fault.
    pub lost_triggers: i64,
    /// Samples per waveform.
    pub npoints: usize,
    /// Horizontal scale in seconds per division.
    pub time_per_div: f64,
    /// Timing diagnostics.
    pub timing: Timing,
    fault_counts: HashMap<FaultSignature, u32>,
}

impl Default for AcquisitionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl AcquisitionContext {
    pub fn new() -> Self {
        Self {
            enabled_channels: BTreeSet::new(),
            trig_time: None,
            acq_count: 0,
            lost_triggers: 0,
            npoints: DEFAULT_NPOINTS,
            time_per_div: 0.0,
            timing: Timing::default(),
            fault_counts: HashMap::new(),
        }
    }

    /// Count one more consecutive fault of `signature`; returns the new count.
    pub fn record_fault(&mut self, signature: FaultSignature) -> u32 {
        let count = self.fault_counts.entry(signature).or_insert(0);
        *count += 1;
        *count
    }

    /// Consecutive faults of `signature` so far.
    pub fn fault_count(&self, signature: FaultSignature) -> u32 {
        self.fault_counts.get(&signature).copied().unwrap_or(0)
    }

    /// Zero every fault counter.
    pub fn reset_faults(&mut self) {
        self.fault_counts.values_mut().for_each(|count| *count = 0);
    }

    /// Whether every fault counter is zero.
    pub fn faults_clear(&self) -> bool {
        self.fault_counts.values().all(|&count| count == 0)
    }

    /// Seconds between samples; zero while the horizontal scale is unknown.
    pub fn x_increment(&self) -> f64 {
        if self.npoints == 0 {
            return 0.0;
        }
        f64::from(NDIVSX) * self.time_per_div / self.npoints as f64
    }

    /// Sample times relative to the first sample.
    pub fn time_axis(&self) -> Vec<f64> {
        let dx = self.x_increment();
        (0..self.npoints).map(|i| i as f64 * dx).collect()
    }
}
