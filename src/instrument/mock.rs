//! Simulated LeCroy oscilloscope.
//!
//! `MockScope` answers queries from a reply table, follows `<command> <value>`
//! writes so settings read back what was written, and serves per-channel
//! waveform payloads after a `C<n>:WF?` request. Tests can queue scripted
//! replies or faults for a query and inspect every command that was sent.
//!
//! Clones share state, so a test keeps one handle while the session owns
//! another.

use super::ScpiTransport;
use crate::error::{FaultSignature, TransportError};
use crate::waveform::DESCRIPTOR_LEN;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// One scripted answer to a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scripted {
    /// Reply text.
    Reply(String),
    /// Transport fault of the given kind.
    Fault(FaultSignature),
}

impl From<&str> for Scripted {
    fn from(reply: &str) -> Self {
        Scripted::Reply(reply.to_string())
    }
}

#[derive(Default)]
struct MockState {
    replies: HashMap<String, String>,
    scripts: HashMap<String, VecDeque<Scripted>>,
    waveforms: HashMap<u8, Bytes>,
    pending_raw: Option<Bytes>,
    raw_faults: VecDeque<FaultSignature>,
    sent: Vec<String>,
    timeout: Duration,
}

/// Scriptable simulated oscilloscope.
#[derive(Clone, Default)]
pub struct MockScope {
    state: Arc<Mutex<MockState>>,
}

impl MockScope {
    /// Empty scope: every query times out until a reply is configured.
    pub fn new() -> Self {
        let scope = Self::default();
        scope.state.lock().timeout = Duration::from_millis(5000);
        scope
    }

    /// A LeCroy in AUTO mode with the first `enabled` channels on (at least
    /// four channels answer), each carrying a sine waveform of 1000 samples.
    pub fn lecroy(enabled: u8) -> Self {
        let scope = Self::new();
        scope.set_reply("*IDN?", "LECROY,WAVERUNNER9254M,LCRY0001N00000,9.2.0");
        scope.set_reply("TRIG_MODE?", "AUTO");
        scope.set_reply("TIME_DIV?", "2.00E-06");
        scope.set_reply("TRIG_DELAY?", "0.00E+00");
        scope.set_reply("TRIG_SELECT?", "C1");
        scope.set_reply("*ESR?", "0");
        scope.set_reply("*OPC?", "1");
        scope.set_reply("*STB?", "0");
        for channel in 1..=enabled.max(4) {
            let on = if channel <= enabled { "ON" } else { "OFF" };
            scope.set_reply(&format!("C{}:TRACE?", channel), on);
            scope.set_reply(&format!("C{}:COUPLING?", channel), "D1M");
            scope.set_reply(&format!("C{}:VOLT_DIV?", channel), "1.00E-01");
            scope.set_reply(&format!("C{}:OFFSET?", channel), "0.00E+00");
            scope.set_reply(&format!("C{}:IMPEDANCE?", channel), "1M");
            let samples: Vec<i16> = (0..1000)
                .map(|i| {
                    let phase = i as f64 / 1000.0 * std::f64::consts::TAU;
                    (phase.sin() * 100.0 * channel as f64) as i16
                })
                .collect();
            scope.set_waveform(channel, lecroy_payload(&samples));
        }
        scope
    }

    /// Standing reply to a query.
    pub fn set_reply(&self, query: &str, reply: &str) {
        self.state.lock().replies.insert(query.to_string(), reply.to_string());
    }

    /// Queue scripted answers for a query; consumed before the standing reply.
    pub fn script<I, S>(&self, query: &str, answers: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<Scripted>,
    {
        self.state
            .lock()
            .scripts
            .entry(query.to_string())
            .or_default()
            .extend(answers.into_iter().map(Into::into));
    }

    /// Payload served after `C<channel>:WF?`.
    pub fn set_waveform(&self, channel: u8, payload: impl Into<Bytes>) {
        self.state.lock().waveforms.insert(channel, payload.into());
    }

    /// Make the next raw read fail.
    pub fn fail_next_raw_read(&self, signature: FaultSignature) {
        self.state.lock().raw_faults.push_back(signature);
    }

    /// Every command sent so far, queries included.
    pub fn sent(&self) -> Vec<String> {
        self.state.lock().sent.clone()
    }

    /// Forget the command log.
    pub fn clear_sent(&self) {
        self.state.lock().sent.clear();
    }

    fn fault(signature: FaultSignature, command: &str, timeout: Duration) -> TransportError {
        let command = command.to_string();
        match signature {
            FaultSignature::Timeout => TransportError::Timeout { command, timeout },
            FaultSignature::Io => TransportError::Io {
                command,
                source: std::io::Error::from(std::io::ErrorKind::ConnectionReset),
            },
            FaultSignature::Closed => TransportError::Closed { command },
            FaultSignature::Protocol => TransportError::Protocol {
                command,
                reason: "scripted".into(),
            },
        }
    }
}

#[async_trait]
impl ScpiTransport for MockScope {
    async fn write(&mut self, command: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.sent.push(command.to_string());

        if let Some(request) = command.strip_suffix(" DAT1") {
            if let Some(channel) = request
                .strip_prefix('C')
                .and_then(|rest| rest.strip_suffix(":WF?"))
                .and_then(|digits| digits.parse::<u8>().ok())
            {
                state.pending_raw = state.waveforms.get(&channel).cloned();
                return Ok(());
            }
        }

        // Settings writes read back through the matching query.
        if let Some((header, value)) = command.split_once(' ') {
            let query = format!("{}?", header);
            if state.replies.contains_key(&query) {
                state.replies.insert(query, value.trim().to_string());
            }
        }
        Ok(())
    }

    async fn query(&mut self, command: &str) -> Result<String, TransportError> {
        let mut state = self.state.lock();
        state.sent.push(command.to_string());
        let timeout = state.timeout;

        let scripted = state.scripts.get_mut(command).and_then(VecDeque::pop_front);
        match scripted {
            Some(Scripted::Reply(reply)) => Ok(reply),
            Some(Scripted::Fault(signature)) => Err(Self::fault(signature, command, timeout)),
            None => state
                .replies
                .get(command)
                .cloned()
                .ok_or_else(|| Self::fault(FaultSignature::Timeout, command, timeout)),
        }
    }

    async fn read_raw(&mut self) -> Result<Bytes, TransportError> {
        let mut state = self.state.lock();
        let timeout = state.timeout;
        if let Some(signature) = state.raw_faults.pop_front() {
            state.pending_raw = None;
            return Err(Self::fault(signature, "read_raw", timeout));
        }
        state
            .pending_raw
            .take()
            .ok_or_else(|| Self::fault(FaultSignature::Timeout, "read_raw", timeout))
    }

    async fn clear(&mut self) -> Result<(), TransportError> {
        self.state.lock().pending_raw = None;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.state.lock().timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.state.lock().timeout = timeout;
    }
}

/// Build a waveform payload the way the scope sends it: a descriptor block
/// followed by big-endian 16-bit samples.
pub fn lecroy_payload(samples: &[i16]) -> Vec<u8> {
    let mut payload = vec![0u8; DESCRIPTOR_LEN];
    payload[..8].copy_from_slice(b"WAVEDESC");
    for sample in samples {
        payload.extend_from_slice(&sample.to_be_bytes());
    }
    payload
}
