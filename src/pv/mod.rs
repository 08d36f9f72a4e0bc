//! Process variables.
//!
//! A process variable (PV) is a named, typed value published by the device
//! server. This module defines the value model ([`PvValue`], [`PvKind`]) and
//! the immutable declaration record ([`PvDecl`]) that is the single source for
//! both the command map and the registry schema.
//!
//! - [`definitions`]: the declaration table of the oscilloscope server.
//! - [`registry`]: the registry boundary and an in-memory implementation.

pub mod definitions;
pub mod registry;

use crate::command::CommandTemplate;
use crate::error::{AppResult, DaqError};
use std::fmt;

/// A PV value.
///
/// The variant is fixed by the declaration; coercion of instrument text into
/// a value always goes through [`PvValue::coerce_like`], which keeps the
/// variant of the value it is coerced against.
#[derive(Debug, Clone, PartialEq)]
pub enum PvValue {
    /// Floating-point scalar.
    Float(f64),
    /// Integer scalar (counters).
    Int(i64),
    /// Floating-point array (waveforms, axes, diagnostics).
    FloatArray(Vec<f64>),
    /// Free text.
    Text(String),
}

impl PvValue {
    /// Numeric view of a scalar value.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PvValue::Float(v) => Some(*v),
            PvValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Integer view of an integer value.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PvValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Text view of a text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            PvValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Convert instrument reply text into a value of the same variant as `self`.
    ///
    /// Numeric replies may carry a trailing unit token (`"2.00E-06 S"`); only
    /// the first whitespace-separated token is parsed.
    pub fn coerce_like(&self, pv: &str, text: &str) -> AppResult<PvValue> {
        let trimmed = text.trim();
        let coercion = |reason: String| DaqError::Coercion {
            pv: pv.to_string(),
            text: trimmed.to_string(),
            reason,
        };
        let token = trimmed.split_whitespace().next().unwrap_or("");
        match self {
            PvValue::Float(_) => token
                .parse::<f64>()
                .map(PvValue::Float)
                .map_err(|e| coercion(e.to_string())),
            PvValue::Int(_) => token
                .parse::<i64>()
                .map(PvValue::Int)
                .map_err(|e| coercion(e.to_string())),
            PvValue::Text(_) => Ok(PvValue::Text(trimmed.to_string())),
            PvValue::FloatArray(_) => Err(coercion("array PVs are not read from settings".into())),
        }
    }
}

impl fmt::Display for PvValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PvValue::Float(v) => write!(f, "{}", v),
            PvValue::Int(v) => write!(f, "{}", v),
            PvValue::Text(s) => write!(f, "{}", s),
            PvValue::FloatArray(values) => write!(f, "[{} values]", values.len()),
        }
    }
}

impl From<f64> for PvValue {
    fn from(v: f64) -> Self {
        PvValue::Float(v)
    }
}

impl From<i64> for PvValue {
    fn from(v: i64) -> Self {
        PvValue::Int(v)
    }
}

impl From<Vec<f64>> for PvValue {
    fn from(v: Vec<f64>) -> Self {
        PvValue::FloatArray(v)
    }
}

impl From<&str> for PvValue {
    fn from(v: &str) -> Self {
        PvValue::Text(v.to_string())
    }
}

impl From<String> for PvValue {
    fn from(v: String) -> Self {
        PvValue::Text(v)
    }
}

/// Value kind of a declaration.
#[derive(Debug, Clone, PartialEq)]
pub enum PvKind {
    /// Numeric scalar (float or integer, see the initial value).
    Scalar,
    /// Numeric array.
    Array,
    /// Free text.
    Text,
    /// Enumerated choice; values are compared and published as text.
    Discrete {
        /// Legal values.
        choices: Vec<String>,
    },
}

impl PvKind {
    /// Build a discrete kind from string literals.
    pub fn discrete(choices: &[&str]) -> Self {
        PvKind::Discrete {
            choices: choices.iter().map(|c| c.to_string()).collect(),
        }
    }

    /// Whether values of this kind compare as text.
    pub fn is_discrete(&self) -> bool {
        matches!(self, PvKind::Discrete { .. })
    }
}

/// Low/high soft-alarm thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlarmLimits {
    pub low: f64,
    pub high: f64,
}

/// How a client write to a PV is applied to the instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetterKind {
    /// `<command> <value>` using the PV's command template.
    Scpi,
    /// `VBS <path> = "<value>"` derived from a `!VBS? return=<path>` template.
    Vbs,
    /// Store or recall the panel setup.
    Setup,
    /// Force a trigger.
    Trigger,
    /// Record length via `MEMORY_SIZE`.
    RecordLength,
    /// Arbitrary command, reply published to `instrCmdR`.
    InstrumentCommand,
    /// Server state request.
    ServerState,
    /// Control-loop cadence.
    CycleSleep,
}

/// Immutable PV declaration.
#[derive(Debug, Clone)]
pub struct PvDecl {
    /// Unique PV name (without the device prefix).
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Value kind.
    pub kind: PvKind,
    /// Initial value; also fixes the numeric representation of scalars.
    pub initial: PvValue,
    /// Whether clients may write the PV.
    pub writable: bool,
    /// Engineering units.
    pub units: Option<String>,
    /// Soft-alarm thresholds.
    pub alarm: Option<AlarmLimits>,
    /// Instrument command template.
    pub command: Option<CommandTemplate>,
    /// Write handler.
    pub setter: Option<SetterKind>,
}

impl PvDecl {
    /// Start a declaration with a numeric scalar initial value.
    pub fn scalar(name: impl Into<String>, description: impl Into<String>, initial: impl Into<PvValue>) -> Self {
        Self::new(name, description, PvKind::Scalar, initial.into())
    }

    /// Start a declaration of a numeric array.
    pub fn array(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(name, description, PvKind::Array, PvValue::FloatArray(vec![0.0]))
    }

    /// Start a declaration of a free-text PV.
    pub fn text(name: impl Into<String>, description: impl Into<String>, initial: &str) -> Self {
        Self::new(name, description, PvKind::Text, PvValue::from(initial))
    }

    /// Start a declaration of a discrete PV; the first choice is the initial value.
    pub fn discrete(name: impl Into<String>, description: impl Into<String>, choices: &[&str]) -> Self {
        let initial = PvValue::from(choices.first().copied().unwrap_or(""));
        Self::new(name, description, PvKind::discrete(choices), initial)
    }

    fn new(name: impl Into<String>, description: impl Into<String>, kind: PvKind, initial: PvValue) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            kind,
            initial,
            writable: false,
            units: None,
            alarm: None,
            command: None,
            setter: None,
        }
    }

    /// Mark the PV as client-writable.
    pub fn writable(mut self) -> Self {
        self.writable = true;
        self
    }

    /// Attach engineering units.
    pub fn units(mut self, units: &str) -> Self {
        self.units = Some(units.to_string());
        self
    }

    /// Attach soft-alarm thresholds.
    pub fn alarm(mut self, low: f64, high: f64) -> Self {
        self.alarm = Some(AlarmLimits { low, high });
        self
    }

    /// Attach an instrument command template.
    pub fn command(mut self, template: CommandTemplate) -> Self {
        self.command = Some(template);
        self
    }

    /// Attach a write handler.
    pub fn setter(mut self, setter: SetterKind) -> Self {
        self.setter = Some(setter);
        self
    }

    /// Channel index encoded in the name, if any.
    pub fn channel(&self) -> Option<u8> {
        channel_of(&self.name)
    }

    /// Validate a value and convert a numeric scalar to the variant of the
    /// initial value, so the stored variant never changes.
    pub fn normalize(&self, value: PvValue) -> AppResult<PvValue> {
        self.validate(&value)?;
        match (&self.initial, value) {
            (PvValue::Float(_), PvValue::Int(v)) => Ok(PvValue::Float(v as f64)),
            (PvValue::Int(_), PvValue::Float(v)) => {
                if v.is_finite() && v.fract() == 0.0 && v.abs() <= i64::MAX as f64 {
                    Ok(PvValue::Int(v as i64))
                } else {
                    Err(DaqError::InvalidValue {
                        pv: self.name.clone(),
                        reason: format!("{} is not an integer", v),
                    })
                }
            }
            (_, value) => Ok(value),
        }
    }

    /// Check a client-supplied value against the declaration.
    pub fn validate(&self, value: &PvValue) -> AppResult<()> {
        let invalid = |reason: String| DaqError::InvalidValue {
            pv: self.name.clone(),
            reason,
        };
        match (&self.kind, value) {
            (PvKind::Discrete { choices }, PvValue::Text(text)) => {
                if choices.iter().any(|c| c == text) {
                    Ok(())
                } else {
                    Err(invalid(format!("'{}' is not one of {:?}", text, choices)))
                }
            }
            (PvKind::Discrete { .. }, other) => Err(invalid(format!("expected a choice, got {}", other))),
            (PvKind::Scalar, PvValue::Float(_) | PvValue::Int(_)) => Ok(()),
            (PvKind::Array, PvValue::FloatArray(_)) => Ok(()),
            (PvKind::Text, PvValue::Text(_)) => Ok(()),
            (kind, other) => Err(invalid(format!("{} does not fit {:?}", other, kind))),
        }
    }
}

/// Name of the PV for channel `channel` built from a `c<n>...` template name.
pub fn channel_pv(channel: u8, suffix: &str) -> String {
    format!("c{:02}{}", channel, suffix)
}

/// Channel index encoded at characters 1..3 of a channel PV name (`c01OnOff` → 1).
pub fn channel_of(name: &str) -> Option<u8> {
    let bytes = name.as_bytes();
    if bytes.len() > 3 && bytes[0] == b'c' && bytes[1].is_ascii_digit() && bytes[2].is_ascii_digit() {
        name[1..3].parse().ok()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_index_is_read_from_fixed_position() {
        assert_eq!(channel_of("c01OnOff"), Some(1));
        assert_eq!(channel_of("c12VoltsPerDiv"), Some(12));
        assert_eq!(channel_of("timePerDiv"), None);
        assert_eq!(channel_of("c1"), None);
        assert_eq!(channel_pv(3, "Mean"), "c03Mean");
    }

    #[test]
    fn coercion_keeps_the_numeric_representation() {
        let float = PvValue::Float(0.0);
        assert_eq!(float.coerce_like("timePerDiv", "2.00E-06").unwrap(), PvValue::Float(2e-6));
        assert_eq!(float.coerce_like("timePerDiv", " 5E-3 S\n").unwrap(), PvValue::Float(5e-3));

        let int = PvValue::Int(0);
        assert_eq!(int.coerce_like("acqCount", "42").unwrap(), PvValue::Int(42));
        assert!(matches!(
            int.coerce_like("acqCount", "4.5"),
            Err(DaqError::Coercion { .. })
        ));

        assert!(float.coerce_like("trigDelay", "OFF").is_err());
        assert!(PvValue::FloatArray(vec![]).coerce_like("tAxis", "1").is_err());
        assert_eq!(
            PvValue::from("?").coerce_like("trigState", " Ready \n").unwrap(),
            PvValue::from("Ready")
        );
    }

    #[test]
    fn discrete_values_are_checked_against_choices() {
        let decl = PvDecl::discrete("trigMode", "Trigger mode", &["AUTO", "NORM", "SINGLE", "STOP"]).writable();
        assert_eq!(decl.initial, PvValue::from("AUTO"));
        assert!(decl.validate(&PvValue::from("NORM")).is_ok());
        assert!(decl.validate(&PvValue::from("FREE")).is_err());
        assert!(decl.validate(&PvValue::Float(1.0)).is_err());

        let scalar = PvDecl::scalar("trigLevel", "Trigger level", 0.0).units("V");
        assert!(scalar.validate(&PvValue::Int(1)).is_ok());
        assert!(scalar.validate(&PvValue::from("x")).is_err());
    }
}
