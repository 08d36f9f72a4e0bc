//! # LeCroy DAQ Library
//!
//! Process-variable device server for LeCroy/Teledyne oscilloscopes. The
//! scope's settings and waveforms are exposed as named, typed process
//! variables (PVs) that are polled and published on a control-loop cadence.
//!
//! ## Crate Structure
//!
//! - **`command`**: Typed command templates and the PV → command map.
//! - **`config`**: `ServerConfig`, loaded with Figment from defaults, TOML
//!   and `LECROY_DAQ_*` environment variables.
//! - **`context`**: Mutable acquisition state owned by the control loop.
//! - **`error`**: `DaqError` and the transport fault classification.
//! - **`instrument`**: The SCPI transport trait, the lock-guarded session,
//!   a TCP transport and a simulated scope.
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`periodic`**: Maintenance pass (channel enables, horizontal scale,
//!   diagnostics).
//! - **`pv`**: PV values, the declaration table and the registry boundary.
//! - **`server`**: `DeviceServer` and its control loop.
//! - **`setters`**: Handlers for client writes.
//! - **`sync`**: Settings synchronization.
//! - **`trigger`**: Trigger monitor and fault escalation.
//! - **`waveform`**: Waveform decoding, statistics and publication.

pub mod command;
pub mod config;
pub mod context;
pub mod error;
pub mod instrument;
pub mod logging;
pub mod periodic;
pub mod pv;
pub mod server;
pub mod setters;
pub mod sync;
pub mod trigger;
pub mod waveform;
