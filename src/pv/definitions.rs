//! PV declaration table of the oscilloscope server.
//!
//! Channel PVs are declared once as templates (`c<n>...`) and expanded for
//! every channel with a two-digit index (`c01OnOff`, `c02OnOff`, ...).

use super::{channel_pv, PvDecl, SetterKind};
use crate::command::CommandTemplate;

/// Number of horizontal divisions of the scope display.
pub const NDIVSX: u32 = 10;
/// Number of vertical divisions of the scope display.
pub const NDIVSY: u32 = 10;

/// Server state PV.
pub const SERVER: &str = "server";
/// Status message PV.
pub const STATUS: &str = "status";
/// Cycle sleep PV.
pub const SLEEP: &str = "sleep";
/// Server version PV.
pub const VERSION: &str = "version";

/// Panel setup action PV.
pub const SETUP: &str = "setup";
/// Transport resource PV.
pub const VISA_RESOURCE: &str = "visaResource";
/// Acquisition counter PV.
pub const ACQ_COUNT: &str = "acqCount";
/// Lost-trigger counter PV.
pub const LOST_TRIGS: &str = "lostTrigs";
/// Free-form command PV.
pub const INSTR_CMD_S: &str = "instrCmdS";
/// Reply of the free-form command.
pub const INSTR_CMD_R: &str = "instrCmdR";
/// Requested record length PV.
pub const REC_LENGTH_S: &str = "recLengthS";
/// Effective record length PV.
pub const REC_LENGTH_R: &str = "recLengthR";
/// Sampling rate PV.
pub const SAMPLING_RATE: &str = "samplingRate";
/// Horizontal scale PV.
pub const TIME_PER_DIV: &str = "timePerDiv";
/// Horizontal axis PV.
pub const T_AXIS: &str = "tAxis";
/// Force-trigger PV.
pub const TRIGGER: &str = "trigger";
/// Trigger/run state PV.
pub const TRIG_STATE: &str = "trigState";
/// Timing diagnostics PV.
pub const TIMING: &str = "timing";

/// Channel enable suffix.
pub const ON_OFF: &str = "OnOff";
/// Channel waveform suffix.
pub const WAVEFORM: &str = "Waveform";
/// Channel mean suffix.
pub const MEAN: &str = "Mean";
/// Channel peak-to-peak suffix.
pub const PEAK2PEAK: &str = "Peak2Peak";

/// Server state choices, in the order the registry lists them.
pub const SERVER_STATES: &[&str] = &["Start", "Stop", "Clear", "Exit"];

/// Record-length choices of `recLengthS`.
pub const RECORD_LENGTHS: &[&str] = &[
    "AUTO", "500", "1k", "2.5k", "5k", "10k", "25k", "50k", "100k", "250k", "500k", "1M", "2.5M",
    "5M", "10M",
];

/// Build the full declaration set for `channels` channels.
pub fn declarations(channels: u8, resource: &str) -> Vec<PvDecl> {
    let mut decls = server_pvs();
    decls.extend(instrument_pvs(resource));
    decls.extend(horizontal_pvs());
    decls.extend(trigger_pvs());
    decls.push(PvDecl::array(TIMING, "Performance timing").units("S"));
    for channel in 1..=channels {
        decls.extend(channel_pvs(channel));
    }
    decls
}

fn server_pvs() -> Vec<PvDecl> {
    vec![
        PvDecl::discrete(SERVER, "Server control", SERVER_STATES)
            .writable()
            .setter(SetterKind::ServerState),
        PvDecl::text(STATUS, "Server status", ""),
        PvDecl::scalar(SLEEP, "Sleep time per cycle", 0.1)
            .writable()
            .units("S")
            .setter(SetterKind::CycleSleep),
        PvDecl::text(VERSION, "Server version", env!("CARGO_PKG_VERSION")),
    ]
}

fn instrument_pvs(resource: &str) -> Vec<PvDecl> {
    vec![
        PvDecl::discrete(
            SETUP,
            "Save/recall instrument state to/from latest or operational setup",
            &["Setup", "Store Panel", "Recall Panel"],
        )
        .writable()
        .setter(SetterKind::Setup),
        PvDecl::text(VISA_RESOURCE, "VISA resource to access the device", resource),
        PvDecl::text("dateTime", "Scope`s date & time", "N/A"),
        PvDecl::scalar(ACQ_COUNT, "Number of acquisition recorded", 0i64),
        PvDecl::scalar("scopeAcqCount", "Acquisition count of the scope", 0i64),
        PvDecl::scalar(LOST_TRIGS, "Number of triggers lost", 0i64),
        PvDecl::discrete(
            "instrCtrl",
            "Scope control commands",
            &["*IDN?", "*RST", "*CLS", "*ESR?", "*OPC?", "*STB?"],
        )
        .writable()
        .setter(SetterKind::InstrumentCommand),
        PvDecl::text(INSTR_CMD_S, "Execute a scope command. Features: RWE", "*IDN?")
            .writable()
            .setter(SetterKind::InstrumentCommand),
        PvDecl::text(INSTR_CMD_R, "Response of the instrCmdS", ""),
    ]
}

fn horizontal_pvs() -> Vec<PvDecl> {
    vec![
        PvDecl::discrete(REC_LENGTH_S, "Number of points per waveform", RECORD_LENGTHS)
            .writable()
            .setter(SetterKind::RecordLength),
        PvDecl::scalar(REC_LENGTH_R, "Number of points per waveform read", 0.0),
        PvDecl::scalar(SAMPLING_RATE, "Sampling Rate", 0.0)
            .units("Hz")
            .command(CommandTemplate::lit(
                "!VBS? return=app.Acquisition.Horizontal.SampleRate",
            )),
        PvDecl::scalar(
            TIME_PER_DIV,
            format!("Horizontal scale (1/{} of full scale)", NDIVSX),
            2e-6,
        )
        .writable()
        .units("S/du")
        .command(CommandTemplate::lit("TIME_DIV"))
        .setter(SetterKind::Scpi),
        PvDecl::array(T_AXIS, "Horizontal axis array").units("S"),
    ]
}

fn trigger_pvs() -> Vec<PvDecl> {
    vec![
        PvDecl::discrete(TRIGGER, "Click to force trigger event to occur", &["Trigger", "Force!"])
            .writable()
            .setter(SetterKind::Trigger),
        PvDecl::discrete(
            "trigType",
            "Trigger type",
            &["EDGE", "DROP", "GLIT", "INTV", "QUAL", "RUNT", "SLEW", "TV"],
        )
        .writable()
        .command(CommandTemplate::lit("!VBS? return=app.Acquisition.Trigger.Type"))
        .setter(SetterKind::Vbs),
        PvDecl::discrete("trigCoupling", "Trigger coupling", &["DC", "AC", "HFREJ", "LFREJ"])
            .writable()
            .command(CommandTemplate::lit(
                "!VBS? return=app.Acquisition.Trigger.Edge.Coupling",
            ))
            .setter(SetterKind::Vbs),
        PvDecl::text(TRIG_STATE, "Current trigger status: Ready, Armed, Triggered, Auto", "?")
            .command(CommandTemplate::lit("!TRIG_SELECT")),
        PvDecl::discrete("trigMode", "Trigger mode", &["AUTO", "NORM", "SINGLE", "STOP"])
            .writable()
            .command(CommandTemplate::lit("TRIG_MODE"))
            .setter(SetterKind::Scpi),
        PvDecl::scalar("trigDelay", "Trigger delay/position", 0.0)
            .writable()
            .units("S")
            .command(CommandTemplate::lit("TRIG_DELAY"))
            .setter(SetterKind::Scpi),
        PvDecl::discrete(
            "trigSource",
            "Trigger source",
            &["C1", "C2", "C3", "C4", "LINE", "EXT"],
        )
        .writable()
        .command(CommandTemplate::lit("TRIG_SELECT"))
        .setter(SetterKind::Scpi),
        PvDecl::discrete("trigSlope", "Trigger slope", &["POS", "NEG"])
            .writable()
            .command(CommandTemplate::lit(
                "!VBS? return=app.Acquisition.Trigger.Edge.Slope",
            ))
            .setter(SetterKind::Vbs),
        PvDecl::scalar("trigLevel", "Trigger level", 0.0)
            .writable()
            .units("V")
            .command(CommandTemplate::lit("!TRIG_LEVEL"))
            .setter(SetterKind::Scpi),
    ]
}

fn channel_pvs(channel: u8) -> Vec<PvDecl> {
    vec![
        PvDecl::discrete(channel_pv(channel, ON_OFF), "Enable/disable channel", &["ON", "OFF"])
            .writable()
            .command(CommandTemplate::lit("C<n>:TRACE"))
            .setter(SetterKind::Scpi),
        PvDecl::discrete(
            channel_pv(channel, "Coupling"),
            "Channel coupling",
            &["D1M", "D50", "GND", "A1M"],
        )
        .writable()
        .command(CommandTemplate::lit("C<n>:COUPLING"))
        .setter(SetterKind::Scpi),
        PvDecl::scalar(channel_pv(channel, "VoltsPerDiv"), "Vertical scale", 1e-3)
            .writable()
            .units("V/du")
            .alarm(500e-6, 10.0)
            .command(CommandTemplate::lit("C<n>:VOLT_DIV"))
            .setter(SetterKind::Scpi),
        PvDecl::scalar(channel_pv(channel, "VoltOffset"), "Vertical offset", 0.0)
            .writable()
            .units("V")
            .command(CommandTemplate::lit("C<n>:OFFSET"))
            .setter(SetterKind::Scpi),
        PvDecl::discrete(channel_pv(channel, "Termination"), "Input termination", &["1M", "50"])
            .writable()
            .units("Ohm")
            .command(CommandTemplate::lit("C<n>:IMPEDANCE"))
            .setter(SetterKind::Scpi),
        PvDecl::array(channel_pv(channel, WAVEFORM), "Waveform array").units("du"),
        PvDecl::scalar(channel_pv(channel, MEAN), "Mean of the waveform", 0.0).units("V"),
        PvDecl::scalar(channel_pv(channel, PEAK2PEAK), "Peak-to-peak amplitude", 0.0)
            .units("V")
            .alarm(-9.0, 9.0),
    ]
}
