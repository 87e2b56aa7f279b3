//! HI-6006 field probe wire protocol.
//!
//! Protocol Overview:
//! - Commands: bare ASCII, one or two letters (`I`, `BP`, `TF`, `D5`)
//! - Responses: colon-prefixed fixed-width ASCII frames, delimited by block size only
//! - Errors: `E<digit>` replaces the payload; a trailing `F` status flag reports battery failure
//!
//! Every command maps to exactly one response kind, so decoding dispatches on the
//! [`ProbeCommand`] that was sent rather than on the shape of the reply.

use std::fmt;
use thiserror::Error;

/// Probe error taxonomy, indexed by the digit following `E` in an error frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ErrorCode {
    Unknown,
    Communication,
    BufferFull,
    InvalidCommand,
    InvalidParameter,
    Hardware,
    Parity,
    ProbeOff,
    /// Second code the firmware uses for a rejected command.
    InvalidCommandAlt,
    /// Never sent as `E9`; inferred from the trailing `F` status flag.
    BatteryFail,
}

impl ErrorCode {
    const TABLE: [ErrorCode; 10] = [
        ErrorCode::Unknown,
        ErrorCode::Communication,
        ErrorCode::BufferFull,
        ErrorCode::InvalidCommand,
        ErrorCode::InvalidParameter,
        ErrorCode::Hardware,
        ErrorCode::Parity,
        ErrorCode::ProbeOff,
        ErrorCode::InvalidCommandAlt,
        ErrorCode::BatteryFail,
    ];

    /// Looks up the code for an `E<digit>` frame. Out-of-range digits map to `Unknown`.
    pub fn from_index(index: usize) -> Self {
        Self::TABLE.get(index).copied().unwrap_or(ErrorCode::Unknown)
    }

    /// Digit of the matching `E<digit>` frame.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Operator-facing description.
    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::Unknown => "Unknown Error",
            ErrorCode::Communication => "Communication Error",
            ErrorCode::BufferFull => "Buffer Full Error",
            ErrorCode::InvalidCommand | ErrorCode::InvalidCommandAlt => "Invalid Command",
            ErrorCode::InvalidParameter => "Invalid Parameter",
            ErrorCode::Hardware => "Hardware Error",
            ErrorCode::Parity => "Parity Error",
            ErrorCode::ProbeOff => "Probe Off",
            ErrorCode::BatteryFail => "Battery Fail",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// A protocol fault: the probe answered, but not with a usable payload.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProbeFault {
    /// Error frame or battery failure flag.
    #[error("{0}")]
    Device(ErrorCode),

    /// The payload did not match the command's frame layout.
    #[error("Error Reading {command}: '{message}'")]
    Parse {
        /// Command whose reply failed to parse.
        command: ProbeCommand,
        /// Reply text, framing stripped.
        message: String,
    },
}

/// Requests understood by the probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProbeCommand {
    /// `I`: model, revision, serial and calibration date.
    Identity,
    /// `BP`: battery charge.
    Battery,
    /// `TF`: temperature in °F.
    Temperature,
    /// `D5`: composite and per-axis field.
    CompositeData,
}

impl ProbeCommand {
    /// Bytes written to the serial port.
    pub fn bytes(self) -> &'static [u8] {
        match self {
            ProbeCommand::Identity => b"I",
            ProbeCommand::Battery => b"BP",
            ProbeCommand::Temperature => b"TF",
            ProbeCommand::CompositeData => b"D5",
        }
    }

    /// Exact number of bytes in the response frame.
    pub fn block_size(self) -> usize {
        match self {
            ProbeCommand::Identity => 34,
            ProbeCommand::Battery => 6,
            ProbeCommand::Temperature => 8,
            ProbeCommand::CompositeData => 24,
        }
    }

    /// Whether a trailing `F` on this frame is the battery status flag.
    ///
    /// Battery frames are hex-encoded, so `F` there is a digit.
    fn has_status_flag(self) -> bool {
        !matches!(self, ProbeCommand::Battery)
    }
}

impl fmt::Display for ProbeCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProbeCommand::Identity => "Probe Identity",
            ProbeCommand::Battery => "Battery Level",
            ProbeCommand::Temperature => "Temperature",
            ProbeCommand::CompositeData => "Field Intensity",
        };
        f.write_str(name)
    }
}

/// One probe sample in V/m.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FieldReading {
    /// Root-sum-square of the three axes.
    pub composite: f64,
    /// X axis.
    pub x: f64,
    /// Y axis.
    pub y: f64,
    /// Z axis.
    pub z: f64,
}

/// Identity block reported by the `I` command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProbeIdentity {
    /// Model name, e.g. `HI-6006`.
    pub model: String,
    /// Firmware revision.
    pub revision: String,
    /// Probe serial number.
    pub serial_number: String,
    /// Date of the last calibration, as reported.
    pub calibration_date: String,
}

/// Typed payload of a successfully decoded frame.
#[derive(Clone, Debug, PartialEq)]
pub enum ProbeResponse {
    /// Identity block.
    Identity(ProbeIdentity),
    /// Battery charge in percent.
    Battery(u8),
    /// Temperature in °F.
    Temperature(f64),
    /// Field sample.
    Field(FieldReading),
}

/// A decoded frame. `battery_fail` is only ever set on field data, whose numbers stay usable.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    /// Decoded payload.
    pub response: ProbeResponse,
    /// Trailing `F` status flag was present.
    pub battery_fail: bool,
}

/// Decodes the raw response block for `command`.
///
/// Error frames are checked before the type-specific parser runs.
pub fn decode(command: ProbeCommand, raw: &[u8]) -> Result<Frame, ProbeFault> {
    let text = String::from_utf8_lossy(raw);
    let message = text.trim_matches(|c: char| matches!(c, ':' | '\r' | '\n' | '\0'));

    if let Some(rest) = message.strip_prefix('E') {
        if let Some(digit) = rest.chars().next().and_then(|c| c.to_digit(10)) {
            return Err(ProbeFault::Device(ErrorCode::from_index(digit as usize)));
        }
    }

    let battery_fail = command.has_status_flag() && message.ends_with('F');
    if battery_fail && command != ProbeCommand::CompositeData {
        return Err(ProbeFault::Device(ErrorCode::BatteryFail));
    }

    let parse_error = || ProbeFault::Parse {
        command,
        message: message.to_string(),
    };

    let response = match command {
        ProbeCommand::Identity => {
            ProbeResponse::Identity(parse_identity(message).ok_or_else(parse_error)?)
        }
        ProbeCommand::Battery => {
            let hex = message.get(1..3).ok_or_else(parse_error)?;
            ProbeResponse::Battery(u8::from_str_radix(hex, 16).map_err(|_| parse_error())?)
        }
        ProbeCommand::Temperature => {
            let value = message.strip_prefix('T').ok_or_else(parse_error)?;
            ProbeResponse::Temperature(value.trim().parse().map_err(|_| parse_error())?)
        }
        ProbeCommand::CompositeData => {
            ProbeResponse::Field(parse_field(message).ok_or_else(parse_error)?)
        }
    };

    Ok(Frame {
        response,
        battery_fail,
    })
}

fn parse_identity(message: &str) -> Option<ProbeIdentity> {
    let body = message.strip_prefix('I')?;
    let field = |range: std::ops::Range<usize>| {
        let end = range.end.min(body.len());
        body.get(range.start..end).map(|s| s.trim().to_string())
    };
    Some(ProbeIdentity {
        model: format!("HI-{}", field(0..4)?),
        revision: field(4..14)?,
        serial_number: field(14..22)?,
        calibration_date: field(22..30)?,
    })
}

// D<x:5><y:5><z:5><composite:5><status>
fn parse_field(message: &str) -> Option<FieldReading> {
    let body = message.strip_prefix('D')?;
    let body = body.strip_suffix(&['N', 'F'][..]).unwrap_or(body);
    let number = |range: std::ops::Range<usize>| body.get(range)?.trim().parse::<f64>().ok();
    Some(FieldReading {
        x: number(0..5)?,
        y: number(5..10)?,
        z: number(10..15)?,
        composite: number(15..20)?,
    })
}
