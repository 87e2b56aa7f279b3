//! SCPI command table for the Agilent N5181A.
//!
//! Each [`CommandKind`] names one instrument setting: its SCPI header, which doubles as
//! the read-back query (`<header>?`), and how that read-back is parsed. Builders on
//! [`Command`] clamp arguments to the instrument's documented ranges before a command
//! is ever queued.

use crate::error::{AppResult, SweepError};
use std::fmt;

/// Lowest carrier frequency the N5181A accepts.
pub const MIN_FREQUENCY_HZ: f64 = 100e3;
/// Highest carrier frequency the N5181A accepts.
pub const MAX_FREQUENCY_HZ: f64 = 6e9;

const AM_RATE_KHZ: (f64, f64) = (0.0001, 20_000.0);
const FM_PM_RATE_HZ: (f64, f64) = (0.1, 20e6);

/// Modulation scheme.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Modulation {
    /// Amplitude.
    Am,
    /// Frequency.
    Fm,
    /// Phase.
    Pm,
}

impl Modulation {
    fn prefix(self) -> &'static str {
        match self {
            Modulation::Am => "AM",
            Modulation::Fm => "FM",
            Modulation::Pm => "PM",
        }
    }
}

impl fmt::Display for Modulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Unit suffix accepted after a frequency argument.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum FrequencyUnit {
    Hz,
    KHz,
    MHz,
    GHz,
}

impl FrequencyUnit {
    /// SCPI suffix, as written after the value.
    pub fn suffix(self) -> &'static str {
        match self {
            FrequencyUnit::Hz => "Hz",
            FrequencyUnit::KHz => "kHz",
            FrequencyUnit::MHz => "MHz",
            FrequencyUnit::GHz => "GHz",
        }
    }

    /// Hz per unit.
    pub fn scale(self) -> f64 {
        match self {
            FrequencyUnit::Hz => 1.0,
            FrequencyUnit::KHz => 1e3,
            FrequencyUnit::MHz => 1e6,
            FrequencyUnit::GHz => 1e9,
        }
    }
}

/// Where the modulating signal comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModulationSource {
    /// Internal function generator.
    Internal,
    /// Rear-panel input.
    External,
}

/// External input coupling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Coupling {
    Ac,
    Dc,
}

/// AM depth scale.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AmType {
    /// Depth in percent.
    Linear,
    /// Depth in dB.
    Exponential,
}

/// AM depth range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AmMode {
    /// Normal depth range.
    Normal,
    /// Extended depth at reduced accuracy.
    Deep,
}

/// PM modulation bandwidth.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PmBandwidth {
    /// Wider deviation, lower rate.
    Normal,
    /// Higher rate, narrower deviation.
    High,
}

/// Which setting a queued command changes. Determines the read-back query and event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// `*IDN?`, a pure query.
    Identity,
    /// Carrier frequency.
    Frequency,
    /// Output power.
    Power,
    /// RF output switch.
    RfOutput,
    /// Master modulation switch.
    ModulationState,
    /// Per-scheme modulation switch.
    SubState(Modulation),
    /// Modulation source for one scheme.
    Source(Modulation),
    /// External input coupling for one scheme.
    Coupling(Modulation),
    /// Internal modulation rate for one scheme.
    Rate(Modulation),
    /// Linear or exponential AM.
    AmType,
    /// Normal or deep AM.
    AmMode,
    /// Linear AM depth.
    AmLinearDepth,
    /// Exponential AM depth.
    AmExponentialDepth,
    /// PM bandwidth.
    PmBandwidth,
    /// Stops the writer loop. Never sent to the instrument.
    Exit,
}

impl CommandKind {
    /// SCPI header; the read-back query is this header followed by `?`.
    pub fn header(self) -> &'static str {
        use Modulation::*;
        match self {
            CommandKind::Identity => "*IDN",
            CommandKind::Frequency => ":FREQ",
            CommandKind::Power => ":POW",
            CommandKind::RfOutput => ":OUTP:STAT",
            CommandKind::ModulationState => ":OUTP:MOD:STAT",
            CommandKind::SubState(Am) => ":AM:STAT",
            CommandKind::SubState(Fm) => ":FM:STAT",
            CommandKind::SubState(Pm) => ":PM:STAT",
            CommandKind::Source(Am) => ":AM:SOUR",
            CommandKind::Source(Fm) => ":FM:SOUR",
            CommandKind::Source(Pm) => ":PM:SOUR",
            CommandKind::Coupling(Am) => ":AM:EXT:COUP",
            CommandKind::Coupling(Fm) => ":FM:EXT:COUP",
            CommandKind::Coupling(Pm) => ":PM:EXT:COUP",
            CommandKind::Rate(Am) => ":AM:INT:FREQ",
            CommandKind::Rate(Fm) => ":FM:INT:FREQ",
            CommandKind::Rate(Pm) => ":PM:INT:FREQ",
            CommandKind::AmType => ":AM:TYPE",
            CommandKind::AmMode => ":AM:MODE",
            CommandKind::AmLinearDepth => ":AM:DEPT:LIN",
            CommandKind::AmExponentialDepth => ":AM:DEPT:EXP",
            CommandKind::PmBandwidth => ":PM:BAND",
            CommandKind::Exit => "",
        }
    }

    /// Query that reads the setting back.
    pub fn readback_query(self) -> String {
        format!("{}?", self.header())
    }

    /// Parses the instrument's answer to [`CommandKind::readback_query`].
    pub fn parse_readback(self, raw: &str) -> AppResult<Readback> {
        let value = raw.trim().trim_matches('"');
        let unexpected = || SweepError::UnexpectedResponse {
            command: self.readback_query(),
            response: raw.to_string(),
        };
        let number = || value.parse::<f64>().map_err(|_| unexpected());
        let upper = value.to_ascii_uppercase();

        let readback = match self {
            CommandKind::Identity => Readback::Identity(value.to_string()),
            CommandKind::Frequency => Readback::Frequency(number()?),
            CommandKind::Power => Readback::Power(number()?),
            CommandKind::RfOutput => Readback::RfOutput(parse_bool(value).ok_or_else(unexpected)?),
            CommandKind::ModulationState => {
                Readback::ModulationState(parse_bool(value).ok_or_else(unexpected)?)
            }
            CommandKind::SubState(m) => Readback::SubState(m, parse_bool(value).ok_or_else(unexpected)?),
            CommandKind::Source(m) => {
                let source = if upper.starts_with("INT") {
                    ModulationSource::Internal
                } else if upper.starts_with("EXT") {
                    ModulationSource::External
                } else {
                    return Err(unexpected());
                };
                Readback::Source(m, source)
            }
            CommandKind::Coupling(m) => {
                let coupling = match upper.as_str() {
                    "AC" => Coupling::Ac,
                    "DC" => Coupling::Dc,
                    _ => return Err(unexpected()),
                };
                Readback::Coupling(m, coupling)
            }
            CommandKind::Rate(m) => Readback::Rate(m, number()?),
            CommandKind::AmType => match upper.as_str() {
                "LIN" | "LINEAR" => Readback::AmType(AmType::Linear),
                "EXP" | "EXPONENTIAL" => Readback::AmType(AmType::Exponential),
                _ => return Err(unexpected()),
            },
            CommandKind::AmMode => match upper.as_str() {
                "NORM" | "NORMAL" => Readback::AmMode(AmMode::Normal),
                "DEEP" => Readback::AmMode(AmMode::Deep),
                _ => return Err(unexpected()),
            },
            CommandKind::AmLinearDepth | CommandKind::AmExponentialDepth => {
                Readback::Depth(number()?)
            }
            CommandKind::PmBandwidth => match upper.as_str() {
                "NORM" | "NORMAL" => Readback::PmBandwidth(PmBandwidth::Normal),
                "HIGH" => Readback::PmBandwidth(PmBandwidth::High),
                _ => return Err(unexpected()),
            },
            CommandKind::Exit => return Err(unexpected()),
        };
        Ok(readback)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_uppercase().as_str() {
        "ON" => Some(true),
        "OFF" => Some(false),
        other => other.parse::<f64>().ok().map(|v| v != 0.0),
    }
}

/// Authoritative value read back from the instrument after a command completes.
#[derive(Clone, Debug, PartialEq)]
pub enum Readback {
    /// `*IDN?` answer.
    Identity(String),
    /// Carrier frequency in Hz.
    Frequency(f64),
    /// Output power in dBm.
    Power(f64),
    /// RF output switch.
    RfOutput(bool),
    /// Master modulation switch.
    ModulationState(bool),
    /// One scheme's switch.
    SubState(Modulation, bool),
    /// One scheme's source.
    Source(Modulation, ModulationSource),
    /// One scheme's external coupling.
    Coupling(Modulation, Coupling),
    /// Internal modulation rate in Hz.
    Rate(Modulation, f64),
    /// AM depth scale.
    AmType(AmType),
    /// AM depth range.
    AmMode(AmMode),
    /// AM depth, in percent or dB depending on the type.
    Depth(f64),
    /// PM bandwidth.
    PmBandwidth(PmBandwidth),
}

/// A queued instrument command.
#[derive(Clone, Debug, PartialEq)]
pub struct Command {
    /// Setting changed, which also picks the read-back.
    pub kind: CommandKind,
    /// Line written to the instrument. Empty for pure queries.
    pub payload: String,
}

fn on_off(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

impl Command {
    fn new(kind: CommandKind, payload: String) -> Self {
        Self { kind, payload }
    }

    /// Identity query.
    pub fn identity() -> Self {
        Self::new(CommandKind::Identity, String::new())
    }

    /// Writer shutdown marker.
    pub fn exit() -> Self {
        Self::new(CommandKind::Exit, String::new())
    }

    /// Carrier frequency, clamped to 100 kHz..6 GHz.
    pub fn frequency(value: f64, unit: FrequencyUnit) -> Self {
        let hz = (value * unit.scale()).clamp(MIN_FREQUENCY_HZ, MAX_FREQUENCY_HZ);
        let value = hz / unit.scale();
        Self::new(
            CommandKind::Frequency,
            format!("{} {} {}", CommandKind::Frequency.header(), value, unit.suffix()),
        )
    }

    /// Output power rounded to 1 mdB. Returns the command and, when the request was
    /// above `max_dbm`, the value it was clamped to.
    pub fn power(dbm: f64, max_dbm: f64) -> (Self, Option<f64>) {
        let (applied, clamped) = if dbm > max_dbm {
            (max_dbm, Some(max_dbm))
        } else {
            (dbm, None)
        };
        let command = Self::new(
            CommandKind::Power,
            format!("{} {} dBm", CommandKind::Power.header(), round3(applied)),
        );
        (command, clamped)
    }

    /// RF output on or off.
    pub fn rf_output(on: bool) -> Self {
        Self::new(
            CommandKind::RfOutput,
            format!("{} {}", CommandKind::RfOutput.header(), on_off(on)),
        )
    }

    /// Master modulation switch.
    pub fn modulation_state(on: bool) -> Self {
        Self::new(
            CommandKind::ModulationState,
            format!("{} {}", CommandKind::ModulationState.header(), on_off(on)),
        )
    }

    /// Switches one scheme on or off.
    pub fn sub_state(modulation: Modulation, on: bool) -> Self {
        let kind = CommandKind::SubState(modulation);
        Self::new(kind, format!("{} {}", kind.header(), on_off(on)))
    }

    /// Selects one scheme's modulating source.
    pub fn source(modulation: Modulation, source: ModulationSource) -> Self {
        let kind = CommandKind::Source(modulation);
        let arg = match source {
            ModulationSource::Internal => "INT",
            ModulationSource::External => "EXT",
        };
        Self::new(kind, format!("{} {}", kind.header(), arg))
    }

    /// Sets one scheme's external input coupling.
    pub fn coupling(modulation: Modulation, coupling: Coupling) -> Self {
        let kind = CommandKind::Coupling(modulation);
        let arg = match coupling {
            Coupling::Ac => "AC",
            Coupling::Dc => "DC",
        };
        Self::new(kind, format!("{} {}", kind.header(), arg))
    }

    /// AM internal rate in kHz, clamped to 0.1 Hz..20 MHz.
    pub fn am_rate(khz: f64) -> Self {
        let kind = CommandKind::Rate(Modulation::Am);
        let khz = khz.clamp(AM_RATE_KHZ.0, AM_RATE_KHZ.1);
        Self::new(kind, format!("{} {} kHz", kind.header(), khz))
    }

    /// FM or PM internal rate, clamped to 0.1 Hz..20 MHz.
    pub fn angle_rate(modulation: Modulation, value: f64, unit: FrequencyUnit) -> Self {
        let kind = CommandKind::Rate(modulation);
        let hz = (value * unit.scale()).clamp(FM_PM_RATE_HZ.0, FM_PM_RATE_HZ.1);
        Self::new(
            kind,
            format!("{} {} {}", kind.header(), hz / unit.scale(), unit.suffix()),
        )
    }

    /// Linear or exponential AM.
    pub fn am_type(am_type: AmType) -> Self {
        let arg = match am_type {
            AmType::Linear => "LIN",
            AmType::Exponential => "EXP",
        };
        Self::new(CommandKind::AmType, format!("{} {}", CommandKind::AmType.header(), arg))
    }

    /// Normal or deep AM.
    pub fn am_mode(mode: AmMode) -> Self {
        let arg = match mode {
            AmMode::Normal => "NORM",
            AmMode::Deep => "DEEP",
        };
        Self::new(CommandKind::AmMode, format!("{} {}", CommandKind::AmMode.header(), arg))
    }

    /// Linear AM depth in percent, clamped to 0..100.
    pub fn am_linear_depth(percent: f64) -> Self {
        Self::new(
            CommandKind::AmLinearDepth,
            format!(
                "{} {}",
                CommandKind::AmLinearDepth.header(),
                percent.clamp(0.0, 100.0)
            ),
        )
    }

    /// Exponential AM depth in dB.
    pub fn am_exponential_depth(db: f64) -> Self {
        Self::new(
            CommandKind::AmExponentialDepth,
            format!("{} {}", CommandKind::AmExponentialDepth.header(), db.max(0.0)),
        )
    }

    /// PM bandwidth.
    pub fn pm_bandwidth(bandwidth: PmBandwidth) -> Self {
        let arg = match bandwidth {
            PmBandwidth::Normal => "NORM",
            PmBandwidth::High => "HIGH",
        };
        Self::new(
            CommandKind::PmBandwidth,
            format!("{} {}", CommandKind::PmBandwidth.header(), arg),
        )
    }

    /// Commands selecting one modulation scheme: the other two off, then the chosen one on.
    pub fn modulation_type(modulation: Modulation) -> [Self; 3] {
        let others = match modulation {
            Modulation::Am => [Modulation::Pm, Modulation::Fm],
            Modulation::Fm => [Modulation::Pm, Modulation::Am],
            Modulation::Pm => [Modulation::Fm, Modulation::Am],
        };
        [
            Self::sub_state(others[0], false),
            Self::sub_state(others[1], false),
            Self::sub_state(modulation, true),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_literals() {
        assert_eq!(Command::frequency(110.0, FrequencyUnit::MHz).payload, ":FREQ 110 MHz");
        assert_eq!(Command::rf_output(true).payload, ":OUTP:STAT ON");
        assert_eq!(Command::modulation_state(false).payload, ":OUTP:MOD:STAT OFF");
        assert_eq!(Command::sub_state(Modulation::Am, true).payload, ":AM:STAT ON");
        assert_eq!(Command::am_type(AmType::Exponential).payload, ":AM:TYPE EXP");
        assert_eq!(Command::am_linear_depth(30.0).payload, ":AM:DEPT:LIN 30");
        assert_eq!(Command::am_exponential_depth(20.0).payload, ":AM:DEPT:EXP 20");
        assert_eq!(Command::am_rate(1.0).payload, ":AM:INT:FREQ 1 kHz");
        assert_eq!(CommandKind::Identity.readback_query(), "*IDN?");
        assert_eq!(CommandKind::SubState(Modulation::Pm).header(), ":PM:STAT");
        assert_eq!(CommandKind::SubState(Modulation::Fm).header(), ":FM:STAT");
    }

    #[test]
    fn test_frequency_clamped_to_range() {
        assert_eq!(Command::frequency(7.5, FrequencyUnit::GHz).payload, ":FREQ 6 GHz");
        assert_eq!(Command::frequency(10.0, FrequencyUnit::KHz).payload, ":FREQ 100 kHz");
        assert_eq!(Command::frequency(0.05, FrequencyUnit::MHz).payload, ":FREQ 0.1 MHz");
    }

    #[test]
    fn test_power_clamp_and_rounding() {
        let (command, clamped) = Command::power(12.0, 9.9);
        assert_eq!(command.payload, ":POW 9.9 dBm");
        assert_eq!(clamped, Some(9.9));

        let (command, clamped) = Command::power(-12.34567, 9.9);
        assert_eq!(command.payload, ":POW -12.346 dBm");
        assert_eq!(clamped, None);
    }

    #[test]
    fn test_modulation_type_disables_others_first() {
        let commands = Command::modulation_type(Modulation::Fm);
        let payloads: Vec<&str> = commands.iter().map(|c| c.payload.as_str()).collect();
        assert_eq!(payloads, [":PM:STAT OFF", ":AM:STAT OFF", ":FM:STAT ON"]);
    }

    #[test]
    fn test_parse_readbacks() {
        assert_eq!(
            CommandKind::Frequency.parse_readback("+1.10000000000000E+08").unwrap(),
            Readback::Frequency(110e6)
        );
        assert_eq!(
            CommandKind::Power.parse_readback("-3.00000000E+001").unwrap(),
            Readback::Power(-30.0)
        );
        assert_eq!(
            CommandKind::RfOutput.parse_readback("1").unwrap(),
            Readback::RfOutput(true)
        );
        assert_eq!(
            CommandKind::Source(Modulation::Am).parse_readback("EXT1").unwrap(),
            Readback::Source(Modulation::Am, ModulationSource::External)
        );
        assert_eq!(
            CommandKind::AmType.parse_readback("LIN").unwrap(),
            Readback::AmType(AmType::Linear)
        );
    }

    #[test]
    fn test_parse_garbage_is_protocol_error() {
        let err = CommandKind::Power.parse_readback("garbage").unwrap_err();
        assert!(matches!(err, SweepError::UnexpectedResponse { .. }));
        assert!(!err.is_transport());
    }
}
