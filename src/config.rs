//! Configuration using Figment
//!
//! Settings are layered, lowest to highest precedence:
//! 1. Built-in defaults ([`Settings::default`])
//! 2. A TOML file (`config/default.toml` unless another path is given)
//! 3. Environment variables prefixed with `IMMUNISWEEP_`, nested keys split on `__`
//!
//! ```text
//! IMMUNISWEEP_APPLICATION__LOG_LEVEL=debug
//! IMMUNISWEEP_SIGNAL_GENERATOR__ADDRESS=10.0.0.7
//! IMMUNISWEEP_SWEEP__TARGET_FIELD=3.0
//! ```

use crate::error::{AppResult, SweepError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

const ENV_PREFIX: &str = "IMMUNISWEEP_";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
#[allow(missing_docs)]
pub struct Settings {
    pub application: ApplicationSettings,
    pub signal_generator: SignalGeneratorSettings,
    pub probe: ProbeSettings,
    pub sweep: SweepSettings,
    pub regulator: RegulatorSettings,
}

/// Process-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationSettings {
    /// Shown in the startup log line
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Directory receiving one warning log per sweep session
    pub log_dir: PathBuf,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            name: "ImmuniSweep".to_string(),
            log_level: "info".to_string(),
            log_dir: default_log_dir(),
        }
    }
}

fn default_log_dir() -> PathBuf {
    dirs::document_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join("Documents")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ImmuniSweepLogs")
}

/// Agilent N5181A connection over raw SCPI sockets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalGeneratorSettings {
    /// Host name or IP address
    pub address: String,
    /// Raw SCPI socket port
    pub port: u16,
    /// Bound on each write / operation-complete / read-back round trip
    pub timeout_ms: u64,
    /// Reachability checks before the generator is reported missing
    pub detection_attempts: u32,
    /// Wait between reachability checks
    pub detection_backoff_ms: u64,
    /// Requests above this are clamped before they are queued
    pub max_power_dbm: f64,
}

impl Default for SignalGeneratorSettings {
    fn default() -> Self {
        Self {
            address: "192.168.100.79".to_string(),
            port: 5025,
            timeout_ms: 5000,
            detection_attempts: 4,
            detection_backoff_ms: 500,
            max_power_dbm: 9.9,
        }
    }
}

impl SignalGeneratorSettings {
    /// Round-trip bound as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// HI-6006 serial link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSettings {
    /// Serial device path
    pub port: String,
    /// Line speed; framing is fixed at 7O1
    pub baud_rate: u32,
    /// Bound on each response block
    pub read_timeout_ms: u64,
    /// Composite data poll period
    pub data_interval_ms: u64,
    /// Battery and temperature poll period
    pub info_interval_ms: u64,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            read_timeout_ms: 5000,
            data_interval_ms: 5,
            info_interval_ms: 2000,
        }
    }
}

/// Sweep range, field target and loop timing. Frequencies in MHz, power in dBm, field in V/m.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepSettings {
    /// First frequency of the forward sweep
    pub start_mhz: f64,
    /// Last frequency of the forward sweep
    pub stop_mhz: f64,
    /// Fractional step, `f += f * sweep_term`
    pub sweep_term: f64,
    /// Hold time at each accepted or missed frequency
    pub dwell_ms: u64,
    /// Power every frequency starts from
    pub base_power_dbm: f64,
    /// Field to hold at each frequency
    pub target_field: f64,
    /// Upper edge of the acceptance band, as a factor of the target
    pub threshold: f64,
    /// Regulation never requests more than this
    pub power_ceiling_dbm: f64,
    /// Regulation never requests less than this
    pub power_floor_dbm: f64,
    /// Fields above this factor of the target are logged and skipped
    pub high_field_factor: f64,
    /// At or below this field, saturated power is treated as a hardware fault
    pub hardware_fault_field: f64,
    /// Wait after RF is switched on for a forward sweep
    pub start_settle_ms: u64,
    /// Wait after RF is switched on for a re-sweep
    pub resweep_settle_ms: u64,
    /// Wait after each frequency change
    pub step_settle_ms: u64,
    /// Longest wait for a fresh probe reading after a power change
    pub regulation_settle_ms: u64,
    /// Regulation attempts at one frequency before it counts as missed
    pub max_regulation_iterations: u32,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            start_mhz: 1000.0,
            stop_mhz: 2000.0,
            sweep_term: 0.01,
            dwell_ms: 500,
            base_power_dbm: -30.0,
            target_field: 1.0,
            threshold: 1.5,
            power_ceiling_dbm: 10.0,
            power_floor_dbm: -110.0,
            high_field_factor: 2.0,
            hardware_fault_field: 0.5,
            start_settle_ms: 1000,
            resweep_settle_ms: 500,
            step_settle_ms: 100,
            regulation_settle_ms: 5,
            max_regulation_iterations: 2000,
        }
    }
}

/// Which power regulator drives the loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegulatorMode {
    /// Fixed dB steps.
    #[default]
    Stepper,
    /// PID on field error.
    Pid,
}

/// Gains and step sizes for both regulators. Only the selected mode's values are used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegulatorSettings {
    /// Selected strategy
    pub mode: RegulatorMode,
    /// Proportional gain, dB per V/m
    pub kp: f64,
    /// Integral gain
    pub ki: f64,
    /// Derivative gain
    pub kd: f64,
    /// Stepper increase below target
    pub step_up_db: f64,
    /// Stepper decrease above the band
    pub step_down_db: f64,
}

impl Default for RegulatorSettings {
    fn default() -> Self {
        Self {
            mode: RegulatorMode::Stepper,
            kp: 0.1,
            ki: 0.01,
            kd: 0.01,
            step_up_db: 0.1,
            step_down_db: 1.0,
        }
    }
}

impl Settings {
    /// Loads from [`DEFAULT_CONFIG_PATH`] and the environment. A missing file is not an error.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Loads from a specific TOML file and the environment, then validates.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Start frequency is below stop frequency, sweep term is positive
    /// - Target field is positive and the threshold ratio exceeds 1
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(SweepError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let sweep = &self.sweep;
        if sweep.start_mhz <= 0.0 || sweep.start_mhz >= sweep.stop_mhz {
            return Err(SweepError::Configuration(format!(
                "Start frequency {} MHz must be positive and below stop frequency {} MHz",
                sweep.start_mhz, sweep.stop_mhz
            )));
        }
        if sweep.sweep_term <= 0.0 {
            return Err(SweepError::Configuration(format!(
                "Sweep term must be positive, got {}",
                sweep.sweep_term
            )));
        }
        if sweep.target_field <= 0.0 {
            return Err(SweepError::Configuration(format!(
                "Target field must be positive, got {} V/m",
                sweep.target_field
            )));
        }
        if sweep.threshold <= 1.0 {
            return Err(SweepError::Configuration(format!(
                "Threshold ratio must exceed 1, got {}",
                sweep.threshold
            )));
        }
        if sweep.base_power_dbm >= sweep.power_ceiling_dbm {
            return Err(SweepError::Configuration(format!(
                "Base power {} dBm must be below the power ceiling {} dBm",
                sweep.base_power_dbm, sweep.power_ceiling_dbm
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.signal_generator.port, 5025);
        assert_eq!(settings.probe.baud_rate, 9600);
        assert_eq!(settings.sweep.base_power_dbm, -30.0);
        assert_eq!(settings.regulator.mode, RegulatorMode::Stepper);
        assert!(settings.application.log_dir.ends_with("ImmuniSweepLogs"));
    }

    #[test]
    fn test_load_from_toml_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[sweep]
start_mhz = 80.0
stop_mhz = 1000.0
target_field = 3.0

[regulator]
mode = "pid"
kp = 0.2
"#
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.sweep.start_mhz, 80.0);
        assert_eq!(settings.sweep.target_field, 3.0);
        assert_eq!(settings.sweep.threshold, 1.5);
        assert_eq!(settings.regulator.mode, RegulatorMode::Pid);
        assert_eq!(settings.regulator.kp, 0.2);
        assert_eq!(settings.regulator.ki, 0.01);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(settings.sweep.stop_mhz, 2000.0);
    }

    #[test]
    fn test_validation_rejects_inverted_range() {
        let mut settings = Settings::default();
        settings.sweep.start_mhz = 3000.0;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("below stop frequency"));
    }

    #[test]
    fn test_validation_rejects_bad_band() {
        let mut settings = Settings::default();
        settings.sweep.threshold = 1.0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.sweep.sweep_term = 0.0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.application.log_level = "verbose".into();
        assert!(settings.validate().is_err());
    }
}
