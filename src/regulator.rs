//! Power regulation strategies for the closed field loop.
//!
//! Both strategies answer the same question: given the field just measured, how many dB
//! should be added to the current output power? A positive delta raises power, a negative
//! one lowers it, and zero means the reading is already in the acceptance band.

use crate::config::{RegulatorMode, RegulatorSettings};
use enum_dispatch::enum_dispatch;
use tracing::trace;

/// Contract shared by every regulation strategy.
#[enum_dispatch]
pub trait Regulate {
    /// Sets the field setpoint in V/m.
    fn set_target(&mut self, target: f64);

    /// Current field setpoint in V/m.
    fn target(&self) -> f64;

    /// Returns the power delta in dB to apply for the `measured` field.
    fn calculate(&mut self, measured: f64) -> f64;

    /// Resets accumulated state. The setpoint is kept.
    fn clear(&mut self);
}

/// Classic discrete PID on field error.
#[derive(Clone, Debug, PartialEq)]
pub struct PidController {
    kp: f64,
    ki: f64,
    kd: f64,
    target: f64,
    integral: f64,
    prev_error: f64,
}

impl PidController {
    /// Gains in dB per V/m of error. The target starts at 1 V/m.
    pub fn new(kp: f64, ki: f64, kd: f64) -> Self {
        Self {
            kp,
            ki,
            kd,
            target: 1.0,
            integral: 0.0,
            prev_error: 0.0,
        }
    }

    /// Replaces all three gains. Accumulated state is kept.
    pub fn set_gains(&mut self, kp: f64, ki: f64, kd: f64) {
        self.kp = kp;
        self.ki = ki;
        self.kd = kd;
    }

    /// `(kp, ki, kd)`.
    pub fn gains(&self) -> (f64, f64, f64) {
        (self.kp, self.ki, self.kd)
    }

    /// Accumulated error since the last clear.
    pub fn integral(&self) -> f64 {
        self.integral
    }

    /// Error seen by the previous `calculate`.
    pub fn prev_error(&self) -> f64 {
        self.prev_error
    }
}

impl Regulate for PidController {
    fn set_target(&mut self, target: f64) {
        self.target = target;
    }

    fn target(&self) -> f64 {
        self.target
    }

    fn calculate(&mut self, measured: f64) -> f64 {
        let error = self.target - measured;
        self.integral += error;
        let derivative = error - self.prev_error;
        let output = self.kp * error + self.ki * self.integral + self.kd * derivative;
        self.prev_error = error;
        trace!(measured, error, integral = self.integral, derivative, output, "pid");
        output
    }

    fn clear(&mut self) {
        self.integral = 0.0;
        self.prev_error = 0.0;
    }
}

/// Incremental stepper: small steps up when below target, large steps down when above the band.
#[derive(Clone, Debug, PartialEq)]
pub struct StepRegulator {
    target: f64,
    threshold: f64,
    step_up_db: f64,
    step_down_db: f64,
}

impl StepRegulator {
    /// `threshold` is the band's upper factor over the target. Both steps are positive dB.
    pub fn new(threshold: f64, step_up_db: f64, step_down_db: f64) -> Self {
        Self {
            target: 1.0,
            threshold,
            step_up_db,
            step_down_db,
        }
    }

    /// Sets the band's upper factor.
    pub fn set_threshold(&mut self, threshold: f64) {
        self.threshold = threshold;
    }
}

impl Default for StepRegulator {
    fn default() -> Self {
        Self::new(1.5, 0.1, 1.0)
    }
}

impl Regulate for StepRegulator {
    fn set_target(&mut self, target: f64) {
        self.target = target;
    }

    fn target(&self) -> f64 {
        self.target
    }

    fn calculate(&mut self, measured: f64) -> f64 {
        if measured < self.target {
            self.step_up_db
        } else if measured >= self.target * self.threshold {
            -self.step_down_db
        } else {
            0.0
        }
    }

    fn clear(&mut self) {}
}

/// The strategy selected for a sweep.
#[enum_dispatch(Regulate)]
#[derive(Clone, Debug, PartialEq)]
pub enum PowerRegulator {
    /// PID on field error.
    Pid(PidController),
    /// Fixed up and down steps.
    Stepper(StepRegulator),
}

impl PowerRegulator {
    /// Builds the regulator described by `settings`, with `target` and `threshold` from the sweep.
    pub fn from_settings(settings: &RegulatorSettings, target: f64, threshold: f64) -> Self {
        let mut regulator: PowerRegulator = match settings.mode {
            RegulatorMode::Pid => PidController::new(settings.kp, settings.ki, settings.kd).into(),
            RegulatorMode::Stepper => {
                StepRegulator::new(threshold, settings.step_up_db, settings.step_down_db).into()
            }
        };
        regulator.set_target(target);
        regulator
    }

    /// Whether the fixed-step strategy is selected.
    pub fn is_stepper(&self) -> bool {
        matches!(self, PowerRegulator::Stepper(_))
    }

    /// Propagates a new acceptance band ratio to strategies that use it.
    pub fn set_threshold(&mut self, threshold: f64) {
        if let PowerRegulator::Stepper(stepper) = self {
            stepper.set_threshold(threshold);
        }
    }
}

impl Default for PowerRegulator {
    fn default() -> Self {
        PowerRegulator::Stepper(StepRegulator::default())
    }
}
