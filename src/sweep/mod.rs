//! Radiated-immunity field sweep.

pub mod controller;
pub mod plan;
pub mod warning_log;

pub use controller::{
    FieldSensor, Regulation, SignalSource, StepOutcome, SweepController, SweepEvent, SweepState,
    SweepStopHandle,
};
pub use plan::TimeUnit;
pub use warning_log::WarningLog;
