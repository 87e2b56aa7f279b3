//! Core library for the ImmuniSweep field controller.
//!
//! Drives an RF signal generator and reads a tri-axial field probe to hold a target
//! electric field at every frequency of a swept range. The library holds the two
//! instrument links, the power regulators and the sweep controller; the `immunisweep`
//! binary is a headless driver built on top of it.

pub mod adapters;
pub mod config;
pub mod error;
pub mod error_recovery;
pub mod instrument;
pub mod probe;
pub mod regulator;
pub mod sweep;

pub use config::Settings;
pub use error::{AppResult, SweepError};
