//! Transport adapters
//!
//! Low-level byte transports shared by the instrument links: line-oriented SCPI for the
//! signal generator, fixed-block serial reads for the field probe, and in-process
//! simulators of both devices.

pub mod mock;
pub mod scpi_adapter;
pub mod serial_adapter;

pub use mock::SimulatedBench;
pub use scpi_adapter::ScpiStream;
