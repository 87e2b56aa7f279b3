//! ETS-Lindgren HI-6006 tri-axial field probe.
//!
//! [`protocol`] holds the framed command/response codec, [`link`] the I/O loop that
//! keeps the latest reading available to the sweep controller.

pub mod link;
pub mod protocol;

pub use link::{ProbeEvent, ProbeLink};
pub use protocol::{
    decode, ErrorCode, FieldReading, Frame, ProbeCommand, ProbeFault, ProbeIdentity, ProbeResponse,
};
