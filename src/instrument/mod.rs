//! Agilent N5181A signal generator driver.

pub mod link;
pub mod scpi;

pub use link::{detect, GeneratorState, InstrumentEvent, InstrumentLink, Pending};
pub use scpi::{
    AmMode, AmType, Command, CommandKind, Coupling, FrequencyUnit, Modulation, ModulationSource,
    PmBandwidth, Readback,
};
