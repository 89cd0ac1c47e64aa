//! Pipeline module - stage plan execution over all identifiers.

mod discovery;
mod driver;
mod layout;

#[cfg(test)]
mod fakes;

pub use discovery::discover_identifiers;
pub use driver::*;
pub use layout::{
    PositionLayout, Retention, CUT_IM, CUT_IM_RAWCOUNTS, RAW_IM, SEG_IM, SEG_IM_BIN, TRACK_OUTPUT,
};
