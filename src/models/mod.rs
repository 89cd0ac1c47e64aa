//! Core data models for chamberflow.
//!
//! - `config`: the INI run configuration that stages read and extend
//! - `error`: error taxonomy
//! - `stage`: stage names, records and the per-identifier stage order
//! - `tools`: external program configuration

mod config;
mod error;
mod stage;
mod tools;

pub use config::*;
pub use error::*;
pub use stage::*;
pub use tools::*;
