//! Cross-family Customer Programming Software core for Motorola
//! land-mobile radios: XNL/XCMP session and command layers, the
//! MOTOTRBO/TETRA/LTE transfer engines built on top of them, and the
//! dispatcher that picks one per host.

pub mod dispatcher;
pub mod engines;
pub mod error;
pub mod model;
pub mod tea;
pub mod xcmp;
pub mod xnl;

pub use dispatcher::{DispatchedEngine, Dispatcher};
pub use engines::{Engine, ProgressCallback, RadioIdentification};
pub use error::CoreError;
pub use model::ParsedCodeplug;
