//! Run sequencing for the fraction collector.
//!
//! - [`RunParameters`]: operator input, validated against the angle table.
//! - [`RunController`]: the Idle/Running/Paused/Done/Failed state machine that
//!   owns the serial channel and drives the carousel.
//! - [`RunStatus`]: snapshots for pollers.

pub mod controller;
pub mod params;
pub mod state;

pub use controller::{ControllerSettings, RunController};
pub use params::RunParameters;
pub use state::{RunState, RunStatus};
