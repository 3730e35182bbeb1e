//! # Colosseum Collector Library
//!
//! Control engine for the Colosseum motorized fraction collector. The collector
//! is a three-motor carousel driven by a microcontroller over a serial line; this
//! crate turns an operator's run parameters (fraction size, flow rate, fraction
//! count) into a timed sequence of positioning commands and drives it with
//! pause, resume and stop control.
//!
//! ## Crate Structure
//!
//! - **`protocol`**: The `<MODE,MASK,A,B,C>` ASCII frame format: command encoding,
//!   frame validation and reply framing.
//! - **`timing`**: Flow/volume unit conversions and the dwell-time calculation.
//! - **`sequence`**: The carousel angle table and the RUN sequence built from it.
//! - **`hardware`**: The `SerialChannel` abstraction with a real serial-port
//!   transport and a simulated one for dry runs.
//! - **`experiment`**: The `RunController` state machine that sequences a run on
//!   its own task.
//! - **`config`**: Figment-based configuration (TOML file plus `COLOSSEUM_*`
//!   environment overrides).
//! - **`logging`**: `tracing` subscriber setup.
//! - **`error`**: The `CollectorError` enum shared by every module.

pub mod config;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod logging;
pub mod protocol;
pub mod sequence;
pub mod timing;

pub use error::{AppResult, CollectorError};
pub use experiment::{ControllerSettings, RunController, RunParameters, RunState, RunStatus};
