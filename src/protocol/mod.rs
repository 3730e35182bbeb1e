//! ASCII command protocol spoken by the collector firmware.
//!
//! Every unit on the wire is a frame of the form
//!
//! ```text
//! <MODE,MASK,A,B,C>
//! ```
//!
//! - `<` (0x3C) and `>` (0x3E) delimit the frame, fields are comma-separated and
//!   carry no whitespace.
//! - `MODE` is one of `RUN`, `STOP`, `RESUME`, `PAUSE`, `SET_SPEED`, `SET_ACCEL`.
//! - `MASK` selects which of the three motors the command addresses (`000`..`111`).
//! - `A,B,C` are decimal arguments, one per motor.
//!
//! Replies use the same delimiters; their payload is passed through untouched.

pub mod command;
pub mod framing;

pub use command::{Command, Mode, MotorMask};
pub use framing::{is_valid, read_frame, FrameDecoder, END_MARKER, START_MARKER};
