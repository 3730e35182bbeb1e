//! Typed commands and their wire encoding.

use crate::error::{AppResult, CollectorError};
use std::fmt;
use std::str::FromStr;

/// Operating mode of a command, the first field of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Move the selected motors to the given absolute positions
    Run,
    /// Halt the selected motors
    Stop,
    /// Resume motion after a firmware-side pause
    Resume,
    /// Pause motion on the firmware side
    Pause,
    /// Set maximum speed per motor
    SetSpeed,
    /// Set acceleration per motor
    SetAccel,
}

impl Mode {
    /// Every mode the firmware understands.
    pub const ALL: [Mode; 6] = [
        Mode::Run,
        Mode::Stop,
        Mode::Resume,
        Mode::Pause,
        Mode::SetSpeed,
        Mode::SetAccel,
    ];

    /// Wire spelling of the mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Run => "RUN",
            Mode::Stop => "STOP",
            Mode::Resume => "RESUME",
            Mode::Pause => "PAUSE",
            Mode::SetSpeed => "SET_SPEED",
            Mode::SetAccel => "SET_ACCEL",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = CollectorError;

    fn from_str(s: &str) -> AppResult<Self> {
        Mode::ALL
            .iter()
            .copied()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| CollectorError::MalformedFrame(format!("unknown mode '{}'", s)))
    }
}

/// Motor selection, one bit per motor, written as three `0`/`1` characters.
///
/// The three bits cover exactly the eight masks the firmware accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MotorMask([bool; 3]);

impl MotorMask {
    /// All three motors engaged (`111`)
    pub const ALL: MotorMask = MotorMask([true, true, true]);

    /// Build a mask from per-motor flags.
    pub fn new(m1: bool, m2: bool, m3: bool) -> Self {
        Self([m1, m2, m3])
    }

    /// The eight valid masks in wire order.
    pub fn enumerate() -> impl Iterator<Item = MotorMask> {
        (0u8..8).map(|bits| MotorMask([bits & 4 != 0, bits & 2 != 0, bits & 1 != 0]))
    }
}

impl fmt::Display for MotorMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for selected in self.0 {
            f.write_str(if selected { "1" } else { "0" })?;
        }
        Ok(())
    }
}

impl FromStr for MotorMask {
    type Err = CollectorError;

    fn from_str(s: &str) -> AppResult<Self> {
        let bytes = s.as_bytes();
        if bytes.len() != 3 {
            return Err(CollectorError::MalformedFrame(format!("invalid mask '{}'", s)));
        }

        let mut bits = [false; 3];
        for (bit, byte) in bits.iter_mut().zip(bytes) {
            *bit = match byte {
                b'0' => false,
                b'1' => true,
                _ => {
                    return Err(CollectorError::MalformedFrame(format!(
                        "invalid mask '{}'",
                        s
                    )))
                }
            };
        }
        Ok(MotorMask(bits))
    }
}

/// A single command frame, immutable once built.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Command {
    mode: Mode,
    mask: MotorMask,
    args: [f64; 3],
}

impl Command {
    /// Build an arbitrary command.
    pub fn new(mode: Mode, mask: MotorMask, args: [f64; 3]) -> Self {
        Self { mode, mask, args }
    }

    /// Move all three motors to `angle` degrees.
    pub fn run(angle: f64) -> Self {
        Self::new(Mode::Run, MotorMask::ALL, [angle; 3])
    }

    /// Halt all motors: `<STOP,111,0.0,0.0,0.0>`.
    pub fn stop() -> Self {
        Self::new(Mode::Stop, MotorMask::ALL, [0.0; 3])
    }

    /// Same maximum speed on all motors.
    pub fn set_speed(speed: f64) -> Self {
        Self::new(Mode::SetSpeed, MotorMask::ALL, [speed; 3])
    }

    /// Same acceleration on all motors.
    pub fn set_accel(accel: f64) -> Self {
        Self::new(Mode::SetAccel, MotorMask::ALL, [accel; 3])
    }

    /// Commands sent once after the boot banner, in order.
    pub fn setup_sequence() -> [Command; 2] {
        [Command::set_accel(1000.0), Command::set_speed(1000.0)]
    }

    /// Operating mode.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Selected motors.
    pub fn mask(&self) -> MotorMask {
        self.mask
    }

    /// Per-motor arguments, in motor order.
    pub fn args(&self) -> [f64; 3] {
        self.args
    }

    /// Encode to the wire frame, e.g. `<RUN,111,84.0,84.0,84.0>`.
    pub fn encode(&self) -> String {
        let [a, b, c] = self.args;
        format!(
            "<{},{},{},{},{}>",
            self.mode,
            self.mask,
            format_arg(a),
            format_arg(b),
            format_arg(c)
        )
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for Command {
    type Err = CollectorError;

    /// Parse a complete frame, delimiters included.
    fn from_str(s: &str) -> AppResult<Self> {
        let inner = s
            .strip_prefix('<')
            .and_then(|rest| rest.strip_suffix('>'))
            .ok_or_else(|| CollectorError::MalformedFrame(format!("missing delimiters: '{}'", s)))?;

        let fields: Vec<&str> = inner.split(',').collect();
        if fields.len() != 5 {
            return Err(CollectorError::MalformedFrame(format!(
                "expected 5 fields, got {}: '{}'",
                fields.len(),
                s
            )));
        }

        let mode: Mode = fields[0].parse()?;
        let mask: MotorMask = fields[1].parse()?;
        let mut args = [0.0; 3];
        for (arg, field) in args.iter_mut().zip(&fields[2..]) {
            *arg = field.parse().map_err(|_| {
                CollectorError::MalformedFrame(format!("invalid argument '{}'", field))
            })?;
        }

        Ok(Command::new(mode, mask, args))
    }
}

/// Whole numbers keep one decimal so the fixed setup frames read `1000.0`.
fn format_arg(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{:.1}", value)
    } else {
        format!("{}", value)
    }
}
