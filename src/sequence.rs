//! Tube angle table and the RUN sequence derived from it.

use crate::error::{AppResult, CollectorError};
use crate::protocol::Command;
use std::path::Path;

const BUILTIN_ANGLES: &str = include_str!("../data/angles.txt");

/// Ordered carousel angles, one per tube.
///
/// The table is loaded once at startup. Its length bounds how many fractions a
/// run may request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AngleTable {
    angles: Vec<i32>,
}

impl AngleTable {
    /// Build a table from explicit angles.
    pub fn new(angles: Vec<i32>) -> AppResult<Self> {
        if angles.is_empty() {
            return Err(CollectorError::Validation(
                "angle table must contain at least one angle".into(),
            ));
        }
        Ok(Self { angles })
    }

    /// Parse the text format: one integer per line, `#` comments and blank lines
    /// ignored.
    pub fn parse(text: &str) -> AppResult<Self> {
        let mut angles = Vec::new();
        for (index, line) in text.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let angle = trimmed.parse::<i32>().map_err(|e| {
                CollectorError::Validation(format!(
                    "angle table line {}: '{}' is not an integer angle ({})",
                    index + 1,
                    trimmed,
                    e
                ))
            })?;
            angles.push(angle);
        }
        Self::new(angles)
    }

    /// Read and parse an angle file.
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let table = Self::parse(&text)?;
        tracing::debug!(
            path = %path.as_ref().display(),
            slots = table.len(),
            "Loaded angle table"
        );
        Ok(table)
    }

    /// Slot angles in degrees, in visiting order.
    pub fn angles(&self) -> &[i32] {
        &self.angles
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.angles.len()
    }

    /// True for a table without slots.
    pub fn is_empty(&self) -> bool {
        self.angles.is_empty()
    }

    /// Largest fraction count a run may request.
    ///
    /// The run loop visits positions `0..=fraction_count`, so one slot is
    /// reserved beyond the requested count.
    pub fn max_fraction_count(&self) -> usize {
        self.angles.len().saturating_sub(1)
    }
}

impl Default for AngleTable {
    fn default() -> Self {
        let angles = BUILTIN_ANGLES
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| line.parse().ok())
            .collect();
        Self { angles }
    }
}

/// One RUN command per table slot: all three motors, each to the slot's angle.
pub fn build_sequence(table: &AngleTable) -> Vec<Command> {
    table
        .angles()
        .iter()
        .map(|&angle| Command::run(f64::from(angle)))
        .collect()
}
