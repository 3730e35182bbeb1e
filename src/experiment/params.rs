//! Run parameters supplied by the operator.

use crate::error::{AppResult, CollectorError};
use crate::timing::{self, FlowUnit, SizeUnit};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What the operator asked for: fraction size, pump flow rate and how many
/// fractions to collect.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RunParameters {
    /// Volume of one fraction
    pub size_value: f64,
    /// Unit of `size_value`
    pub size_unit: SizeUnit,
    /// Pump flow rate
    pub flow_value: f64,
    /// Unit of `flow_value`
    pub flow_unit: FlowUnit,
    /// Last sequence index to visit; the run sends `fraction_count + 1` RUN commands
    pub fraction_count: usize,
}

impl RunParameters {
    /// Bundle the operator's inputs. Nothing is checked until `validate`.
    pub fn new(
        size_value: f64,
        size_unit: SizeUnit,
        flow_value: f64,
        flow_unit: FlowUnit,
        fraction_count: usize,
    ) -> Self {
        Self {
            size_value,
            size_unit,
            flow_value,
            flow_unit,
            fraction_count,
        }
    }

    /// Time spent on each tube before the carousel advances.
    pub fn dwell(&self) -> AppResult<Duration> {
        timing::dwell_time(
            self.size_value,
            self.size_unit,
            self.flow_value,
            self.flow_unit,
        )
    }

    /// Number of RUN frames a complete run sends.
    ///
    /// The run visits positions `0..=fraction_count`, one more than the
    /// requested count.
    pub fn command_count(&self) -> usize {
        self.fraction_count + 1
    }

    /// Check the parameters against a sequence that allows at most
    /// `max_fraction_count` fractions and return the dwell time.
    ///
    /// # Errors
    /// `CollectorError::Validation` for a zero fraction count, a count the angle
    /// table cannot hold, or a non-positive size or flow rate.
    pub fn validate(&self, max_fraction_count: usize) -> AppResult<Duration> {
        if self.fraction_count == 0 {
            return Err(CollectorError::Validation(
                "number of fractions must be at least 1".into(),
            ));
        }
        if self.fraction_count > max_fraction_count {
            return Err(CollectorError::Validation(format!(
                "{} fractions requested but the carousel supports at most {}",
                self.fraction_count, max_fraction_count
            )));
        }
        self.dwell()
    }
}
