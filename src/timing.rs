//! Unit conversions and dwell-time arithmetic.
//!
//! All conversions are multiplicative factors into a common base unit:
//! flow rates into µL/hour, volumes and fraction sizes into µL, times into hours.
//! The dwell time is how long one fraction takes to fill at the given flow rate,
//! and therefore how long the collector waits before moving to the next tube.
//!
//! Besides the dwell time, this module carries the run-planning arithmetic used
//! to derive total volume, total time, fraction count and fraction size from
//! each other.

use crate::error::{AppResult, CollectorError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

const SECONDS_PER_HOUR: f64 = 3600.0;

/// Longest dwell a run accepts: one year per tube.
pub const MAX_DWELL: Duration = Duration::from_secs(365 * 24 * 3600);

/// Flow-rate unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowUnit {
    /// uL/sec
    #[serde(rename = "uL/sec")]
    MicrolitresPerSecond,
    /// uL/min
    #[serde(rename = "uL/min")]
    MicrolitresPerMinute,
    /// uL/hr, the base unit
    #[serde(rename = "uL/hr")]
    MicrolitresPerHour,
    /// mL/sec
    #[serde(rename = "mL/sec")]
    MillilitresPerSecond,
    /// mL/min
    #[serde(rename = "mL/min")]
    MillilitresPerMinute,
    /// mL/hr
    #[serde(rename = "mL/hr")]
    MillilitresPerHour,
}

impl FlowUnit {
    /// All flow units, slowest base first.
    pub const ALL: [FlowUnit; 6] = [
        FlowUnit::MicrolitresPerSecond,
        FlowUnit::MicrolitresPerMinute,
        FlowUnit::MicrolitresPerHour,
        FlowUnit::MillilitresPerSecond,
        FlowUnit::MillilitresPerMinute,
        FlowUnit::MillilitresPerHour,
    ];

    /// Factor converting a value in this unit to µL/hour.
    pub fn to_ul_per_hour(&self) -> f64 {
        match self {
            FlowUnit::MicrolitresPerSecond => 3600.0,
            FlowUnit::MicrolitresPerMinute => 60.0,
            FlowUnit::MicrolitresPerHour => 1.0,
            FlowUnit::MillilitresPerSecond => 3_600_000.0,
            FlowUnit::MillilitresPerMinute => 60_000.0,
            FlowUnit::MillilitresPerHour => 1000.0,
        }
    }

    /// Spelling used on the command line and in config files.
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowUnit::MicrolitresPerSecond => "uL/sec",
            FlowUnit::MicrolitresPerMinute => "uL/min",
            FlowUnit::MicrolitresPerHour => "uL/hr",
            FlowUnit::MillilitresPerSecond => "mL/sec",
            FlowUnit::MillilitresPerMinute => "mL/min",
            FlowUnit::MillilitresPerHour => "mL/hr",
        }
    }
}

/// Total-volume unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumeUnit {
    /// uL, the base unit
    #[serde(rename = "uL")]
    Microlitres,
    /// mL
    #[serde(rename = "mL")]
    Millilitres,
    /// L
    #[serde(rename = "L")]
    Litres,
}

impl VolumeUnit {
    /// All volume units, smallest first.
    pub const ALL: [VolumeUnit; 3] = [
        VolumeUnit::Microlitres,
        VolumeUnit::Millilitres,
        VolumeUnit::Litres,
    ];

    /// Factor converting a value in this unit to µL.
    pub fn to_ul(&self) -> f64 {
        match self {
            VolumeUnit::Microlitres => 1.0,
            VolumeUnit::Millilitres => 1000.0,
            VolumeUnit::Litres => 1_000_000.0,
        }
    }

    /// Spelling used on the command line and in config files.
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeUnit::Microlitres => "uL",
            VolumeUnit::Millilitres => "mL",
            VolumeUnit::Litres => "L",
        }
    }
}

/// Fraction-size unit. Fractions are never specified in litres.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SizeUnit {
    /// uL
    #[serde(rename = "uL")]
    Microlitres,
    /// mL
    #[serde(rename = "mL")]
    Millilitres,
}

impl SizeUnit {
    /// Both fraction-size units.
    pub const ALL: [SizeUnit; 2] = [SizeUnit::Microlitres, SizeUnit::Millilitres];

    /// Factor converting a value in this unit to µL.
    pub fn to_ul(&self) -> f64 {
        match self {
            SizeUnit::Microlitres => 1.0,
            SizeUnit::Millilitres => 1000.0,
        }
    }

    /// Spelling used on the command line and in config files.
    pub fn as_str(&self) -> &'static str {
        match self {
            SizeUnit::Microlitres => "uL",
            SizeUnit::Millilitres => "mL",
        }
    }
}

/// Time unit used by the run planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeUnit {
    /// sec
    #[serde(rename = "sec")]
    Seconds,
    /// min
    #[serde(rename = "min")]
    Minutes,
    /// hr
    #[serde(rename = "hr")]
    Hours,
}

impl TimeUnit {
    /// All time units, shortest first.
    pub const ALL: [TimeUnit; 3] = [TimeUnit::Seconds, TimeUnit::Minutes, TimeUnit::Hours];

    /// Number of this unit in one hour.
    pub fn per_hour(&self) -> f64 {
        match self {
            TimeUnit::Seconds => 3600.0,
            TimeUnit::Minutes => 60.0,
            TimeUnit::Hours => 1.0,
        }
    }

    /// Spelling used on the command line and in config files.
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeUnit::Seconds => "sec",
            TimeUnit::Minutes => "min",
            TimeUnit::Hours => "hr",
        }
    }
}

macro_rules! unit_text {
    ($($unit:ty => $label:literal),+ $(,)?) => {
        $(
            impl fmt::Display for $unit {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(self.as_str())
                }
            }

            impl FromStr for $unit {
                type Err = CollectorError;

                fn from_str(s: &str) -> AppResult<Self> {
                    <$unit>::ALL
                        .iter()
                        .copied()
                        .find(|unit| unit.as_str() == s)
                        .ok_or_else(|| {
                            let valid: Vec<&str> = <$unit>::ALL.iter().map(|u| u.as_str()).collect();
                            CollectorError::Validation(format!(
                                "unknown {} unit '{}'. Must be one of: {}",
                                $label,
                                s,
                                valid.join(", ")
                            ))
                        })
                }
            }
        )+
    };
}

unit_text! {
    FlowUnit => "flow rate",
    VolumeUnit => "volume",
    SizeUnit => "fraction size",
    TimeUnit => "time",
}

fn require_positive(value: f64, what: &str) -> AppResult<f64> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(CollectorError::Validation(format!(
            "{} must be a positive number, got {}",
            what, value
        )))
    }
}

fn require_non_negative(value: f64, what: &str) -> AppResult<f64> {
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(CollectorError::Validation(format!(
            "{} must be zero or positive, got {}",
            what, value
        )))
    }
}

/// Seconds needed to collect one fraction of `size_value` at `flow_value`.
///
/// `seconds = size_uL / flow_uL_per_hr * 3600`. Non-positive or non-finite flow
/// rates and fraction sizes are rejected instead of yielding an infinite or
/// negative dwell.
pub fn dwell_seconds(
    size_value: f64,
    size_unit: SizeUnit,
    flow_value: f64,
    flow_unit: FlowUnit,
) -> AppResult<f64> {
    let flow = require_positive(flow_value, "flow rate")? * flow_unit.to_ul_per_hour();
    let size = require_positive(size_value, "fraction size")? * size_unit.to_ul();
    Ok(size / flow * SECONDS_PER_HOUR)
}

/// [`dwell_seconds`] as a `Duration`, capped at [`MAX_DWELL`].
pub fn dwell_time(
    size_value: f64,
    size_unit: SizeUnit,
    flow_value: f64,
    flow_unit: FlowUnit,
) -> AppResult<Duration> {
    let seconds = dwell_seconds(size_value, size_unit, flow_value, flow_unit)?;
    let dwell = Duration::try_from_secs_f64(seconds).map_err(|e| {
        CollectorError::Validation(format!("dwell time of {}s is not representable: {}", seconds, e))
    })?;
    if dwell > MAX_DWELL {
        return Err(CollectorError::Validation(format!(
            "dwell time of {}s exceeds the {}s limit; raise the flow rate or shrink the fractions",
            seconds,
            MAX_DWELL.as_secs()
        )));
    }
    Ok(dwell)
}

/// Volume collected over `time` at `flow`, expressed in `out_unit`.
pub fn volume_from_time(
    flow_value: f64,
    flow_unit: FlowUnit,
    time_value: f64,
    time_unit: TimeUnit,
    out_unit: VolumeUnit,
) -> AppResult<f64> {
    let flow = require_positive(flow_value, "flow rate")? * flow_unit.to_ul_per_hour();
    let hours = require_non_negative(time_value, "total time")? / time_unit.per_hour();
    Ok(hours * flow / out_unit.to_ul())
}

/// Time needed to collect `volume` at `flow`, expressed in `out_unit`.
pub fn time_from_volume(
    flow_value: f64,
    flow_unit: FlowUnit,
    volume_value: f64,
    volume_unit: VolumeUnit,
    out_unit: TimeUnit,
) -> AppResult<f64> {
    let flow = require_positive(flow_value, "flow rate")? * flow_unit.to_ul_per_hour();
    let volume = require_non_negative(volume_value, "total volume")? * volume_unit.to_ul();
    Ok(volume / flow * out_unit.per_hour())
}

/// How many fractions of `size` fit into `total_volume`. Not rounded.
pub fn fraction_count(
    total_volume: f64,
    volume_unit: VolumeUnit,
    size_value: f64,
    size_unit: SizeUnit,
) -> AppResult<f64> {
    let volume = require_non_negative(total_volume, "total volume")? * volume_unit.to_ul();
    let size = require_positive(size_value, "fraction size")? * size_unit.to_ul();
    Ok(volume / size)
}

/// Size of each of `count` fractions of `total_volume`, expressed in `out_unit`.
pub fn fraction_size(
    total_volume: f64,
    volume_unit: VolumeUnit,
    count: f64,
    out_unit: SizeUnit,
) -> AppResult<f64> {
    let volume = require_non_negative(total_volume, "total volume")? * volume_unit.to_ul();
    let count = require_positive(count, "number of fractions")?;
    Ok(volume / count / out_unit.to_ul())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9 * b.abs().max(1.0)
    }

    #[test]
    fn dwell_for_two_hour_fraction() {
        let secs = dwell_seconds(1000.0, SizeUnit::Microlitres, 500.0, FlowUnit::MicrolitresPerHour)
            .unwrap();
        assert_eq!(secs, 7200.0);
    }

    #[test]
    fn dwell_mixed_units() {
        // 1 mL at 30 mL/hr -> 2 minutes
        let dwell = dwell_time(1.0, SizeUnit::Millilitres, 30.0, FlowUnit::MillilitresPerHour)
            .unwrap();
        assert!(approx(dwell.as_secs_f64(), 120.0));

        // 500 uL at 1 mL/min -> 30 s
        let secs = dwell_seconds(500.0, SizeUnit::Microlitres, 1.0, FlowUnit::MillilitresPerMinute)
            .unwrap();
        assert!(approx(secs, 30.0));
    }

    #[test]
    fn dwell_rejects_non_positive_flow() {
        for flow in [0.0, -5.0, f64::NAN, f64::INFINITY] {
            let err = dwell_seconds(100.0, SizeUnit::Microlitres, flow, FlowUnit::MicrolitresPerHour)
                .unwrap_err();
            assert!(matches!(err, CollectorError::Validation(_)), "flow {}", flow);
        }
    }

    #[test]
    fn dwell_rejects_non_positive_size() {
        let err = dwell_seconds(0.0, SizeUnit::Millilitres, 1.0, FlowUnit::MillilitresPerHour)
            .unwrap_err();
        assert!(matches!(err, CollectorError::Validation(_)));
    }

    #[test]
    fn dwell_rejects_vanishing_flow() {
        // 1 mL at 3e-13 uL/hr would be a 1.2e19 s wait.
        let err = dwell_time(1000.0, SizeUnit::Microlitres, 3e-13, FlowUnit::MicrolitresPerHour)
            .unwrap_err();
        assert!(matches!(err, CollectorError::Validation(_)), "{}", err);

        // Slow but plausible: 1 mL at 1 uL/hr is about six weeks per tube.
        let dwell = dwell_time(1.0, SizeUnit::Millilitres, 1.0, FlowUnit::MicrolitresPerHour)
            .unwrap();
        assert_eq!(dwell, Duration::from_secs(3_600_000));
        assert!(dwell < MAX_DWELL);
    }

    #[test]
    fn conversion_tables() {
        assert_eq!(FlowUnit::MillilitresPerSecond.to_ul_per_hour(), 3_600_000.0);
        assert_eq!(FlowUnit::MicrolitresPerMinute.to_ul_per_hour(), 60.0);
        assert_eq!(VolumeUnit::Litres.to_ul(), 1_000_000.0);
        assert_eq!(SizeUnit::Millilitres.to_ul(), 1000.0);
    }

    #[test]
    fn parses_wire_spelling() {
        assert_eq!("uL/min".parse::<FlowUnit>().unwrap(), FlowUnit::MicrolitresPerMinute);
        assert_eq!("mL".parse::<SizeUnit>().unwrap(), SizeUnit::Millilitres);
        assert_eq!("L".parse::<VolumeUnit>().unwrap(), VolumeUnit::Litres);
        assert_eq!("hr".parse::<TimeUnit>().unwrap(), TimeUnit::Hours);
        assert!("L".parse::<SizeUnit>().is_err());
        assert!("ml/hr".parse::<FlowUnit>().is_err());
        assert_eq!(FlowUnit::MillilitresPerHour.to_string(), "mL/hr");
    }

    #[test]
    fn volume_and_time_are_inverse() {
        // 2 hours at 30 mL/hr -> 60 mL
        let vol = volume_from_time(30.0, FlowUnit::MillilitresPerHour, 2.0, TimeUnit::Hours, VolumeUnit::Millilitres)
            .unwrap();
        assert!(approx(vol, 60.0));

        let time = time_from_volume(30.0, FlowUnit::MillilitresPerHour, 60.0, VolumeUnit::Millilitres, TimeUnit::Minutes)
            .unwrap();
        assert!(approx(time, 120.0));

        // 90 sec at 1 uL/sec -> 90 uL
        let vol = volume_from_time(1.0, FlowUnit::MicrolitresPerSecond, 90.0, TimeUnit::Seconds, VolumeUnit::Microlitres)
            .unwrap();
        assert!(approx(vol, 90.0));
    }

    #[test]
    fn fraction_count_and_size() {
        let count = fraction_count(20.0, VolumeUnit::Millilitres, 500.0, SizeUnit::Microlitres).unwrap();
        assert!(approx(count, 40.0));

        let size = fraction_size(20.0, VolumeUnit::Millilitres, 40.0, SizeUnit::Millilitres).unwrap();
        assert!(approx(size, 0.5));

        assert!(fraction_size(20.0, VolumeUnit::Millilitres, 0.0, SizeUnit::Millilitres).is_err());
        assert!(fraction_count(20.0, VolumeUnit::Millilitres, 0.0, SizeUnit::Microlitres).is_err());
    }

    #[test]
    fn units_roundtrip_through_serde_names() {
        let text = toml::to_string(&std::collections::BTreeMap::from([(
            "unit",
            FlowUnit::MicrolitresPerHour,
        )]))
        .unwrap();
        assert_eq!(text.trim(), "unit = \"uL/hr\"");
    }
}
