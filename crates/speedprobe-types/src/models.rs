use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which direction a task is measuring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeedTestMode {
    Download,
    Upload,
    #[default]
    None,
}

impl SpeedTestMode {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Download => 1,
            Self::Upload => 2,
        }
    }

    pub fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Download,
            2 => Self::Upload,
            _ => Self::None,
        }
    }
}

impl fmt::Display for SpeedTestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Download => f.write_str("download"),
            Self::Upload => f.write_str("upload"),
            Self::None => f.write_str("none"),
        }
    }
}

/// How bytes and elapsed time are turned into a rate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputationMethod {
    /// Bytes since the computation window opened over the time since it opened.
    #[default]
    MedianAllTime,
    /// Bytes since the previous report over the time since the previous report.
    MedianInterval,
}

/// FTP data-connection mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FtpMode {
    Active,
    #[default]
    Passive,
}

/// Where upload payloads are generated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStorageType {
    #[default]
    Ram,
    File,
}

/// Decimal rounding applied to computed rates and percentages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundingMode {
    /// Towards positive infinity.
    Ceiling,
    /// Towards zero.
    Down,
    /// Towards negative infinity.
    Floor,
    /// Nearest neighbour, ties to even.
    #[default]
    HalfEven,
    /// Nearest neighbour, ties away from zero.
    HalfUp,
    /// Away from zero.
    Up,
}

impl RoundingMode {
    /// Beyond this many decimal places an f64 has no digits left to round.
    pub const MAX_SCALE: u32 = 15;

    /// Round `value` to `scale` decimal places. Scales above `MAX_SCALE`
    /// round at `MAX_SCALE`.
    pub fn round(self, value: f64, scale: u32) -> f64 {
        if !value.is_finite() {
            return value;
        }
        let factor = 10f64.powi(scale.min(Self::MAX_SCALE) as i32);
        let scaled = value * factor;
        if !scaled.is_finite() {
            return value;
        }
        let rounded = match self {
            Self::Ceiling => scaled.ceil(),
            Self::Down => scaled.trunc(),
            Self::Floor => scaled.floor(),
            Self::HalfEven => scaled.round_ties_even(),
            Self::HalfUp => scaled.round(),
            Self::Up => {
                if scaled.fract() == 0.0 {
                    scaled
                } else {
                    scaled.trunc() + scaled.signum()
                }
            }
        };
        rounded / factor
    }
}

/// Returned when an environment or CLI string names no known variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseModelError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseModelError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

impl FromStr for ComputationMethod {
    type Err = ParseModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all_time" | "median_all_time" | "alltime" => Ok(Self::MedianAllTime),
            "interval" | "median_interval" => Ok(Self::MedianInterval),
            other => Err(ParseModelError::new("computation method", other)),
        }
    }
}

impl FromStr for FtpMode {
    type Err = ParseModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "passive" => Ok(Self::Passive),
            other => Err(ParseModelError::new("ftp mode", other)),
        }
    }
}

impl FromStr for UploadStorageType {
    type Err = ParseModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ram" | "memory" => Ok(Self::Ram),
            "file" => Ok(Self::File),
            other => Err(ParseModelError::new("upload storage", other)),
        }
    }
}

impl FromStr for RoundingMode {
    type Err = ParseModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "ceiling" => Ok(Self::Ceiling),
            "down" => Ok(Self::Down),
            "floor" => Ok(Self::Floor),
            "half_even" => Ok(Self::HalfEven),
            "half_up" => Ok(Self::HalfUp),
            "up" => Ok(Self::Up),
            other => Err(ParseModelError::new("rounding mode", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn huge_scale_stays_finite() {
        assert_eq!(RoundingMode::HalfEven.round(1234.5, 400), 1234.5);
        assert_eq!(RoundingMode::Up.round(0.125, u32::MAX), 0.125);
        // Large values whose scaled form overflows come back unchanged.
        assert_eq!(RoundingMode::HalfUp.round(1e300, 15), 1e300);
    }

    #[test]
        fn rounding_modes() {
        assert_eq!(RoundingMode::HalfEven.round(2.5, 0), 2.0);
        assert_eq!(RoundingMode::HalfEven.round(3.5, 0), 4.0);
        assert_eq!(RoundingMode::HalfUp.round(2.5, 0), 3.0);
        assert_eq!(RoundingMode::Down.round(-1.75, 1), -1.7);
        assert_eq!(RoundingMode::Up.round(1.01, 1), 1.1);
        assert_eq!(RoundingMode::Up.round(-1.01, 1), -1.1);
        assert_eq!(RoundingMode::Floor.round(-1.01, 1), -1.1);
        assert_eq!(RoundingMode::Ceiling.round(1.01, 1), 1.1);
        assert_eq!(RoundingMode::HalfEven.round(1234.5678, 2), 1234.57);
    }

    #[test]
    fn mode_u8_roundtrip() {
        for mode in [SpeedTestMode::Download, SpeedTestMode::Upload, SpeedTestMode::None] {
            assert_eq!(SpeedTestMode::from_u8(mode.as_u8()), mode);
        }
        assert_eq!(SpeedTestMode::from_u8(200), SpeedTestMode::None);
    }

    #[test]
    fn parses_env_strings() {
        assert_eq!("interval".parse::<ComputationMethod>(), Ok(ComputationMethod::MedianInterval));
        assert_eq!("ACTIVE".parse::<FtpMode>(), Ok(FtpMode::Active));
        assert_eq!("file".parse::<UploadStorageType>(), Ok(UploadStorageType::File));
        assert_eq!("half-up".parse::<RoundingMode>(), Ok(RoundingMode::HalfUp));
        assert!("sideways".parse::<FtpMode>().is_err());
    }
}
