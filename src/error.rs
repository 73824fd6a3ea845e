use thiserror::Error;

/// Rejected model parameters. Raised before any replay, prediction run or
/// grid search starts, since a bad value would silently skew every rating
/// derived from it.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("invalid parameter {name} = {value}: {reason}")]
    InvalidParameter {
        name: &'static str,
        value: f64,
        reason: &'static str,
    },

    #[error("invalid range for {name}: min {min} > max {max}")]
    InvertedRange {
        name: &'static str,
        min: f64,
        max: f64,
    },

    #[error("parameter grid axis {0} is empty")]
    EmptyGridAxis(&'static str),

    #[error("unknown sport: {0}")]
    UnknownSport(String),

    #[error("failed to read config file: {0}")]
    Io(String),

    #[error("failed to parse config file: {0}")]
    Parse(String),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Checks a value is finite and inside `[min, max]`.
pub(crate) fn check_range(name: &'static str, value: f64, min: f64, max: f64) -> ConfigResult<()> {
    if !value.is_finite() {
        return Err(ConfigError::InvalidParameter {
            name,
            value,
            reason: "must be finite",
        });
    }
    if value < min {
        return Err(ConfigError::InvalidParameter {
            name,
            value,
            reason: "below allowed minimum",
        });
    }
    if value > max {
        return Err(ConfigError::InvalidParameter {
            name,
            value,
            reason: "above allowed maximum",
        });
    }
    Ok(())
}

pub(crate) fn check_non_negative(name: &'static str, value: f64) -> ConfigResult<()> {
    check_range(name, value, 0.0, f64::MAX)
}

pub(crate) fn check_fraction(name: &'static str, value: f64) -> ConfigResult<()> {
    check_range(name, value, 0.0, 1.0)
}
