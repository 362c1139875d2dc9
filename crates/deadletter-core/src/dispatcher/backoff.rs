//! Spacing between delivery attempts

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Delay applied before a retry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RetryDelay {
    /// Retry immediately
    #[default]
    None,

    /// Same delay before every retry
    Fixed {
        /// Delay before each retry
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },

    /// `initial * multiplier^(retry - 1)`, capped at `max`
    Exponential {
        /// Delay before the first retry
        #[serde(with = "humantime_serde")]
        initial: Duration,
        /// Growth factor per retry
        #[serde(default = "default_multiplier")]
        multiplier: f64,
        /// Upper bound
        #[serde(with = "humantime_serde")]
        max: Duration,
        /// Randomize each delay to between half and the full value
        #[serde(default)]
        jitter: bool,
    },
}

fn default_multiplier() -> f64 {
    2.0
}

impl RetryDelay {
    /// Delay to wait before retry number `retry` (1-based: 1 = the second attempt)
    pub fn delay_for(&self, retry: u32) -> Duration {
        match self {
            Self::None => Duration::ZERO,
            Self::Fixed { delay } => *delay,
            Self::Exponential {
                initial,
                multiplier,
                max,
                jitter,
            } => {
                let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
                let scaled = initial.as_nanos() as f64 * multiplier.powi(exponent);
                let max_nanos = max.as_nanos() as f64;
                let capped = if scaled.is_finite() && scaled < max_nanos {
                    Duration::from_nanos(scaled as u64)
                } else {
                    *max
                };

                if *jitter && !capped.is_zero() {
                    let factor = rand::thread_rng().gen_range(0.5..=1.0);
                    capped.mul_f64(factor)
                } else {
                    capped
                }
            }
        }
    }

    /// Reject nonsensical parameters
    pub fn validate(&self) -> Result<()> {
        if let Self::Exponential {
            initial,
            multiplier,
            max,
            ..
        } = self
        {
            if !multiplier.is_finite() || *multiplier < 1.0 {
                return Err(Error::config(
                    "retry_delay.multiplier must be a finite number >= 1.0",
                ));
            }
            if max < initial {
                return Err(Error::config("retry_delay.max must not be below retry_delay.initial"));
            }
        }
        Ok(())
    }
}
