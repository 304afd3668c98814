//! Exponential moving average of per-unit execution time.

use crate::error::ConfigError;
use std::time::Duration;

/// Default EMA smoothing factor.
pub const DEFAULT_SMOOTHING: f64 = 0.1;

/// Running estimate of how long one unit of work takes, in seconds.
///
/// The first observation is taken verbatim; each later one is blended in as
/// `eta = (1 - p) * eta + p * d`.
#[derive(Debug, Clone, PartialEq)]
pub struct EtaEstimator {
    p: f64,
    eta: Option<f64>,
}

impl EtaEstimator {
    /// Build an estimator with smoothing factor `p`, which must satisfy `0 < p <= 1`.
    pub fn new(p: f64) -> Result<Self, ConfigError> {
        validate_smoothing(p)?;
        Ok(Self { p, eta: None })
    }

    pub fn smoothing(&self) -> f64 {
        self.p
    }

    /// Current estimate, `None` before the first observation.
    pub fn eta(&self) -> Option<f64> {
        self.eta
    }

    pub fn observe(&mut self, elapsed: Duration) -> f64 {
        self.observe_secs(elapsed.as_secs_f64())
    }

    /// Fold one duration (seconds) into the estimate and return the new value.
    pub fn observe_secs(&mut self, d: f64) -> f64 {
        let next = match self.eta {
            None => d,
            Some(eta) => (1.0 - self.p) * eta + self.p * d,
        };
        self.eta = Some(next);
        next
    }
}

impl Default for EtaEstimator {
    fn default() -> Self {
        Self {
            p: DEFAULT_SMOOTHING,
            eta: None,
        }
    }
}

pub(crate) fn validate_smoothing(p: f64) -> Result<(), ConfigError> {
    if p > 0.0 && p <= 1.0 {
        Ok(())
    } else {
        Err(ConfigError::SmoothingFactor(p))
    }
}
