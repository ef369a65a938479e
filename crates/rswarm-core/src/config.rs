//! Recognized worker configuration surface.
//!
//! This crate never parses CLI args or env vars itself — the embedding
//! binary (e.g. `rswarm-demo`) is responsible for building a
//! [`WorkerConfig`] and handing it to [`crate::runner::Runner::new`].

use std::sync::Arc;
use std::time::Duration;

use crate::error::RswarmError;
use crate::ratelimit::{RampUpRateLimiter, RateLimiter, StableRateLimiter};

/// Default transport/timing constants, matching the protocol's wire
/// contract with the master.
pub const DEFAULT_RECV_TIMEOUT_MS: u64 = 300;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_REPORT_INTERVAL_MS: u64 = 3000;
pub const DEFAULT_MASTER_MISSING_MS: u64 = 60_000;

/// Which rate-limiter variant (if any) shapes aggregate throughput.
#[derive(Debug, Clone, PartialEq)]
pub enum RateLimiterConfig {
    /// No aggregate throttling; every `acquire()` is a no-op that always
    /// grants immediately (workers never call it when this is selected).
    None,
    /// Token bucket refilled to `max_threshold` every `period_ms`.
    Stable { max_threshold: i64, period_ms: u64 },
    /// Token bucket whose ceiling climbs by `ramp_up_step` every
    /// `ramp_up_period_ms`, refilled into the live counter every
    /// `refill_period_ms`.
    RampUp {
        max_threshold: i64,
        ramp_up_step: i64,
        ramp_up_period_ms: u64,
        refill_period_ms: u64,
    },
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        RateLimiterConfig::None
    }
}

impl RateLimiterConfig {
    /// Validate the variant's own fields. Does not know about `max_rps` —
    /// that cross-check lives in [`WorkerConfig::validate`].
    fn validate(&self) -> Result<(), RswarmError> {
        match self {
            RateLimiterConfig::None => Ok(()),
            RateLimiterConfig::Stable { max_threshold, .. } if *max_threshold <= 0 => Err(
                RswarmError::Config("stable rate limiter requires max_threshold > 0".to_string()),
            ),
            RateLimiterConfig::Stable { .. } => Ok(()),
            RateLimiterConfig::RampUp { max_threshold, .. } if *max_threshold <= 0 => {
                Err(RswarmError::Config(
                    "ramp-up rate limiter requires max_threshold > 0".to_string(),
                ))
            }
            RateLimiterConfig::RampUp { ramp_up_step, .. } if *ramp_up_step <= 0 => Err(
                RswarmError::Config("ramp-up rate limiter requires ramp_up_step > 0".to_string()),
            ),
            RateLimiterConfig::RampUp { .. } => Ok(()),
        }
    }

    /// Build the live [`RateLimiter`] this configuration describes, or
    /// `None` if no limiting is configured.
    pub fn build(&self) -> Option<Arc<dyn RateLimiter>> {
        match self {
            RateLimiterConfig::None => None,
            RateLimiterConfig::Stable {
                max_threshold,
                period_ms,
            } => Some(Arc::new(StableRateLimiter::new(
                *max_threshold,
                Duration::from_millis(*period_ms),
            ))),
            RateLimiterConfig::RampUp {
                max_threshold,
                ramp_up_step,
                ramp_up_period_ms,
                refill_period_ms,
            } => Some(Arc::new(RampUpRateLimiter::new(
                *max_threshold,
                *ramp_up_step,
                Duration::from_millis(*ramp_up_period_ms),
                Duration::from_millis(*refill_period_ms),
            ))),
        }
    }
}

/// The full recognized configuration surface for one worker instance.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub master_host: String,
    pub master_port: u16,
    /// Aggregate requests-per-second target; informational unless mirrored
    /// into `rate_limiter` by the embedder (the two are independent knobs
    /// here — this crate does not auto-derive one from the other).
    pub max_rps: Option<f64>,
    pub rate_limiter: RateLimiterConfig,
    pub recv_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub report_interval_ms: u64,
    pub master_missing_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            master_host: "127.0.0.1".to_string(),
            master_port: 5557,
            max_rps: None,
            rate_limiter: RateLimiterConfig::None,
            recv_timeout_ms: DEFAULT_RECV_TIMEOUT_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            report_interval_ms: DEFAULT_REPORT_INTERVAL_MS,
            master_missing_ms: DEFAULT_MASTER_MISSING_MS,
        }
    }
}

impl WorkerConfig {
    /// Fatal at startup: `Runner::new` calls this before spawning anything
    /// so a bad configuration never leaves half-initialized control threads
    /// behind.
    pub fn validate(&self) -> Result<(), RswarmError> {
        if self.master_host.trim().is_empty() {
            return Err(RswarmError::Config("master_host must not be empty".to_string()));
        }
        if self.master_port == 0 {
            return Err(RswarmError::Config("master_port must be nonzero".to_string()));
        }
        if self.recv_timeout_ms == 0 {
            return Err(RswarmError::Config("recv_timeout_ms must be nonzero".to_string()));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(RswarmError::Config(
                "heartbeat_interval_ms must be nonzero".to_string(),
            ));
        }
        if self.report_interval_ms == 0 {
            return Err(RswarmError::Config("report_interval_ms must be nonzero".to_string()));
        }
        if self.master_missing_ms < self.heartbeat_interval_ms {
            return Err(RswarmError::Config(
                "master_missing_ms must be at least heartbeat_interval_ms".to_string(),
            ));
        }
        if let Some(rps) = self.max_rps {
            if rps <= 0.0 {
                return Err(RswarmError::Config("max_rps must be positive when set".to_string()));
            }
        }
        self.rate_limiter.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(WorkerConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_port_is_rejected() {
        let mut cfg = WorkerConfig::default();
        cfg.master_port = 0;
        assert!(matches!(cfg.validate(), Err(RswarmError::Config(_))));
    }

    #[test]
    fn empty_host_is_rejected() {
        let mut cfg = WorkerConfig::default();
        cfg.master_host = "  ".to_string();
        assert!(matches!(cfg.validate(), Err(RswarmError::Config(_))));
    }

    #[test]
    fn master_missing_shorter_than_heartbeat_is_rejected() {
        let mut cfg = WorkerConfig::default();
        cfg.heartbeat_interval_ms = 5000;
        cfg.master_missing_ms = 1000;
        assert!(matches!(cfg.validate(), Err(RswarmError::Config(_))));
    }

    #[test]
    fn stable_limiter_with_zero_threshold_is_rejected() {
        let mut cfg = WorkerConfig::default();
        cfg.rate_limiter = RateLimiterConfig::Stable {
            max_threshold: 0,
            period_ms: 1000,
        };
        assert!(matches!(cfg.validate(), Err(RswarmError::Config(_))));
    }

    #[test]
    fn rampup_limiter_with_zero_step_is_rejected() {
        let mut cfg = WorkerConfig::default();
        cfg.rate_limiter = RateLimiterConfig::RampUp {
            max_threshold: 100,
            ramp_up_step: 0,
            ramp_up_period_ms: 1000,
            refill_period_ms: 1000,
        };
        assert!(matches!(cfg.validate(), Err(RswarmError::Config(_))));
    }

    #[test]
    fn negative_max_rps_is_rejected() {
        let mut cfg = WorkerConfig::default();
        cfg.max_rps = Some(-1.0);
        assert!(matches!(cfg.validate(), Err(RswarmError::Config(_))));
    }

    #[test]
    fn stable_config_builds_a_limiter() {
        let cfg = RateLimiterConfig::Stable {
            max_threshold: 10,
            period_ms: 1000,
        };
        assert!(cfg.build().is_some());
    }

    #[test]
    fn none_config_builds_no_limiter() {
        assert!(RateLimiterConfig::None.build().is_none());
    }
}
