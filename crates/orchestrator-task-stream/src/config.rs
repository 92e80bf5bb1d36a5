use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::StreamError;

/// Delay policy between feed reconnect attempts.
///
/// The default is a constant 3s delay. `exponential` grows the delay per
/// consecutive failure up to `max_delay_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect after a failure or close.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Multiplier per consecutive failure. `1.0` keeps the delay fixed.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Upper bound for computed delay.
    #[serde(default = "default_initial_delay_ms")]
    pub max_delay_ms: u64,
}

const fn default_initial_delay_ms() -> u64 {
    3_000
}

const fn default_backoff_factor() -> f64 {
    1.0
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::fixed(default_initial_delay_ms())
    }
}

impl ReconnectPolicy {
    pub const fn fixed(delay_ms: u64) -> Self {
        Self {
            initial_delay_ms: delay_ms,
            backoff_factor: 1.0,
            max_delay_ms: delay_ms,
        }
    }

    pub fn exponential(initial_delay_ms: u64, backoff_factor: f64) -> Self {
        let factor = if backoff_factor < 1.0 {
            default_backoff_factor()
        } else {
            backoff_factor
        };
        Self {
            initial_delay_ms,
            backoff_factor: factor,
            max_delay_ms: 30_000.max(initial_delay_ms),
        }
    }

    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms.max(self.initial_delay_ms);
        self
    }

    /// Delay before the next attempt after `consecutive_failures` failed or
    /// closed connections (`0` for the first).
    pub fn delay_for(&self, consecutive_failures: u32) -> Duration {
        let exp = self
            .backoff_factor
            .powi(consecutive_failures.min(i32::MAX as u32) as i32);
        let base = (self.initial_delay_ms as f64 * exp).round();
        let clamped = if base.is_finite() {
            (base as u64).min(self.max_delay_ms)
        } else {
            self.max_delay_ms
        };
        Duration::from_millis(clamped)
    }
}

/// Runtime settings for a task session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Feed reconnect delays.
    pub reconnect: ReconnectPolicy,
    /// Quiet period before a requested authoritative refetch runs.
    pub refetch_debounce: Duration,
    /// Periodic authoritative refetch. `None` disables it.
    pub refetch_interval: Option<Duration>,
    /// Bounded buffer size for internal event channels.
    pub channel_capacity: usize,
    /// Upper bound for one per-call stream.
    pub send_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            refetch_debounce: Duration::from_millis(500),
            refetch_interval: Some(Duration::from_secs(30)),
            channel_capacity: 128,
            send_timeout: Duration::from_secs(60),
        }
    }
}

impl StreamConfig {
    /// Builds a config from `TASK_STREAM_*` variables on top of the defaults.
    ///
    /// - `TASK_STREAM_RECONNECT_DELAY_MS`: fixed reconnect delay.
    /// - `TASK_STREAM_REFETCH_DEBOUNCE_MS`: refetch debounce window.
    /// - `TASK_STREAM_REFETCH_INTERVAL_MS`: periodic refetch (`0` disables).
    /// - `TASK_STREAM_CHANNEL_CAPACITY`: internal channel size.
    /// - `TASK_STREAM_SEND_TIMEOUT_MS`: per-call stream timeout.
    pub fn from_env() -> Result<Self, StreamError> {
        let mut config = Self::default();
        if let Some(ms) = env_u64("TASK_STREAM_RECONNECT_DELAY_MS")? {
            config.reconnect = ReconnectPolicy::fixed(ms);
        }
        if let Some(ms) = env_u64("TASK_STREAM_REFETCH_DEBOUNCE_MS")? {
            config.refetch_debounce = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("TASK_STREAM_REFETCH_INTERVAL_MS")? {
            config.refetch_interval = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(capacity) = env_u64("TASK_STREAM_CHANNEL_CAPACITY")? {
            config.channel_capacity = usize::try_from(capacity).map_err(|_| {
                StreamError::Config("TASK_STREAM_CHANNEL_CAPACITY is out of range".into())
            })?;
        }
        if let Some(ms) = env_u64("TASK_STREAM_SEND_TIMEOUT_MS")? {
            config.send_timeout = Duration::from_millis(ms);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn refetch_debounce(mut self, debounce: Duration) -> Self {
        self.refetch_debounce = debounce;
        self
    }

    pub fn refetch_interval(mut self, interval: Option<Duration>) -> Self {
        self.refetch_interval = interval;
        self
    }

    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), StreamError> {
        if self.channel_capacity == 0 {
            return Err(StreamError::Config(
                "channel_capacity must be greater than 0".into(),
            ));
        }
        if self.send_timeout.is_zero() {
            return Err(StreamError::Config(
                "send_timeout must be greater than 0".into(),
            ));
        }
        if self.refetch_interval.is_some_and(|interval| interval.is_zero()) {
            return Err(StreamError::Config(
                "refetch_interval must be greater than 0 when set".into(),
            ));
        }
        Ok(())
    }
}

fn env_u64(key: &str) -> Result<Option<u64>, StreamError> {
    match std::env::var(key) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| StreamError::Config(format!("invalid {key}: {e}"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_fixed_three_seconds() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(3));
        assert_eq!(policy.delay_for(10), Duration::from_secs(3));
    }

    #[test]
    fn exponential_policy_grows_with_cap() {
        let policy = ReconnectPolicy::exponential(100, 2.0).with_max_delay_ms(250);
        assert_eq!(policy.delay_for(0).as_millis(), 100);
        assert_eq!(policy.delay_for(1).as_millis(), 200);
        assert_eq!(policy.delay_for(2).as_millis(), 250);
        assert_eq!(policy.delay_for(u32::MAX).as_millis(), 250);
    }

    #[test]
    fn validate_rejects_zero_capacity() {
        let err = StreamConfig::default()
            .channel_capacity(0)
            .validate()
            .expect_err("zero capacity");
        assert!(matches!(err, StreamError::Config(msg) if msg.contains("channel_capacity")));
    }

    #[test]
    fn validate_rejects_zero_interval() {
        let err = StreamConfig::default()
            .refetch_interval(Some(Duration::ZERO))
            .validate()
            .expect_err("zero interval");
        assert!(matches!(err, StreamError::Config(_)));
    }
}
