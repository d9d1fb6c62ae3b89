//! Jittered exponential backoff for the supervisor dial loop.

use std::sync::Mutex;
use std::time::Duration;

/// Backoff parameters. Defaults: 100 ms floor, 60 s ceiling, doubling,
/// ±25% jitter.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub min: Duration,
    pub max: Duration,
    pub factor: f64,
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(100),
            max: Duration::from_secs(60),
            factor: 2.0,
            jitter: 0.25,
        }
    }
}

/// Retry timer with exponential growth and multiplicative jitter. All
/// mutation happens under one lock so concurrent callers see a consistent
/// attempt counter.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: Mutex<u32>,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempt: Mutex::new(0),
        }
    }

    /// Next delay: `min * factor^attempt` clamped to `[min, max]`, then
    /// jittered uniformly in `[1-j, 1+j]` and reclamped. Advances the
    /// attempt counter.
    pub fn duration(&self) -> Duration {
        let mut attempt = self.attempt.lock().unwrap_or_else(|e| e.into_inner());

        let min = self.config.min.as_secs_f64();
        let max = self.config.max.as_secs_f64();

        let base = (min * self.config.factor.powi(*attempt as i32)).clamp(min, max);
        let spread = 1.0 - self.config.jitter + 2.0 * self.config.jitter * rand::random::<f64>();
        let jittered = (base * spread).clamp(min, max);

        *attempt = attempt.saturating_add(1);
        Duration::from_secs_f64(jittered)
    }

    /// Zero the attempt counter. Called on every successful dial.
    pub fn reset(&self) {
        *self.attempt.lock().unwrap_or_else(|e| e.into_inner()) = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}
