use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// How long to wait between attempts to get the broker back.
///
/// The interval is fixed; retries never give up. An optional jitter fraction
/// spreads the retries of many processes restarting at once.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    delay: Duration,
    jitter: f64,
}

impl ReconnectPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self { delay, jitter: 0.0 }
    }

    /// `jitter` is clamped to `[0, 1)`.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = if jitter.is_finite() {
            jitter.clamp(0.0, 0.99)
        } else {
            0.0
        };
        self
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn next_delay(&self) -> Duration {
        if self.jitter == 0.0 {
            return self.delay;
        }
        let spread = (rand::random::<f64>() * 2.0 - 1.0) * self.jitter;
        self.delay.mul_f64(1.0 + spread)
    }

    /// Sleep for the next delay. Returns false if `shutdown` fired first.
    pub async fn pause(&self, shutdown: &CancellationToken) -> bool {
        Self::sleep(self.next_delay(), shutdown).await
    }

    /// Sleep for `delay` unless `shutdown` fires first.
    pub async fn sleep(delay: Duration, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(5))
    }
}
