//! Allowance-based pacing shared by the socket and push transports.
//!
//! The allowance refills at `rate` per second and is capped at `rate`, so short
//! bursts up to `rate` messages pass immediately. Once the allowance drops
//! below one message the caller sleeps for the missing fraction and the
//! allowance restarts from zero.

use tokio::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct RateLimiter {
    rate: f64,
    allowance: f64,
    last_tick: Instant,
}

impl RateLimiter {
    /// `rate` is in messages per second and must be positive.
    pub fn per_second(rate: f64) -> Self {
        debug_assert!(rate > 0.0 && rate.is_finite(), "rate must be positive");
        Self {
            rate,
            allowance: rate,
            last_tick: Instant::now(),
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Wait until one more message may pass.
    ///
    /// Returns how long the caller was suspended, or `None` when the message
    /// went through immediately.
    pub async fn acquire(&mut self) -> Option<Duration> {
        let wait = self.reserve()?;
        tokio::time::sleep(wait).await;
        Some(wait)
    }

    fn reserve(&mut self) -> Option<Duration> {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_tick).as_secs_f64();
        self.last_tick = now;
        self.allowance = (self.allowance + elapsed * self.rate).min(self.rate);

        if self.allowance < 1.0 {
            let wait = (1.0 - self.allowance) / self.rate;
            self.allowance = 0.0;
            Some(Duration::from_secs_f64(wait))
        } else {
            self.allowance -= 1.0;
            None
        }
    }
}
