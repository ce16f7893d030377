//! Per-process token-bucket request budget.
//!
//! Independent of single-flight admission: this caps how often clients may
//! even attempt a completion, while admission serializes the UI itself.

use std::time::Instant;

use tokio::sync::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Denied { retry_after_sec: u64 },
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    rpm: u32,
    burst: u32,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    /// `rpm` of zero disables the limiter; callers represent that as the
    /// absence of a limiter rather than constructing one.
    #[must_use]
    pub fn new(rpm: u32, burst: u32) -> Self {
        let burst = burst.max(1);
        Self {
            rpm,
            burst,
            state: Mutex::new(BucketState {
                tokens: f64::from(burst),
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn try_acquire(&self) -> RateDecision {
        let mut state = self.state.lock().await;
        self.decide(&mut state, Instant::now())
    }

    fn refill_per_sec(&self) -> f64 {
        f64::from(self.rpm) / 60.0
    }

    fn decide(&self, state: &mut BucketState, now: Instant) -> RateDecision {
        let elapsed = now.duration_since(state.last_refill);
        state.last_refill = now;
        state.tokens = f64::from(self.burst)
            .min(state.tokens + elapsed.as_secs_f64() * self.refill_per_sec());

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            return RateDecision::Allowed;
        }
        let deficit = 1.0 - state.tokens;
        let retry_after_sec = (deficit / self.refill_per_sec()).ceil().max(1.0) as u64;
        RateDecision::Denied { retry_after_sec }
    }
}
