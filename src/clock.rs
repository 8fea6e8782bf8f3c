//! # Monotonic timebase and delay strategies.
//!
//! [`Clock`] abstracts `Instant::now()` so delay math is testable without
//! sleeping; [`FakeClock`] is the controllable test double. [`DelayStrategy`]
//! turns an attempt number into a wait duration and is consumed by the retry
//! operation when a payload does not carry an explicit delay.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Source of monotonic time.
pub trait Clock: Send + Sync + 'static {
    /// Returns the current instant.
    fn now(&self) -> Instant;
}

/// Real monotonic clock.
#[derive(Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Controllable clock for tests.
#[derive(Clone)]
pub struct FakeClock {
    current: Arc<Mutex<Instant>>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            current: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Advances the clock by `duration`.
    pub fn advance(&self, duration: Duration) {
        *self.current.lock() += duration;
    }

    /// Pins the clock to a specific instant.
    pub fn set(&self, instant: Instant) {
        *self.current.lock() = instant;
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        *self.current.lock()
    }
}

/// Maps an attempt number to the wait before that attempt runs.
///
/// Attempt numbers are 1-based: the delay before attempt `n + 1` is computed
/// with `attempt = n` (the number of attempts already made).
#[derive(Clone)]
pub enum DelayStrategy {
    /// No wait between attempts.
    Immediate,
    /// Fixed wait between attempts.
    By(Duration),
    /// Wait until the given deadline; zero once the deadline has passed.
    From(Instant),
    /// Geometric backoff: `base * factor^(attempt - 1)`, capped at `max`.
    Exponential {
        base: Duration,
        factor: f64,
        max: Duration,
    },
    /// Arbitrary attempt → duration mapping.
    Custom(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl DelayStrategy {
    /// Exponential backoff with the conventional 30s ceiling.
    pub fn exponential(base: Duration, factor: f64) -> Self {
        DelayStrategy::Exponential {
            base,
            factor,
            max: Duration::from_secs(30),
        }
    }

    /// Computes the wait after `attempt` attempts, relative to `now`.
    pub fn delay_after(&self, attempt: u32, now: Instant) -> Duration {
        match self {
            DelayStrategy::Immediate => Duration::ZERO,
            DelayStrategy::By(d) => *d,
            DelayStrategy::From(deadline) => deadline.saturating_duration_since(now),
            DelayStrategy::Exponential { base, factor, max } => {
                let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                let scaled = base.as_secs_f64() * factor.powi(exponent);
                Duration::from_secs_f64(scaled.min(max.as_secs_f64()))
            }
            DelayStrategy::Custom(f) => f(attempt),
        }
    }
}

impl Default for DelayStrategy {
    fn default() -> Self {
        DelayStrategy::Immediate
    }
}

impl std::fmt::Debug for DelayStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DelayStrategy::Immediate => write!(f, "Immediate"),
            DelayStrategy::By(d) => f.debug_tuple("By").field(d).finish(),
            DelayStrategy::From(at) => f.debug_tuple("From").field(at).finish(),
            DelayStrategy::Exponential { base, factor, max } => f
                .debug_struct("Exponential")
                .field("base", base)
                .field("factor", factor)
                .field("max", max)
                .finish(),
            DelayStrategy::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_advances() {
        let clock = FakeClock::new();
        let start = clock.now();
        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now() - start, Duration::from_secs(5));
    }

    #[test]
    fn immediate_is_zero() {
        let now = Instant::now();
        assert_eq!(DelayStrategy::Immediate.delay_after(3, now), Duration::ZERO);
    }

    #[test]
    fn exponential_grows_and_caps() {
        let now = Instant::now();
        let strategy = DelayStrategy::Exponential {
            base: Duration::from_millis(100),
            factor: 2.0,
            max: Duration::from_millis(350),
        };
        assert_eq!(strategy.delay_after(1, now), Duration::from_millis(100));
        assert_eq!(strategy.delay_after(2, now), Duration::from_millis(200));
        // 400ms capped at 350ms
        assert_eq!(strategy.delay_after(3, now), Duration::from_millis(350));
    }

    #[test]
    fn from_deadline_saturates() {
        let clock = FakeClock::new();
        let deadline = clock.now() + Duration::from_secs(10);
        let strategy = DelayStrategy::From(deadline);
        assert_eq!(strategy.delay_after(1, clock.now()), Duration::from_secs(10));
        clock.advance(Duration::from_secs(30));
        assert_eq!(strategy.delay_after(2, clock.now()), Duration::ZERO);
    }

    #[test]
    fn custom_maps_attempts() {
        let now = Instant::now();
        let strategy = DelayStrategy::Custom(Arc::new(|n| Duration::from_millis(u64::from(n) * 10)));
        assert_eq!(strategy.delay_after(4, now), Duration::from_millis(40));
    }
}
