use std::time::Duration;

use rand::Rng;

/// Exponential backoff: the n-th retry waits `base * factor^(n - 1)`, randomized by `jitter` and
/// capped at `max`. Yields at most `max_attempts` delays when set, unbounded otherwise.
///
/// ```
/// use backoff::strategy::exponential::Exponential;
/// use std::time::Duration;
///
/// let delays: Vec<_> = Exponential::new(Duration::from_millis(100), Duration::from_secs(1))
///     .with_max_attempts(4)
///     .collect();
/// assert_eq!(
///     delays,
///     vec![
///         Duration::from_millis(100),
///         Duration::from_millis(200),
///         Duration::from_millis(400),
///         Duration::from_millis(800),
///     ]
/// );
/// ```
#[derive(Debug, Clone)]
pub struct Exponential {
    base: Duration,
    max: Duration,
    factor: f64,
    /// between 0.0 and 1.0, the delay is scaled by a random value in `[1 - jitter, 1 + jitter]`.
    jitter: f64,
    max_attempts: Option<usize>,
    attempt: usize,
}

impl Exponential {
    /// Doubles the delay on every attempt, no jitter, unbounded.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            factor: 2.0,
            jitter: 0.0,
            max_attempts: None,
            attempt: 0,
        }
    }

    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor.max(1.0);
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Number of delays handed out so far.
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    fn delay(&self, attempt: usize) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let mut millis = self.base.as_millis() as f64 * self.factor.powi(exponent);
        if self.jitter > 0.0 {
            millis *= rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter);
        }
        if !millis.is_finite() {
            return self.max;
        }
        Duration::from_millis(millis as u64).min(self.max)
    }
}

impl Iterator for Exponential {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(max_attempts) = self.max_attempts
            && self.attempt >= max_attempts
        {
            return None;
        }
        self.attempt += 1;
        Some(self.delay(self.attempt))
    }
}
