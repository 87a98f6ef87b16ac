use std::time::Duration;

/// A Fixed Interval strategy which repeats itself every X duration, forever. Bound it with
/// `take(n)`.
#[derive(Debug, Clone, Copy)]
pub struct Interval {
    interval: Duration,
}

impl Interval {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn from_millis(millis: u64) -> Self {
        Self::new(Duration::from_millis(millis))
    }
}

impl Iterator for Interval {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeats_forever() {
        let mut interval = Interval::from_millis(5);
        for _ in 0..100 {
            assert_eq!(interval.next(), Some(Duration::from_millis(5)));
        }
    }

    #[test]
    fn bounded_by_take() {
        let delays: Vec<_> = Interval::new(Duration::from_secs(1)).take(3).collect();
        assert_eq!(delays, vec![Duration::from_secs(1); 3]);
    }
}
