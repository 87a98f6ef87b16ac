/// Retries at a constant interval.
pub mod fixed;

/// Retries with an exponentially growing, optionally jittered, interval.
pub mod exponential;
