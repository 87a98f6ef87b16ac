//! Retry with backoff for async Rust.
//!
//! An [`Operation`] produces a fresh Future on every attempt. When the Future resolves to an error
//! that the [`Condition`] deems transient, [`retry::Retry`] cools off for the next duration handed
//! out by the backoff [`strategy`] and runs the operation again. When the strategy runs dry, the
//! last error is returned to the caller, which is how a bounded number of attempts is expressed.
//!
//! ```rust
//! use backoff::retry::Retry;
//! use backoff::strategy::fixed;
//!
//! async fn put_object() -> Result<u64, String> {
//!     Ok(42)
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let interval = fixed::Interval::from_millis(1).take(3);
//!     let written = Retry::new(interval, put_object, |_: &String| true).await;
//!     assert_eq!(written, Ok(42));
//! }
//! ```

use std::future::Future;

/// strategy has the backoff strategies. Each one is an iterator with Item=Duration, so the number
/// of retries is bounded with [`take`](https://doc.rust-lang.org/std/iter/struct.Take.html) or by
/// the strategy itself.
pub mod strategy;

/// Conditional retry till we run out of backoff.
pub mod retry;

/// The retry condition depends on the result of [`Condition::can_retry`].
/// [`Condition::can_retry`] returns `true` to keep retrying or `false` to give up immediately.
pub trait Condition<E> {
    fn can_retry(&self, error: &E) -> bool;
}

/// Any `Fn(&E) -> bool` is a condition.
impl<E, F> Condition<E> for F
where
    F: Fn(&E) -> bool,
{
    fn can_retry(&self, error: &E) -> bool {
        self(error)
    }
}

/// An `Operation` is anything that returns a Future when executed and that
/// Future can be run to completion.
pub trait Operation {
    type Item;
    type Error;
    /// The [`Future`] returned when the Operation is called.
    type Future: Future<Output = Result<Self::Item, Self::Error>>;

    #[must_use = "futures do nothing unless you `.await` or poll them"]
    fn run(&mut self) -> Self::Future;
}

/// [`FnMut`] closures returning a [`Future`] of a [`Result`] are operations.
impl<T, E, R, F> Operation for F
where
    R: Future<Output = Result<T, E>>,
    F: FnMut() -> R,
{
    type Item = T;
    type Error = E;
    type Future = R;

    fn run(&mut self) -> Self::Future {
        self()
    }
}
