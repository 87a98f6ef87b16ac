use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use pin_project::pin_project;
use tokio::time::{Instant, Sleep, sleep_until};
use tracing::warn;

use crate::{Condition, Operation};

/// A retry is either running the [`Operation`] or sleeping off the interval the strategy handed
/// out after a transient failure:
/// ```text
///             +--> Ok ---------------------------------> Ready(Ok)
///             |
/// Running(op) +--> Err, can't retry -------------------> Ready(Err)
///             |
///             +--> Err, can retry --> backoff.next()
///                                        |
///                                        +--> None ----> Ready(Err)
///                                        |
///                                        +--> Some(d) -> Sleeping(d) --> Running(op)
/// ```
#[pin_project(project = RetryStateProj)]
enum RetryState<O>
where
    O: Operation,
{
    Running(#[pin] O::Future),
    Sleeping(#[pin] Sleep),
}

/// Retry retries an operation based on the backoff strategy.
#[pin_project]
pub struct Retry<I, O, C>
where
    O: Operation,
{
    #[pin]
    retry_state: RetryState<O>,
    backoff: I,
    operation: O,
    condition: C,
    /// number of times the operation has been started, including the first run.
    attempts: usize,
}

impl<I, O, C> Retry<I, O, C>
where
    I: Iterator<Item = Duration>,
    O: Operation,
    O::Error: Debug,
    C: Condition<O::Error>,
{
    pub fn new<II: IntoIterator<IntoIter = I, Item = I::Item>>(
        backoff: II,
        mut operation: O,
        condition: C,
    ) -> Self {
        Self {
            retry_state: RetryState::Running(operation.run()),
            backoff: backoff.into_iter(),
            condition,
            operation,
            attempts: 1,
        }
    }

    /// parks the retry in the sleeping state for the next backoff interval, or hands the error
    /// back when the strategy is exhausted.
    fn cool_off(mut self: Pin<&mut Self>, err: O::Error) -> Result<(), O::Error> {
        let mut this = self.as_mut().project();
        match this.backoff.next() {
            None => Err(err),
            Some(duration) => {
                warn!(
                    attempt = *this.attempts,
                    backoff = ?duration,
                    error = ?err,
                    "Operation failed, retrying after backoff"
                );
                this.retry_state
                    .set(RetryState::Sleeping(sleep_until(Instant::now() + duration)));
                Ok(())
            }
        }
    }

    fn reattempt(mut self: Pin<&mut Self>) {
        let mut this = self.as_mut().project();
        *this.attempts += 1;
        let future = this.operation.run();
        this.retry_state.set(RetryState::Running(future));
    }
}

impl<I, O, C> Future for Retry<I, O, C>
where
    I: Iterator<Item = Duration>,
    O: Operation,
    O::Error: Debug,
    C: Condition<O::Error>,
{
    type Output = Result<O::Item, O::Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        loop {
            match self.as_mut().project().retry_state.project() {
                RetryStateProj::Running(op) => match op.poll(cx) {
                    Poll::Ready(Ok(item)) => return Poll::Ready(Ok(item)),
                    Poll::Ready(Err(e)) => {
                        if !self.condition.can_retry(&e) {
                            return Poll::Ready(Err(e));
                        }
                        if let Err(e) = self.as_mut().cool_off(e) {
                            return Poll::Ready(Err(e));
                        }
                    }
                    Poll::Pending => return Poll::Pending,
                },
                RetryStateProj::Sleeping(sleep) => match sleep.poll(cx) {
                    Poll::Ready(_) => self.as_mut().reattempt(),
                    Poll::Pending => return Poll::Pending,
                },
            }
        }
    }
}
