//! Timers for circuit and stream operations
//!
//! Everything time-related goes through [`tor_rtcompat::SleepProvider`], so
//! the caller picks the executor and tests can substitute their own clock.
//! [`ThreadSleeper`] is a dependency-free provider for callers that don't
//! already run an arti runtime.

mod sleep;

pub use sleep::ThreadSleeper;

use futures::future::{self, Either};
use futures::pin_mut;
use std::future::Future;
use std::time::{Duration, Instant};
use tor_rtcompat::SleepProvider;

/// A timer ran out before the future it guarded completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elapsed;

/// Run `fut` for at most `duration`
pub async fn timeout<R, F>(runtime: &R, duration: Duration, fut: F) -> Result<F::Output, Elapsed>
where
    R: SleepProvider,
    F: Future,
{
    let sleep = runtime.sleep(duration);
    pin_mut!(fut);
    pin_mut!(sleep);
    match future::select(fut, sleep).await {
        Either::Left((output, _)) => Ok(output),
        Either::Right(((), _)) => Err(Elapsed),
    }
}

/// A fixed point in time shared by several waits
///
/// Circuit construction awaits one reply per hop; every one of those waits
/// draws on the same overall budget.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after<R: SleepProvider>(runtime: &R, duration: Duration) -> Self {
        Self {
            at: runtime.now() + duration,
        }
    }

    /// Time left, zero once passed
    pub fn remaining<R: SleepProvider>(&self, runtime: &R) -> Duration {
        self.at.saturating_duration_since(runtime.now())
    }

    /// Run `fut` until the deadline
    pub async fn run<R, F>(&self, runtime: &R, fut: F) -> Result<F::Output, Elapsed>
    where
        R: SleepProvider,
        F: Future,
    {
        let left = self.remaining(runtime);
        if left.is_zero() {
            return Err(Elapsed);
        }
        timeout(runtime, left, fut).await
    }
}
