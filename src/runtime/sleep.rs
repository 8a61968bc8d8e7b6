//! Sleep provider backed by OS threads

use futures::channel::oneshot;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::time::Duration;
use tor_rtcompat::SleepProvider;

/// A [`SleepProvider`] that parks one helper thread per pending sleep
///
/// Good enough for tests and for the handful of concurrent timers a single
/// circuit needs; callers with a real async runtime should pass that instead.
#[derive(Debug, Clone, Default)]
pub struct ThreadSleeper {
    _private: (),
}

impl ThreadSleeper {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SleepProvider for ThreadSleeper {
    type SleepFuture = BoxFuture<'static, ()>;

    fn sleep(&self, duration: Duration) -> Self::SleepFuture {
        let (tx, rx) = oneshot::channel::<()>();
        let spawned = std::thread::Builder::new()
            .name("onion-sleep".into())
            .spawn(move || {
                std::thread::sleep(duration);
                let _ = tx.send(());
            });
        if let Err(e) = spawned {
            // Fail open: a timer that can't be armed fires at once
            log::warn!("Failed to spawn sleep thread: {}", e);
            return futures::future::ready(()).boxed();
        }
        rx.map(|_| ()).boxed()
    }
}
