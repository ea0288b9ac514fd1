//! Driver for the cooperating periodic loops.
//!
//! Each loop runs on its own cadence, can be triggered on demand, and exits
//! when the shutdown channel flips.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};

pub struct Periodic {
    interval: Duration,
    notify: Arc<Notify>,
}

impl Periodic {
    pub fn new(interval: Duration) -> Self {
        Periodic {
            interval,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Request a run ahead of the next scheduled one.
    pub fn trigger(&self) {
        self.notify.notify_one();
    }

    /// Spawn the loop: `tick` runs after every interval elapse or trigger.
    pub fn spawn<F, Fut>(&self, mut shutdown: watch::Receiver<bool>, tick: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let interval = self.interval;
        let notify = self.notify.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = notify.notified() => {}
                    _ = shutdown.changed() => break,
                }
                tick().await;
            }
        });
    }
}
