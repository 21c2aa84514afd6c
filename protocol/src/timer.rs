//! One-shot and periodic timers that post events into a channel.
//!
//! Timers never run business logic themselves. They send an event to the
//! owning manager, which handles it on its own schedule. Stopping a timer
//! aborts its task and drops the handle, so a stopped timer cannot fire
//! again.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug)]
pub struct Timer {
    handle: Option<JoinHandle<()>>,
}

impl Timer {
    /// Send `event` once after `delay`.
    pub fn once<E>(delay: Duration, tx: mpsc::UnboundedSender<E>, event: E) -> Self
    where
        E: Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(event);
        });
        Self {
            handle: Some(handle),
        }
    }

    /// Send a clone of `event` every `period`, first after one full period.
    pub fn periodic<E>(period: Duration, tx: mpsc::UnboundedSender<E>, event: E) -> Self
    where
        E: Clone + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if tx.send(event.clone()).is_err() {
                    return;
                }
            }
        });
        Self {
            handle: Some(handle),
        }
    }

    /// Idempotent.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}
