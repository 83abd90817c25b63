//! Coarse-grained timeout utility. A background sleeper task watches a
//! deadline channel; when the deadline passes un-rearmed, waiters are
//! notified (and an optional fire closure runs). Suitable for lease expiry
//! bounds and retry back-off, not for microsecond-precision timing.

use std::sync::Arc;

use crate::utils::LeaseKvError;

use futures::future::FutureExt;

use tokio::sync::{watch, Notify};
use tokio::time::{self, Duration, Instant};

/// One-deadline-at-a-time timer. Re-arming replaces the pending deadline;
/// disarming cancels it and swallows any notification already produced.
#[derive(Debug)]
pub struct Timer {
    /// Deadline-setting channel (caller-side sender).
    deadline_tx: watch::Sender<Option<Instant>>,

    /// Expiry notification (caller-side receiver).
    notify: Arc<Notify>,
}

impl Timer {
    /// Creates a timer with no fire closure; waiters learn about expiry
    /// solely through `expired().await`.
    pub fn new() -> Self {
        Self::with_callback(None)
    }

    /// Creates a timer that additionally runs `on_fire` from the sleeper
    /// task whenever a deadline passes. Must be called within a tokio
    /// runtime context.
    pub fn with_callback(
        on_fire: Option<Box<dyn Fn() + Send + Sync + 'static>>,
    ) -> Self {
        let (deadline_tx, mut deadline_rx) = watch::channel(None);
        let notify = Arc::new(Notify::new());
        let notify_ref = notify.clone();

        // background sleeper task; exits when the sender side is dropped
        tokio::spawn(async move {
            let sleep = time::sleep(Duration::ZERO);
            tokio::pin!(sleep);

            while deadline_rx.changed().await.is_ok() {
                let deadline = *deadline_rx.borrow();
                if let Some(ddl) = deadline {
                    sleep.as_mut().reset(ddl);
                    (&mut sleep).await;

                    // notify only if nothing re-armed the timer while we
                    // were sleeping
                    if let Ok(false) = deadline_rx.has_changed() {
                        notify_ref.notify_one();
                        if let Some(cb) = on_fire.as_ref() {
                            cb();
                        }
                    }
                }
            }
        });

        Timer {
            deadline_tx,
            notify,
        }
    }

    /// Arms the timer to fire after `dur` from now, replacing any pending
    /// deadline. Zero durations are rejected.
    pub fn arm(&self, dur: Duration) -> Result<(), LeaseKvError> {
        if dur.is_zero() {
            return Err(LeaseKvError::msg("cannot arm timer with zero dur"));
        }
        self.deadline_tx.send(Some(Instant::now() + dur))?;
        Ok(())
    }

    /// Cancels the pending deadline (if any) and drains notifications that
    /// may have fired already.
    pub fn disarm(&self) -> Result<(), LeaseKvError> {
        self.deadline_tx.send(None)?;
        while self.notify.notified().now_or_never().is_some() {}
        Ok(())
    }

    /// Waits until the armed deadline passes. Typically used as a
    /// `tokio::select!` branch.
    pub async fn expired(&self) {
        self.notify.notified().await;
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
