//! Periodic maintenance tasks.
//!
//! The reassembler's TTL purge and the correlators' deadline sweeps run as
//! named loops on a shared [`TaskTracker`] so teardown can stop them all at
//! once.

use std::time::Duration;

use log::debug;
use tokio::{
    select,
    time::{MissedTickBehavior, interval},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

/// Owner of the periodic sweep tasks.
#[derive(Debug, Default)]
pub struct Sweeper {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl Sweeper {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Run `tick` every `period` until [`stop`](Self::stop) is called.
    ///
    /// The first tick fires one full period after spawning.
    pub fn spawn<F>(&self, name: &'static str, period: Duration, mut tick: F)
    where
        F: FnMut() + Send + 'static,
    {
        let token = self.token.clone();
        let period = period.max(Duration::from_millis(1));
        self.tracker.spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                select! {
                    biased;

                    () = token.cancelled() => break,
                    _ = ticker.tick() => tick(),
                }
            }
            debug!("sweep stopped: name={name}");
        });
    }

    /// Number of sweeps still running.
    #[must_use]
    pub fn len(&self) -> usize { self.tracker.len() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.tracker.is_empty() }

    /// Stop every sweep and wait for the loops to exit.
    pub async fn stop(&self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use tokio::time::advance;

    use super::Sweeper;

    #[tokio::test(start_paused = true)]
    async fn sweep_ticks_each_period_until_stopped() {
        let sweeper = Sweeper::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        {
            let ticks = Arc::clone(&ticks);
            sweeper.spawn("count", Duration::from_secs(30), move || {
                ticks.fetch_add(1, Ordering::SeqCst);
            });
        }
        tokio::task::yield_now().await;

        for _ in 0..3 {
            advance(Duration::from_secs(30)).await;
            tokio::task::yield_now().await;
        }
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        sweeper.stop().await;
        assert!(sweeper.is_empty());
        advance(Duration::from_secs(120)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }
}
