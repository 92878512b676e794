//! Sample timing and cancellation.
//!
//! [`SampleClock`] schedules samples against a fixed anchor on tokio's monotonic
//! clock: the k-th sample is due at `anchor + k·interval`. A slow sample shortens the
//! following wait instead of shifting every later sample, and an overrun never produces
//! a negative wait or a burst of catch-up samples.
//!
//! [`StopSignal`] carries the external stop request; every wait in a run goes through it
//! so a stop is observed at the next wait without preempting instrument I/O.

use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// A wait was cut short by a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stopped;

/// Sender half of the stop request.
#[derive(Debug)]
pub struct StopHandle {
    tx: watch::Sender<bool>,
}

impl StopHandle {
    /// Request a stop. Idempotent.
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    /// Whether a stop has been requested.
    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Receiver half of the stop request.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    /// New linked handle/signal pair.
    pub fn pair() -> (StopHandle, StopSignal) {
        let (tx, rx) = watch::channel(false);
        (StopHandle { tx }, StopSignal { rx })
    }

    /// Whether a stop has been requested.
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// `Err(Stopped)` if a stop has been requested.
    pub fn check(&self) -> Result<(), Stopped> {
        if self.is_stopped() {
            Err(Stopped)
        } else {
            Ok(())
        }
    }

    /// Sleep until `deadline` unless a stop arrives first.
    pub async fn sleep_until(&mut self, deadline: Instant) -> Result<(), Stopped> {
        self.check()?;
        let rx = &mut self.rx;
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => Ok(()),
            _ = async {
                // Handle dropped without stopping: never fires
                if rx.wait_for(|stopped| *stopped).await.is_err() {
                    std::future::pending::<()>().await;
                }
            } => Err(Stopped),
        }
    }

    /// Sleep for `duration` unless a stop arrives first.
    pub async fn sleep(&mut self, duration: Duration) -> Result<(), Stopped> {
        self.sleep_until(Instant::now() + duration).await
    }
}

/// Anchor-based sampling schedule over a fixed window.
#[derive(Debug, Clone)]
pub struct SampleClock {
    anchor: Instant,
    interval: Duration,
    window: Duration,
    scheduled: u32,
}

impl SampleClock {
    /// Start a schedule now; the first sample is due immediately.
    pub fn start(interval: Duration, window: Duration) -> Self {
        Self::starting_at(Instant::now(), interval, window)
    }

    /// Start a schedule at `anchor`.
    pub fn starting_at(anchor: Instant, interval: Duration, window: Duration) -> Self {
        Self {
            anchor,
            interval,
            window,
            scheduled: 0,
        }
    }

    /// Time since the anchor.
    pub fn elapsed(&self) -> Duration {
        Instant::now().saturating_duration_since(self.anchor)
    }

    /// Deadline of the next sample, or `None` once it would fall outside the window.
    ///
    /// The deadline is `anchor + k·interval`, or now if that moment has passed, in which
    /// case the schedule skips the missed slots.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.scheduled = self.scheduled.saturating_add(1);
        let due = self.anchor + self.interval.saturating_mul(self.scheduled);
        let now = Instant::now();
        let deadline = if due >= now {
            due
        } else {
            // Overrun: sample now and realign to the slot containing now
            if !self.interval.is_zero() {
                let behind = now.saturating_duration_since(self.anchor).as_nanos();
                let slot = behind / self.interval.as_nanos();
                self.scheduled = u32::try_from(slot).unwrap_or(u32::MAX);
            }
            now
        };
        if deadline.saturating_duration_since(self.anchor) >= self.window {
            None
        } else {
            Some(deadline)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn deadlines_follow_the_anchor() {
        let anchor = Instant::now();
        let mut clock = SampleClock::start(Duration::from_secs(1), Duration::from_secs(3));

        // A 300 ms sample does not shift the schedule
        tokio::time::advance(Duration::from_millis(300)).await;
        assert_eq!(clock.next_deadline(), Some(anchor + Duration::from_secs(1)));

        tokio::time::advance(Duration::from_millis(700)).await;
        assert_eq!(clock.next_deadline(), Some(anchor + Duration::from_secs(2)));

        // Third deadline would be at the window edge
        assert_eq!(clock.next_deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn overrun_does_not_wait_or_burst() {
        let anchor = Instant::now();
        let mut clock = SampleClock::start(Duration::from_secs(1), Duration::from_secs(10));

        // Sample took 2.5 intervals
        tokio::time::advance(Duration::from_millis(2500)).await;
        let deadline = clock.next_deadline().unwrap();
        assert_eq!(deadline, anchor + Duration::from_millis(2500));

        // Back on the grid afterwards, missed slots are skipped
        tokio::time::advance(Duration::from_millis(100)).await;
        let next = clock.next_deadline().unwrap();
        assert_eq!(next, anchor + Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_is_cut_short_by_stop() {
        let (handle, mut signal) = StopSignal::pair();
        let start = Instant::now();

        let sleeper = tokio::spawn(async move { signal.sleep(Duration::from_secs(60)).await });
        tokio::time::sleep(Duration::from_secs(5)).await;
        handle.stop();

        assert_eq!(sleeper.await.unwrap(), Err(Stopped));
        assert!(start.elapsed() < Duration::from_secs(60));
        assert!(handle.is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_completes_without_stop() {
        let (_handle, mut signal) = StopSignal::pair();
        assert_eq!(signal.sleep(Duration::from_secs(2)).await, Ok(()));
        assert!(signal.check().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_handle_never_stops() {
        let (handle, mut signal) = StopSignal::pair();
        drop(handle);
        assert_eq!(signal.sleep(Duration::from_secs(1)).await, Ok(()));
    }
}
