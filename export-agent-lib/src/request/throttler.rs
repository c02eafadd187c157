use core::time::Duration;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

/// A pause requested within this window of the active pause's end joins it instead
/// of starting a new one. Callers that saw the same quota reset land here.
const JOIN_WINDOW: Duration = Duration::from_secs(1);

/// In-flight slots and the shared quota pause of one integration instance.
///
/// Every outbound call holds a permit from [`Throttler::acquire`] while it runs. While a
/// pause is active no new permit is handed out; calls already running are left alone.
#[derive(Debug)]
pub struct Throttler {
    slots: Arc<Semaphore>,
    pause_ends_at: Mutex<Option<Instant>>,
}

/// The pause a caller ended up waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pause {
    pub ends_at: Instant,

    /// `false` when the caller joined a pause someone else started.
    pub started: bool,
}

impl Pause {
    /// Sleep until the pause is over.
    pub async fn wait(self) {
        tokio::time::sleep_until(self.ends_at).await;
    }
}

impl Throttler {
    #[must_use]
    pub fn new(max_in_flight: usize) -> Arc<Self> {
        Arc::new(Self {
            slots: Arc::new(Semaphore::new(max_in_flight.max(1))),
            pause_ends_at: Mutex::new(None),
        })
    }

    /// Wait out any active pause, then take an in-flight slot.
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        // A pause may be extended while we sleep, so check again after every wake-up.
        while let Some(ends_at) = self.active_pause() {
            tokio::time::sleep_until(ends_at).await;
        }

        Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .expect("semaphore is never closed")
    }

    /// End of the active pause, if one is running.
    #[must_use]
    pub fn active_pause(&self) -> Option<Instant> {
        let ends_at = (*self.pause_ends_at.lock().expect("lock not poisoned"))?;
        (ends_at > Instant::now()).then_some(ends_at)
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.active_pause().is_some()
    }

    /// Number of slots currently free.
    #[must_use]
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    /// Hold back new acquisitions for `duration`, or join the active pause when it
    /// already lasts about as long.
    pub fn pause_for(&self, duration: Duration) -> Pause {
        let now = Instant::now();
        let requested = now + duration;

        let mut guard = self.pause_ends_at.lock().expect("lock not poisoned");
        if let Some(active) = *guard
            && active > now
            && active + JOIN_WINDOW >= requested
        {
            return Pause {
                ends_at: active,
                started: false,
            };
        }

        *guard = Some(requested);
        Pause {
            ends_at: requested,
            started: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_slots_are_returned_with_permits() {
        let throttler = Throttler::new(2);
        let first = throttler.acquire().await;
        let _second = throttler.acquire().await;
        assert_eq!(throttler.available(), 0);

        drop(first);
        assert_eq!(throttler.available(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_out_the_pause() {
        let throttler = Throttler::new(5);
        let pause = throttler.pause_for(Duration::from_secs(90));
        assert!(pause.started);
        assert!(throttler.is_paused());

        let start = Instant::now();
        let _permit = throttler.acquire().await;

        assert_eq!(start.elapsed(), Duration::from_secs(90));
        assert!(!throttler.is_paused());
    }

    #[tokio::test(start_paused = true)]
    async fn test_extension_during_wait_is_honored() {
        let throttler = Throttler::new(1);
        let _ = throttler.pause_for(Duration::from_secs(10));

        let waiter = {
            let throttler = Arc::clone(&throttler);
            tokio::spawn(async move {
                let start = Instant::now();
                let _permit = throttler.acquire().await;
                start.elapsed()
            })
        };

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(throttler.pause_for(Duration::from_secs(60)).started);

        assert_eq!(waiter.await.unwrap(), Duration::from_secs(65));
    }

    #[tokio::test(start_paused = true)]
    async fn test_similar_or_shorter_pause_joins() {
        let throttler = Throttler::new(1);
        let first = throttler.pause_for(Duration::from_secs(300));

        let shorter = throttler.pause_for(Duration::from_secs(10));
        assert!(!shorter.started);
        assert_eq!(shorter.ends_at, first.ends_at);

        let about_the_same = throttler.pause_for(Duration::from_millis(300_500));
        assert!(!about_the_same.started);

        let longer = throttler.pause_for(Duration::from_secs(600));
        assert!(longer.started);
        assert!(longer.ends_at > first.ends_at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_pause_is_not_joined() {
        let throttler = Throttler::new(1);
        throttler.pause_for(Duration::from_secs(1)).wait().await;
        assert!(throttler.pause_for(Duration::from_millis(500)).started);
    }

    #[test]
    fn test_zero_slots_is_treated_as_one() {
        let throttler = Throttler::new(0);
        assert_eq!(throttler.available(), 1);
    }
}
