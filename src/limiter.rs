//! Bounded-permit limiter for fan-out concurrency.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Caps how many fan-out operations run at once.
///
/// Permits are granted in FIFO order. A [`Permit`] releases its slot when
/// dropped, so a panicking or erroring holder can never leak a slot.
#[derive(Debug, Clone)]
pub struct Limiter {
    permits: Arc<Semaphore>,
}

/// A held slot; released on drop.
#[derive(Debug)]
pub struct Permit {
    _permit: OwnedSemaphorePermit,
}

impl Limiter {
    /// Create a limiter with the given number of permits.
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(permits)),
        }
    }

    /// Suspend until a permit is free.
    pub async fn acquire(&self) -> Permit {
        // The semaphore is never closed, so acquire_owned cannot fail.
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .expect("limiter semaphore closed");
        Permit { _permit: permit }
    }

    /// Run a future while holding a permit; the permit is released when the
    /// future settles, whether it returns normally or unwinds.
    pub async fn run<F, T>(&self, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        let _permit = self.acquire().await;
        fut.await
    }

    /// Permits currently free.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn bounds_concurrency() {
        let limiter = Limiter::new(3);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let limiter = limiter.clone();
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                tokio::spawn(async move {
                    limiter
                        .run(async {
                            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                            running.fetch_sub(1, Ordering::SeqCst);
                        })
                        .await;
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3, "peak concurrency exceeded cap");
        assert_eq!(limiter.available(), 3);
    }

    #[tokio::test]
    async fn releases_permit_after_error() {
        let limiter = Limiter::new(1);

        let result: Result<(), &str> = limiter.run(async { Err("boom") }).await;
        assert!(result.is_err());

        // The permit must be back; a second run would deadlock otherwise.
        assert_eq!(limiter.available(), 1);
        let ok: Result<(), &str> = limiter.run(async { Ok(()) }).await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn releases_permit_after_panic() {
        let limiter = Limiter::new(1);

        let inner = limiter.clone();
        let handle = tokio::spawn(async move {
            inner.run(async { panic!("worker died") }).await;
        });
        assert!(handle.await.is_err());

        assert_eq!(limiter.available(), 1);
    }

    #[tokio::test]
    async fn acquire_suspends_until_release() {
        let limiter = Limiter::new(1);
        let held = limiter.acquire().await;
        assert_eq!(limiter.available(), 0);

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                let _permit = limiter.acquire().await;
            })
        };

        // Waiter cannot finish while the permit is held.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(held);
        waiter.await.unwrap();
        assert_eq!(limiter.available(), 1);
    }
}
