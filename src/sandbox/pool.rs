use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::{Result, bail};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::isolate;

type FreeList = Arc<parking_lot::Mutex<VecDeque<u8>>>;

/// Fixed-capacity pool of reusable isolate boxes.
///
/// Box ids `0..capacity` are handed out one at a time; the semaphore makes a
/// saturated `acquire` wait until a lease is dropped, so the pool capacity is
/// a hard upper bound on concurrent untrusted executions.
pub struct BoxPool {
    free: FreeList,
    permits: Arc<Semaphore>,
    capacity: u8,
}

impl BoxPool {
    /// Panics when `capacity` is 0: a pool that can never hand out a box
    /// would make every `acquire` wait forever.
    pub fn new(capacity: u8) -> Self {
        assert!(capacity > 0, "box pool capacity must not be 0");
        let free: VecDeque<u8> = (0..capacity).collect();
        log::info!("Box pool initialized with {capacity} boxes");

        Self {
            free: Arc::new(parking_lot::Mutex::new(free)),
            permits: Arc::new(Semaphore::new(capacity as usize)),
            capacity,
        }
    }

    pub fn capacity(&self) -> u8 {
        self.capacity
    }

    /// Number of boxes currently free.
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    /// Takes a box out of the pool, waiting until one is free.
    ///
    /// The box is reinitialized before it is handed out, so no state leaks
    /// between consecutive users. Initialization failures are logged and the
    /// lease is returned anyway; the sandbox tool isolates each run on its
    /// own, independent of box reuse.
    pub async fn acquire(&self) -> Result<BoxLease> {
        let permit = self.permits.clone().acquire_owned().await?;

        let box_id = { self.free.lock().pop_front() };
        let Some(box_id) = box_id else {
            // Unreachable while the permit count matches the free list
            bail!("box pool free list empty while a permit was held");
        };

        let lease = BoxLease {
            free: Arc::clone(&self.free),
            box_id,
            _permit: permit,
        };

        if let Err(e) = isolate::init_box(box_id).await {
            log::warn!("Failed to initialize box {box_id}: {e}");
        }

        Ok(lease)
    }
}

/// Exclusive lease on one sandbox box.
///
/// Dropping the lease cleans the box up and returns it to the pool, so the
/// release happens on every exit path, including panics and early returns.
pub struct BoxLease {
    free: FreeList,
    box_id: u8,
    _permit: OwnedSemaphorePermit,
}

impl BoxLease {
    pub fn box_id(&self) -> u8 {
        self.box_id
    }
}

impl Drop for BoxLease {
    fn drop(&mut self) {
        if let Err(e) = isolate::cleanup_box(self.box_id) {
            log::warn!("Failed to clean up box {}: {e}", self.box_id);
        }

        // Return the id before the permit is released (fields drop in
        // declaration order, so `_permit` goes after this body runs).
        self.free.lock().push_back(self.box_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    #[should_panic(expected = "capacity must not be 0")]
    fn zero_capacity_is_rejected() {
        let _ = BoxPool::new(0);
    }

    #[tokio::test]
    async fn acquired_boxes_are_distinct() {
        let pool = BoxPool::new(4);
        let mut leases = Vec::new();
        for _ in 0..4 {
            leases.push(pool.acquire().await.unwrap());
        }

        let ids: HashSet<u8> = leases.iter().map(|l| l.box_id()).collect();
        assert_eq!(ids.len(), 4);
        assert!(ids.iter().all(|&id| id < 4));
        assert_eq!(pool.idle(), 0);
    }

    #[tokio::test]
    async fn saturated_pool_blocks_until_release() {
        let pool = BoxPool::new(1);
        let lease = pool.acquire().await.unwrap();

        let pending = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(pending.is_err(), "acquire should wait while the pool is busy");

        drop(lease);
        let lease = tokio::time::timeout(Duration::from_millis(500), pool.acquire())
            .await
            .expect("acquire should resume after a release")
            .unwrap();
        assert_eq!(lease.box_id(), 0);
    }

    #[tokio::test]
    async fn release_on_early_return() {
        let pool = BoxPool::new(2);

        async fn failing_user(pool: &BoxPool) -> Result<()> {
            let _lease = pool.acquire().await?;
            bail!("execution blew up");
        }

        assert!(failing_user(&pool).await.is_err());
        assert_eq!(pool.idle(), 2);
    }

    #[tokio::test]
    async fn capacity_is_never_exceeded() {
        let pool = Arc::new(BoxPool::new(3));
        let busy = Arc::new(AtomicUsize::new(0));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..20 {
            let pool = Arc::clone(&pool);
            let busy = Arc::clone(&busy);
            tasks.spawn(async move {
                let lease = pool.acquire().await.unwrap();
                let now_busy = busy.fetch_add(1, Ordering::SeqCst) + 1;
                assert!(now_busy <= 3, "{now_busy} concurrent holders observed");
                tokio::time::sleep(Duration::from_millis(5)).await;
                busy.fetch_sub(1, Ordering::SeqCst);
                drop(lease);
            });
        }
        while let Some(res) = tasks.join_next().await {
            res.unwrap();
        }
        assert_eq!(pool.idle(), 3);
    }
}
