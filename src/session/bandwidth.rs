//! Bandwidth limiter
//!
//! Two global token-bucket channels (upload and download) refilled once
//! per second from the configured rate limits, plus the half-open
//! connection throttle bounding in-flight TCP connect attempts.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::trace;

use crate::error::{Ed2kError, ErrorKind};

#[derive(Debug)]
struct ChannelState {
    /// bytes/s; 0 means unlimited
    limit: u64,
    /// tokens currently available
    quota: u64,
    /// FIFO of waiters: requested bytes plus wake-up channel
    waiters: VecDeque<(u64, oneshot::Sender<()>)>,
}

/// One direction's token bucket.
///
/// The bucket is only refilled from the session tick, so a connection
/// asking for quota either gets it immediately or parks in FIFO order.
#[derive(Debug)]
pub struct BandwidthChannel {
    state: Mutex<ChannelState>,
}

impl BandwidthChannel {
    pub fn new(limit: u64) -> Self {
        Self {
            state: Mutex::new(ChannelState {
                limit,
                quota: limit,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Change the rate limit; takes effect on the next refill.
    pub fn set_limit(&self, limit: u64) {
        let mut state = self.state.lock().expect("bandwidth state poisoned");
        state.limit = limit;
        if limit == 0 {
            // unlimited: release everybody
            while let Some((_, waker)) = state.waiters.pop_front() {
                let _ = waker.send(());
            }
        }
    }

    /// Acquire `bytes` of quota, suspending until available. FIFO order
    /// among queued requests is preserved.
    pub async fn request(&self, bytes: u64) {
        let waiter = {
            let mut state = self.state.lock().expect("bandwidth state poisoned");
            if state.limit == 0 {
                return;
            }
            if state.waiters.is_empty() && state.quota >= bytes {
                state.quota -= bytes;
                return;
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back((bytes, tx));
            rx
        };
        // the refill tick fires the waker once quota covers the request
        let _ = waiter.await;
    }

    /// Per-second refill: top the bucket up to one second's worth and
    /// hand quota to queued requests in arrival order.
    pub fn tick(&self) {
        let mut state = self.state.lock().expect("bandwidth state poisoned");
        if state.limit == 0 {
            while let Some((_, waker)) = state.waiters.pop_front() {
                let _ = waker.send(());
            }
            return;
        }

        state.quota = (state.quota + state.limit).min(state.limit);
        trace!("bandwidth refill: quota={}B waiters={}", state.quota, state.waiters.len());

        while let Some((bytes, _)) = state.waiters.front() {
            if state.quota < *bytes {
                break;
            }
            let (bytes, waker) = state.waiters.pop_front().expect("front checked");
            state.quota -= bytes;
            let _ = waker.send(());
        }
    }

    /// Available quota right now.
    pub fn quota(&self) -> u64 {
        self.state.lock().expect("bandwidth state poisoned").quota
    }

    /// Queued requests.
    pub fn queued(&self) -> usize {
        self.state.lock().expect("bandwidth state poisoned").waiters.len()
    }
}

/// Bounds the number of simultaneously connecting sockets. A released
/// permit (drop) frees the slot for the next outbound attempt.
pub struct HalfOpenThrottle {
    slots: Arc<Semaphore>,
}

impl HalfOpenThrottle {
    pub fn new(limit: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(limit)),
        }
    }

    /// Wait for a connect slot.
    pub async fn acquire(&self) -> anyhow::Result<OwnedSemaphorePermit> {
        self.slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Ed2kError::network_error(ErrorKind::HalfOpenExhausted, "half-open throttle closed").into())
    }

    /// Take a slot only if one is free.
    pub fn try_acquire(&self) -> anyhow::Result<OwnedSemaphorePermit> {
        match self.slots.clone().try_acquire_owned() {
            Ok(permit) => Ok(permit),
            Err(TryAcquireError::NoPermits) => {
                Err(Ed2kError::network_error(ErrorKind::HalfOpenExhausted, "no free half-open slots").into())
            }
            Err(TryAcquireError::Closed) => {
                Err(Ed2kError::network_error(ErrorKind::HalfOpenExhausted, "half-open throttle closed").into())
            }
        }
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_unlimited_never_blocks() {
        let channel = BandwidthChannel::new(0);
        for _ in 0..100 {
            channel.request(1_000_000).await;
        }
    }

    #[tokio::test]
    async fn test_quota_deducts_until_exhausted() {
        let channel = BandwidthChannel::new(1000);
        channel.request(600).await;
        assert_eq!(channel.quota(), 400);
        channel.request(400).await;
        assert_eq!(channel.quota(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_request_waits_for_tick() {
        let channel = Arc::new(BandwidthChannel::new(100));
        channel.request(100).await;

        let waiter = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel.request(50).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(channel.queued(), 1);
        assert!(!waiter.is_finished());

        channel.tick();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(channel.quota(), 50);
    }

    #[tokio::test]
    async fn test_fifo_order_preserved() {
        let channel = Arc::new(BandwidthChannel::new(100));
        channel.request(100).await;

        let results = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..3 {
            let channel = channel.clone();
            let results = results.clone();
            handles.push(tokio::spawn(async move {
                channel.request(60).await;
                results.lock().unwrap().push(i);
            }));
            // deterministic arrival order
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // one refill admits only the first waiter (60 of 100)
        channel.tick();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(results.lock().unwrap().clone(), vec![0]);

        channel.tick();
        channel.tick();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        }
        assert_eq!(results.lock().unwrap().clone(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_half_open_limit() {
        let throttle = HalfOpenThrottle::new(2);
        let first = throttle.try_acquire().unwrap();
        let _second = throttle.try_acquire().unwrap();
        assert!(throttle.try_acquire().is_err());
        assert_eq!(throttle.available(), 0);

        drop(first);
        assert_eq!(throttle.available(), 1);
        assert!(throttle.try_acquire().is_ok());
    }
}
