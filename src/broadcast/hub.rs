//! Fan-out of rendered frames to a dynamic set of subscribers.
//!
//! Every subscriber owns a small bounded queue drained by its own delivery
//! task. `push` only ever does a non-blocking `try_send`, so a slow or
//! stalled viewer costs the other viewers nothing: its queue fills up and it
//! simply misses frames until its write times out and it is pruned.

use bytes::Bytes;
use slab::Slab;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::futures::Notified;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Hub tuning.
#[derive(Debug, Clone, Copy)]
pub struct HubConfig {
    /// Frames buffered per subscriber before it starts missing frames.
    pub queue_len: usize,
    /// Longest a single frame write may take before the subscriber is pruned.
    pub write_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_len: 4,
            write_timeout: Duration::from_secs(5),
        }
    }
}

/// Identifies one registration. Slab keys are reused, the generation is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberId {
    key: usize,
    generation: u64,
}

/// A registration drained by a delivery task, returned by
/// [`BroadcastHub::add_subscriber`].
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriberId,
    /// Delivery task; finishes once the subscriber is removed or fails.
    pub task: JoinHandle<()>,
}

/// A registration whose frames the caller drains itself.
#[derive(Debug)]
pub struct Feed {
    pub id: SubscriberId,
    /// Closes once the subscriber is removed from the hub.
    pub frames: mpsc::Receiver<Bytes>,
}

struct Subscriber {
    generation: u64,
    tx: mpsc::Sender<Bytes>,
}

/// A set of subscribers receiving every pushed frame.
pub struct BroadcastHub {
    name: &'static str,
    config: HubConfig,
    subscribers: Mutex<Slab<Subscriber>>,
    next_generation: AtomicU64,
    joined: Notify,
}

impl BroadcastHub {
    pub fn new(name: &'static str, config: HubConfig) -> Arc<Self> {
        Arc::new(Self {
            name,
            config,
            subscribers: Mutex::new(Slab::new()),
            next_generation: AtomicU64::new(0),
            joined: Notify::new(),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn lock(&self) -> MutexGuard<'_, Slab<Subscriber>> {
        // The slab is never left half-updated, so a poisoned lock is still usable.
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a queue that receives every frame pushed after this call.
    pub fn subscribe(&self) -> Feed {
        let (tx, frames) = mpsc::channel(self.config.queue_len.max(1));
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let key = self.lock().insert(Subscriber { generation, tx });

        debug!(hub = self.name, key, "Subscriber added");
        self.joined.notify_waiters();
        Feed {
            id: SubscriberId { key, generation },
            frames,
        }
    }

    /// Register `writer`. Every frame pushed after this call is passed
    /// through `wrap` and written out by a dedicated task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn add_subscriber<W, F>(self: &Arc<Self>, writer: W, wrap: F) -> Subscription
    where
        W: AsyncWrite + Send + Unpin + 'static,
        F: Fn(Bytes) -> Bytes + Send + 'static,
    {
        let Feed { id, frames } = self.subscribe();
        let task = tokio::spawn(deliver(
            Arc::downgrade(self),
            id,
            frames,
            writer,
            wrap,
            self.config.write_timeout,
        ));
        Subscription { id, task }
    }

    /// Deregister a subscriber. Removing an unknown or stale id is a no-op.
    ///
    /// Returns whether the subscriber was registered.
    pub fn remove_subscriber(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.lock();
        match subscribers.get(id.key) {
            Some(sub) if sub.generation == id.generation => {
                subscribers.remove(id.key);
                debug!(hub = self.name, key = id.key, "Subscriber removed");
                true
            }
            _ => false,
        }
    }

    /// Queue `frame` for every subscriber without waiting on any of them.
    ///
    /// Returns how many subscribers accepted the frame. Subscribers whose
    /// queue is full miss this frame; closed ones are pruned.
    pub fn push(&self, frame: Bytes) -> usize {
        let mut subscribers = self.lock();
        let mut delivered = 0;
        let mut closed = Vec::new();

        for (key, sub) in subscribers.iter() {
            match sub.tx.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    trace!(hub = self.name, key, "Subscriber lagging, frame skipped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(key),
            }
        }

        for key in closed {
            subscribers.remove(key);
            debug!(hub = self.name, key, "Pruned closed subscriber");
        }

        delivered
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Resolves when a subscriber is added after this future is first
    /// polled or enabled.
    pub fn subscriber_joined(&self) -> Notified<'_> {
        self.joined.notified()
    }
}

impl std::fmt::Debug for BroadcastHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastHub")
            .field("name", &self.name)
            .field("subscribers", &self.len())
            .finish()
    }
}

/// Drain one subscriber's queue into its writer.
async fn deliver<W, F>(
    hub: Weak<BroadcastHub>,
    id: SubscriberId,
    mut rx: mpsc::Receiver<Bytes>,
    mut writer: W,
    wrap: F,
    write_timeout: Duration,
) where
    W: AsyncWrite + Send + Unpin + 'static,
    F: Fn(Bytes) -> Bytes + Send + 'static,
{
    while let Some(frame) = rx.recv().await {
        let frame = wrap(frame);
        let write = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        };
        match tokio::time::timeout(write_timeout, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(key = id.key, error = %e, "Subscriber write failed");
                break;
            }
            Err(_) => {
                debug!(key = id.key, "Subscriber write timed out");
                break;
            }
        }
    }

    if let Some(hub) = hub.upgrade() {
        hub.remove_subscriber(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::identity;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{duplex, AsyncReadExt};

    /// A writer that never accepts a byte.
    struct Stuck;

    impl AsyncWrite for Stuck {
        fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<std::io::Result<usize>> {
            Poll::Pending
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Pending
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Pending
        }
    }

    fn hub(write_timeout: Duration) -> Arc<BroadcastHub> {
        BroadcastHub::new(
            "test",
            HubConfig {
                queue_len: 2,
                write_timeout,
            },
        )
    }

    #[tokio::test]
    async fn test_push_reaches_all_subscribers() {
        let hub = hub(Duration::from_secs(5));
        let (a, mut a_rx) = duplex(64);
        let (b, mut b_rx) = duplex(64);
        hub.add_subscriber(a, identity);
        hub.add_subscriber(b, identity);

        assert_eq!(hub.push(Bytes::from_static(b"frame")), 2);

        let mut buf = [0u8; 5];
        a_rx.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"frame");
        b_rx.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"frame");
    }

    #[tokio::test]
    async fn test_stuck_subscriber_does_not_block_others() {
        let hub = hub(Duration::from_millis(100));
        let (a, mut a_rx) = duplex(1024);
        let (b, mut b_rx) = duplex(1024);
        hub.add_subscriber(a, identity);
        hub.add_subscriber(Stuck, identity);
        hub.add_subscriber(b, identity);

        for i in 0..5u8 {
            hub.push(Bytes::from(vec![i; 4]));
            // Let the delivery tasks drain between frames.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let deadline = Duration::from_secs(1);
        let mut buf = [0u8; 20];
        tokio::time::timeout(deadline, a_rx.read_exact(&mut buf))
            .await
            .expect("first subscriber starved")
            .unwrap();
        assert_eq!(&buf[16..], &[4; 4]);
        tokio::time::timeout(deadline, b_rx.read_exact(&mut buf))
            .await
            .expect("second subscriber starved")
            .unwrap();

        // The stuck writer times out and is pruned.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(hub.len(), 2);
    }

    #[tokio::test]
    async fn test_new_subscriber_sees_only_future_frames() {
        let hub = hub(Duration::from_secs(5));
        hub.push(Bytes::from_static(b"old"));

        let (a, mut a_rx) = duplex(64);
        hub.add_subscriber(a, identity);
        hub.push(Bytes::from_static(b"new"));

        let mut buf = [0u8; 3];
        a_rx.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"new");
    }

    #[tokio::test]
    async fn test_remove_subscriber() {
        let hub = hub(Duration::from_secs(5));
        let (a, mut a_rx) = duplex(64);
        let sub = hub.add_subscriber(a, identity);

        assert!(hub.remove_subscriber(sub.id));
        assert!(!hub.remove_subscriber(sub.id));
        assert_eq!(hub.push(Bytes::from_static(b"gone")), 0);

        // The delivery task ends and drops the writer.
        sub.task.await.unwrap();
        let mut rest = Vec::new();
        a_rx.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_stale_id_does_not_remove_reused_slot() {
        let hub = hub(Duration::from_secs(5));
        let (a, _a_rx) = duplex(64);
        let first = hub.add_subscriber(a, identity);
        hub.remove_subscriber(first.id);

        let (b, _b_rx) = duplex(64);
        let second = hub.add_subscriber(b, identity);
        assert_eq!(first.id.key, second.id.key);

        assert!(!hub.remove_subscriber(first.id));
        assert_eq!(hub.len(), 1);
    }

    #[tokio::test]
    async fn test_disconnected_subscriber_is_pruned() {
        let hub = hub(Duration::from_secs(5));
        let (a, a_rx) = duplex(64);
        let sub = hub.add_subscriber(a, identity);
        drop(a_rx);

        hub.push(Bytes::from_static(b"x"));
        sub.task.await.unwrap();
        assert!(hub.is_empty());
    }

    #[tokio::test]
    async fn test_subscriber_joined_wakes() {
        let hub = hub(Duration::from_secs(5));
        let waiter = {
            let hub = Arc::clone(&hub);
            tokio::spawn(async move { hub.subscriber_joined().await })
        };
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (a, _a_rx) = duplex(64);
        hub.add_subscriber(a, identity);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("join signal")
            .unwrap();
    }

    #[tokio::test]
    async fn test_feed_receives_frames_until_dropped() {
        let hub = hub(Duration::from_secs(5));
        let mut feed = hub.subscribe();

        assert_eq!(hub.push(Bytes::from_static(b"one")), 1);
        assert_eq!(feed.frames.recv().await.unwrap(), Bytes::from_static(b"one"));

        drop(feed);
        assert_eq!(hub.push(Bytes::from_static(b"two")), 0);
        assert!(hub.is_empty());
    }

    #[tokio::test]
    async fn test_wrap_applies_to_each_frame() {
        let hub = hub(Duration::from_secs(5));
        let (a, mut a_rx) = duplex(64);
        hub.add_subscriber(a, |frame: Bytes| {
            let mut wrapped = b"<".to_vec();
            wrapped.extend_from_slice(&frame);
            wrapped.push(b'>');
            Bytes::from(wrapped)
        });

        hub.push(Bytes::from_static(b"x"));
        hub.push(Bytes::from_static(b"y"));
        let mut buf = [0u8; 6];
        a_rx.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"<x><y>");
    }

    #[tokio::test]
    async fn test_enabled_join_signal_sees_subscriber_before_first_poll() {
        let hub = hub(Duration::from_secs(5));
        let joined = hub.subscriber_joined();
        tokio::pin!(joined);
        joined.as_mut().enable();

        let _feed = hub.subscribe();
        tokio::time::timeout(Duration::from_millis(100), joined)
            .await
            .expect("join before first poll was lost");
    }
}
