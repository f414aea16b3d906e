//! Push-source side of the reader: events, capabilities, and an in-memory
//! source implementation
//!
//! A chunk source delivers bytes on its own schedule. The reader consumes it
//! through the [`ChunkSource`] capability trait and a single [`Subscription`]
//! event feed, so that teardown is one token revocation rather than a set of
//! individually tracked handler removals.

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Event delivered by a chunk source to its subscriber.
#[derive(Debug, Clone)]
pub enum SourceEvent {
    /// A chunk of bytes arrived.
    Data(Bytes),
    /// The source terminated; no more data will ever arrive.
    Closed,
    /// An armed deadline elapsed.
    TimedOut,
}

/// Capabilities a push source must expose to a
/// [`BufferedReader`](crate::BufferedReader).
pub trait ChunkSource {
    /// Register for events. The returned [`Subscription`] is the only
    /// delivery path; cancelling (or dropping) it deregisters the
    /// subscriber.
    fn subscribe(&mut self) -> Subscription;

    /// Stop delivering data events until resumed. Takes effect before the
    /// call returns: chunks not yet handed to the subscriber are held by
    /// the source.
    fn pause(&mut self);

    /// Begin or continue delivering data events, starting with any held
    /// chunks in arrival order.
    fn resume(&mut self);

    /// Logically prepend bytes to the source's delivery queue so they are
    /// the next data seen by any subscriber.
    fn unshift(&mut self, bytes: Bytes);

    /// Arm a one-shot deadline after which the source emits
    /// [`SourceEvent::TimedOut`]. Returns `false` when the source has no
    /// deadline support; callers must treat that as a capability gap, not a
    /// fault.
    fn arm_timeout(&mut self, after: Duration) -> bool {
        let _ = after;
        false
    }
}

/// Handle to a source's event feed.
///
/// Holding it keeps the registration alive; dropping or cancelling it
/// revokes the registration and stops delivery.
pub struct Subscription {
    events: BoxStream<'static, SourceEvent>,
}

impl Subscription {
    /// Wrap an event stream handed out by a source's `subscribe`.
    pub fn new(events: impl Stream<Item = SourceEvent> + Send + 'static) -> Self {
        Self {
            events: Box::pin(events),
        }
    }

    /// Wrap a channel receiver, for sources that deliver their events by
    /// sending into an [`mpsc`] channel.
    pub fn from_channel(events: mpsc::UnboundedReceiver<SourceEvent>) -> Self {
        Self::new(UnboundedReceiverStream::new(events))
    }

    /// Wait for the next event. Returns `None` once the source has dropped
    /// this registration.
    pub async fn next_event(&mut self) -> Option<SourceEvent> {
        self.events.next().await
    }

    /// Revoke the registration.
    pub fn cancel(self) {}
}

impl Stream for Subscription {
    type Item = SourceEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<SourceEvent>> {
        self.events.as_mut().poll_next(cx)
    }
}

/// In-memory chunk source with explicit pause/resume and an inspectable
/// delivery queue.
///
/// Delivery is pull-based: events sit in a single ordered queue until the
/// subscriber polls them out, so `pause` takes effect synchronously and
/// [`ChunkSource::unshift`] genuinely puts bytes in front of every chunk
/// not yet seen by the reader. Undelivered events also survive a subscriber
/// going away; the next subscriber picks up where the previous one stopped.
///
/// Clones share state, which lets a test or a wiring layer keep writing into
/// a source that a reader owns. Network-backed sources implement
/// [`ChunkSource`] over their own transport instead.
#[derive(Clone)]
pub struct MemorySource {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    /// Undelivered events in arrival order. A data event at the front is
    /// held back while paused; close and timeout events are delivered in
    /// their queued position.
    queue: VecDeque<SourceEvent>,
    paused: bool,
    /// Bumped on every subscribe; an outdated feed resolves to `None`.
    epoch: u64,
    waker: Option<Waker>,
    armed: Option<Duration>,
    supports_timeout: bool,
}

impl MemorySource {
    /// Create a source with deadline support.
    pub fn new() -> Self {
        Self::with_timeout_support(true)
    }

    /// Create a source that rejects [`ChunkSource::arm_timeout`], modelling
    /// transports without deadline notifications.
    pub fn without_timeout() -> Self {
        Self::with_timeout_support(false)
    }

    fn with_timeout_support(supports_timeout: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                queue: VecDeque::new(),
                paused: false,
                epoch: 0,
                waker: None,
                armed: None,
                supports_timeout,
            })),
        }
    }

    /// Queue a chunk for delivery.
    pub fn write(&self, chunk: impl Into<Bytes>) {
        let mut inner = self.lock();
        inner.queue.push_back(SourceEvent::Data(chunk.into()));
        inner.wake();
    }

    /// Terminate the source.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.queue.push_back(SourceEvent::Closed);
        inner.wake();
    }

    /// Fire the armed deadline, if one is armed.
    pub fn fire_timeout(&self) {
        let mut inner = self.lock();
        if inner.armed.take().is_some() {
            inner.queue.push_back(SourceEvent::TimedOut);
            inner.wake();
        }
    }

    /// Deadline currently armed via [`ChunkSource::arm_timeout`].
    pub fn armed_timeout(&self) -> Option<Duration> {
        self.lock().armed
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic mid-mutation cannot leave the queue inconsistent, so a
        // poisoned lock is still usable.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Inner {
    fn wake(&mut self) {
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkSource for MemorySource {
    fn subscribe(&mut self) -> Subscription {
        let mut inner = self.lock();
        inner.epoch += 1;
        // Let a previous subscriber observe the revocation.
        inner.wake();
        Subscription::new(Feed {
            inner: Arc::clone(&self.inner),
            epoch: inner.epoch,
        })
    }

    fn pause(&mut self) {
        self.lock().paused = true;
    }

    fn resume(&mut self) {
        let mut inner = self.lock();
        inner.paused = false;
        inner.wake();
    }

    fn unshift(&mut self, bytes: Bytes) {
        let mut inner = self.lock();
        inner.queue.push_front(SourceEvent::Data(bytes));
        inner.wake();
    }

    fn arm_timeout(&mut self, after: Duration) -> bool {
        let mut inner = self.lock();
        if !inner.supports_timeout {
            return false;
        }
        inner.armed = Some(after);
        true
    }
}

/// Pull-based event feed over a [`MemorySource`]'s queue.
struct Feed {
    inner: Arc<Mutex<Inner>>,
    epoch: u64,
}

impl Stream for Feed {
    type Item = SourceEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<SourceEvent>> {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if inner.epoch != self.epoch {
            return Poll::Ready(None);
        }
        // Pausing holds back data and everything queued behind it, so
        // events keep their arrival order.
        let deliverable = match inner.queue.front() {
            Some(SourceEvent::Data(_)) => !inner.paused,
            Some(_) => true,
            None => false,
        };
        if deliverable {
            return Poll::Ready(inner.queue.pop_front());
        }
        inner.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn expect_data(subscription: &mut Subscription) -> Bytes {
        match subscription.next_event().await {
            Some(SourceEvent::Data(bytes)) => bytes,
            other => panic!("expected a data event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn paused_writes_are_held_until_resume() {
        let mut source = MemorySource::new();
        let mut subscription = source.subscribe();

        source.pause();
        source.write(vec![1u8]);
        source.write(vec![2u8]);
        source.resume();

        assert_eq!(&expect_data(&mut subscription).await[..], &[1]);
        assert_eq!(&expect_data(&mut subscription).await[..], &[2]);
    }

    #[tokio::test]
    async fn pause_holds_back_undelivered_chunks() {
        let mut source = MemorySource::new();
        let mut subscription = source.subscribe();

        source.write(vec![1u8]);
        source.write(vec![2u8]);
        assert_eq!(&expect_data(&mut subscription).await[..], &[1]);

        // The second chunk was queued but never polled out; pausing keeps
        // it in the source.
        source.pause();
        source.unshift(Bytes::from_static(&[9]));
        source.resume();

        assert_eq!(&expect_data(&mut subscription).await[..], &[9]);
        assert_eq!(&expect_data(&mut subscription).await[..], &[2]);
    }

    #[tokio::test]
    async fn unshifted_bytes_are_redelivered_first() {
        let mut source = MemorySource::new();
        let mut subscription = source.subscribe();

        source.pause();
        source.write(vec![3u8, 4]);
        source.unshift(Bytes::from_static(&[1, 2]));
        source.resume();

        assert_eq!(&expect_data(&mut subscription).await[..], &[1, 2]);
        assert_eq!(&expect_data(&mut subscription).await[..], &[3, 4]);
    }

    #[tokio::test]
    async fn dropped_subscriber_does_not_lose_chunks() {
        let mut source = MemorySource::new();
        let subscription = source.subscribe();
        subscription.cancel();

        source.write(vec![7u8, 8]);

        let mut replacement = source.subscribe();
        assert_eq!(&expect_data(&mut replacement).await[..], &[7, 8]);
    }

    #[tokio::test]
    async fn replaced_subscriber_sees_end_of_feed() {
        let mut source = MemorySource::new();
        let mut first = source.subscribe();
        let _second = source.subscribe();

        assert!(first.next_event().await.is_none());
    }

    #[test]
    fn timeout_support_is_optional() {
        let mut source = MemorySource::without_timeout();
        assert!(!source.arm_timeout(Duration::from_millis(100)));

        let mut source = MemorySource::new();
        assert!(source.arm_timeout(Duration::from_millis(100)));
        assert_eq!(source.armed_timeout(), Some(Duration::from_millis(100)));
    }

    #[tokio::test]
    async fn fire_timeout_requires_an_armed_deadline() {
        let mut source = MemorySource::new();
        let mut subscription = source.subscribe();

        source.fire_timeout();
        assert_eq!(source.armed_timeout(), None);

        source.arm_timeout(Duration::from_millis(5));
        source.fire_timeout();
        assert!(matches!(
            subscription.next_event().await,
            Some(SourceEvent::TimedOut)
        ));
        assert_eq!(source.armed_timeout(), None);
    }
}
