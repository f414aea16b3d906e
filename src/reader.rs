//! Buffered reading against a push-based chunk source
//!
//! [`BufferedReader`] accumulates chunks as the source delivers them and
//! resolves each read request with exactly the requested number of bytes.
//! All state transitions run on one logical task: the four inputs (a `read`
//! call plus the three [`SourceEvent`] kinds) each produce a deterministic
//! transition over the current read state, so no locking is involved.

use crate::error::ReadError;
use crate::source::{ChunkSource, SourceEvent, Subscription};
use bytes::{Bytes, BytesMut};
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;

/// Completion handle for a single read request.
///
/// Resolves to the requested bytes, or to the [`ReadError`] that aborted the
/// read. Await it directly, or poll it with [`ReadHandle::try_resolve`]
/// while dispatching source events by hand.
pub struct ReadHandle {
    reply: oneshot::Receiver<Result<Bytes, ReadError>>,
}

impl ReadHandle {
    fn channel() -> (oneshot::Sender<Result<Bytes, ReadError>>, ReadHandle) {
        let (tx, rx) = oneshot::channel();
        (tx, ReadHandle { reply: rx })
    }

    fn resolved(result: Result<Bytes, ReadError>) -> ReadHandle {
        let (tx, handle) = Self::channel();
        let _ = tx.send(result);
        handle
    }

    /// Check for a result without waiting.
    pub fn try_resolve(&mut self) -> Option<Result<Bytes, ReadError>> {
        match self.reply.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(ReadError::ReaderClosed)),
        }
    }
}

impl Future for ReadHandle {
    type Output = Result<Bytes, ReadError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.reply).poll(cx).map(|result| match result {
            Ok(resolution) => resolution,
            // The reader was dropped with the read still pending.
            Err(_) => Err(ReadError::ReaderClosed),
        })
    }
}

enum ReadState {
    /// No read outstanding; arriving chunks accumulate for a future read.
    Idle,
    /// Exactly one read waiting for enough bytes.
    Pending(PendingRead),
    /// The subscription was revoked after a timeout, a source closure, or an
    /// explicit close. Every later read fails fast.
    Terminated,
}

struct PendingRead {
    count: usize,
    reply: oneshot::Sender<Result<Bytes, ReadError>>,
}

/// Buffered reader over a push-based chunk source.
///
/// The source delivers bytes in arbitrarily sized chunks on its own
/// schedule; the reader buffers them and hands out exactly the requested
/// byte count per read, in arrival order. Bytes beyond a requested count are
/// pushed back onto the source so the next read sees them first. At most one
/// read may be outstanding at a time.
///
/// Flow control follows demand: the source is paused on construction and
/// whenever a read is satisfied, and resumed only while a read is waiting,
/// so the accumulator does not grow while nobody is reading.
pub struct BufferedReader<S: ChunkSource> {
    source: S,
    subscription: Option<Subscription>,
    buf: BytesMut,
    state: ReadState,
}

impl<S: ChunkSource> BufferedReader<S> {
    /// Wrap a source, pausing it and registering for its events.
    pub fn new(mut source: S) -> Self {
        source.pause();
        let subscription = source.subscribe();
        Self {
            source,
            subscription: Some(subscription),
            buf: BytesMut::new(),
            state: ReadState::Idle,
        }
    }

    /// Request exactly `count` bytes.
    ///
    /// The returned handle resolves as soon as enough bytes are available,
    /// which may be immediately: a zero-length read always resolves with an
    /// empty buffer, and a read the accumulator can already satisfy is
    /// served synchronously, leaving the remainder buffered.
    ///
    /// With a `timeout`, the deadline is armed on the source; a source
    /// without deadline support gets a logged warning and the read proceeds
    /// without one. A read issued while another is outstanding resolves with
    /// [`ReadError::ConcurrentRead`] on its own handle, leaving the first
    /// read undisturbed.
    pub fn read(&mut self, count: usize, timeout: Option<Duration>) -> ReadHandle {
        match &self.state {
            ReadState::Terminated => return ReadHandle::resolved(Err(ReadError::ReaderClosed)),
            ReadState::Pending(_) => return ReadHandle::resolved(Err(ReadError::ConcurrentRead)),
            ReadState::Idle => {}
        }

        if count == 0 {
            return ReadHandle::resolved(Ok(Bytes::new()));
        }
        if self.buf.len() >= count {
            return ReadHandle::resolved(Ok(self.buf.split_to(count).freeze()));
        }

        let (reply, handle) = ReadHandle::channel();
        self.state = ReadState::Pending(PendingRead { count, reply });
        if let Some(after) = timeout {
            if !self.source.arm_timeout(after) {
                log::warn!("source does not support timeouts; reading without a deadline");
            }
        }
        self.source.resume();
        handle
    }

    /// Dispatch one source event against the current state.
    ///
    /// [`resolve`](Self::resolve) pumps the reader's own subscription
    /// through this method; it is public for callers that drive the event
    /// feed themselves. A terminated reader ignores events.
    pub fn handle_event(&mut self, event: SourceEvent) {
        if matches!(self.state, ReadState::Terminated) {
            return;
        }
        match event {
            SourceEvent::Data(chunk) => self.on_data(chunk),
            SourceEvent::TimedOut => self.on_timeout(),
            SourceEvent::Closed => self.on_close(),
        }
    }

    /// Drive the event feed until `handle` resolves.
    pub async fn resolve(&mut self, mut handle: ReadHandle) -> Result<Bytes, ReadError> {
        loop {
            if let Some(result) = handle.try_resolve() {
                return result;
            }
            let event = match self.subscription.as_mut() {
                Some(subscription) => subscription.next_event().await,
                None => None,
            };
            match event {
                Some(event) => self.handle_event(event),
                None => return Err(ReadError::ReaderClosed),
            }
        }
    }

    /// Request exactly `count` bytes and drive the event feed until they
    /// arrive.
    pub async fn read_bytes(
        &mut self,
        count: usize,
        timeout: Option<Duration>,
    ) -> Result<Bytes, ReadError> {
        let handle = self.read(count, timeout);
        self.resolve(handle).await
    }

    /// Tear the reader down: halt delivery, revoke the subscription, and
    /// discard buffered bytes. A read pending at this point resolves with
    /// [`ReadError::Closed`].
    pub fn close(&mut self) {
        self.source.pause();
        self.detach();
        self.buf.clear();
        if let ReadState::Pending(pending) = mem::replace(&mut self.state, ReadState::Terminated) {
            let _ = pending.reply.send(Err(ReadError::Closed));
        }
    }

    /// Whether the reader has reached its terminal state.
    pub fn is_closed(&self) -> bool {
        matches!(self.state, ReadState::Terminated)
    }

    /// Access the underlying source.
    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    fn on_data(&mut self, chunk: Bytes) {
        self.buf.extend_from_slice(&chunk);

        let count = match &self.state {
            ReadState::Pending(pending) => pending.count,
            _ => return,
        };
        if self.buf.len() < count {
            // Still waiting for more data before the read can be satisfied.
            return;
        }

        self.source.pause();
        let requested = self.buf.split_to(count).freeze();
        let excess = self.buf.split().freeze();
        if !excess.is_empty() {
            // Over-delivery goes back to the source, making it the next
            // data seen by whatever consumes the source after this read.
            self.source.unshift(excess);
        }
        if let ReadState::Pending(pending) = mem::replace(&mut self.state, ReadState::Idle) {
            let _ = pending.reply.send(Ok(requested));
        }
    }

    fn on_timeout(&mut self) {
        self.detach();
        match mem::replace(&mut self.state, ReadState::Terminated) {
            ReadState::Pending(pending) => {
                if !self.buf.is_empty() {
                    // The read failed, but the bytes are not lost: hand
                    // them back to the source.
                    let held = self.buf.split().freeze();
                    self.source.unshift(held);
                }
                let _ = pending.reply.send(Err(ReadError::Timeout));
            }
            // The deadline is only armed while a read is outstanding.
            _ => log::error!("timeout fired with no read pending"),
        }
    }

    fn on_close(&mut self) {
        self.detach();
        self.buf.clear();
        if let ReadState::Pending(pending) = mem::replace(&mut self.state, ReadState::Terminated) {
            let _ = pending.reply.send(Err(ReadError::Closed));
        }
    }

    fn detach(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;

    #[tokio::test]
    async fn zero_length_read_resolves_immediately() {
        let mut reader = BufferedReader::new(MemorySource::new());
        let mut handle = reader.read(0, None);
        assert_eq!(handle.try_resolve(), Some(Ok(Bytes::new())));
    }

    #[tokio::test]
    async fn idle_chunks_accumulate_for_the_next_read() {
        let mut reader = BufferedReader::new(MemorySource::new());
        reader.handle_event(SourceEvent::Data(Bytes::from_static(&[0, 1, 2, 3, 4])));

        let mut handle = reader.read(3, None);
        assert_eq!(handle.try_resolve(), Some(Ok(Bytes::from_static(&[0, 1, 2]))));

        // The remainder stayed buffered rather than being pushed back.
        let mut rest = reader.read(2, None);
        assert_eq!(rest.try_resolve(), Some(Ok(Bytes::from_static(&[3, 4]))));
    }

    #[tokio::test]
    async fn second_read_fails_without_disturbing_the_first() {
        let source = MemorySource::new();
        let mut reader = BufferedReader::new(source.clone());

        let first = reader.read(4, None);
        let mut second = reader.read(1, None);
        assert_eq!(second.try_resolve(), Some(Err(ReadError::ConcurrentRead)));

        source.write(vec![9u8, 8, 7, 6]);
        let bytes = reader.resolve(first).await.unwrap();
        assert_eq!(&bytes[..], &[9, 8, 7, 6]);
    }

    #[tokio::test]
    async fn reads_after_close_fail_fast() {
        let mut reader = BufferedReader::new(MemorySource::new());
        reader.close();
        assert!(reader.is_closed());

        let mut handle = reader.read(1, None);
        assert_eq!(handle.try_resolve(), Some(Err(ReadError::ReaderClosed)));
    }

    #[tokio::test]
    async fn stray_timeout_terminates_without_panicking() {
        let mut reader = BufferedReader::new(MemorySource::new());
        reader.handle_event(SourceEvent::TimedOut);
        assert!(reader.is_closed());

        // Terminated readers ignore later events.
        reader.handle_event(SourceEvent::Data(Bytes::from_static(&[1])));
        let mut handle = reader.read(1, None);
        assert_eq!(handle.try_resolve(), Some(Err(ReadError::ReaderClosed)));
    }
}
