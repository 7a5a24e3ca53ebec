//! Local stream primitive.
//!
//! A stream is an open-ended sequence of either octets or structured values.
//! Locally produced streams are created with [`octets`] or [`objects`], which
//! return the producing [`StreamWriter`] and a [`StreamHandle`] that can be
//! placed inside a [`Value`] and sent to a peer.
//!
//! Streams received from a peer are materialized by the codec as unattached
//! handles ([`StreamHandle::incoming`]); the connection then attaches a
//! [`StreamObserver`] to learn how fast the application consumes them.
//!
//! Only one consumer may read a stream. Taking the [`StreamReader`] locks the
//! handle, and a locked stream can no longer be sent or cancelled through the
//! handle.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::Notify;

use crate::{ErrorValue, Value};

/// Default pipe capacity for local octet streams, in bytes.
pub const DEFAULT_OCTET_CAPACITY: usize = 64 * 1024;

/// Default pipe capacity for local object streams, in values.
pub const DEFAULT_OBJECT_CAPACITY: usize = 16;

const PREMATURE_CLOSE: &str = "Stream was closed prematurely";
const CANCELLED: &str = "Stream was cancelled";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamMode {
    Octets,
    Objects,
}

/// One unit of stream payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Chunk {
    Octets(Bytes),
    Object(Value),
}

impl From<Bytes> for Chunk {
    fn from(bytes: Bytes) -> Self {
        Chunk::Octets(bytes)
    }
}

impl From<Vec<u8>> for Chunk {
    fn from(bytes: Vec<u8>) -> Self {
        Chunk::Octets(Bytes::from(bytes))
    }
}

impl From<&'static [u8]> for Chunk {
    fn from(bytes: &'static [u8]) -> Self {
        Chunk::Octets(Bytes::from_static(bytes))
    }
}

impl From<Value> for Chunk {
    fn from(value: Value) -> Self {
        Chunk::Object(value)
    }
}

/// Receives consumption and cancellation notices for an incoming stream.
///
/// Callbacks run on the reader's task, outside of any stream lock.
pub trait StreamObserver: Send + Sync + 'static {
    /// The reader took `bytes` worth of buffered data.
    fn consumed(&self, bytes: usize);

    /// The consumer abandoned the stream.
    fn cancelled(&self);
}

/// Returned by writes to a stream whose consumer has gone away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("stream was cancelled by its consumer")]
pub struct StreamCancelled;

struct State {
    queue: VecDeque<(Chunk, usize)>,
    buffered: usize,
    finished: bool,
    failure: Option<ErrorValue>,
    cancelled: bool,
    drained: bool,
    locked: bool,
    attached: bool,
    observer: Option<Arc<dyn StreamObserver>>,
}

struct Core {
    mode: StreamMode,
    wire_id: Option<u32>,
    capacity: usize,
    state: Mutex<State>,
    readable: Notify,
    writable: Notify,
}

impl Core {
    fn new(mode: StreamMode, wire_id: Option<u32>, capacity: usize, attached: bool) -> Arc<Self> {
        Arc::new(Self {
            mode,
            wire_id,
            capacity,
            state: Mutex::new(State {
                queue: VecDeque::new(),
                buffered: 0,
                finished: false,
                failure: None,
                cancelled: false,
                drained: false,
                locked: false,
                attached,
                observer: None,
            }),
            readable: Notify::new(),
            writable: Notify::new(),
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop everything buffered and mark the stream cancelled. Returns the
    /// observer to notify, if this call did the cancelling.
    fn cancel(&self) -> Option<Option<Arc<dyn StreamObserver>>> {
        let observer = {
            let mut st = self.state();
            if st.cancelled || st.drained {
                return None;
            }
            st.cancelled = true;
            st.queue.clear();
            st.buffered = 0;
            st.observer.take()
        };
        self.writable.notify_waiters();
        self.readable.notify_waiters();
        Some(observer)
    }
}

/// Create a local octet stream with the default capacity.
pub fn octets() -> (StreamWriter, StreamHandle) {
    octets_with_capacity(DEFAULT_OCTET_CAPACITY)
}

/// Create a local octet stream whose writer blocks once `capacity` bytes are
/// buffered.
pub fn octets_with_capacity(capacity: usize) -> (StreamWriter, StreamHandle) {
    local(StreamMode::Octets, capacity)
}

/// Create a local object stream with the default capacity.
pub fn objects() -> (StreamWriter, StreamHandle) {
    objects_with_capacity(DEFAULT_OBJECT_CAPACITY)
}

/// Create a local object stream whose writer blocks once `capacity` values
/// are buffered.
pub fn objects_with_capacity(capacity: usize) -> (StreamWriter, StreamHandle) {
    local(StreamMode::Objects, capacity)
}

fn local(mode: StreamMode, capacity: usize) -> (StreamWriter, StreamHandle) {
    let core = Core::new(mode, None, capacity.max(1), true);
    (
        StreamWriter {
            core: Arc::clone(&core),
            done: false,
        },
        StreamHandle { core },
    )
}

/// A reference to a stream, cheap to clone and embeddable in a [`Value`].
#[derive(Clone)]
pub struct StreamHandle {
    core: Arc<Core>,
}

impl StreamHandle {
    /// An unattached stream announced by a peer under `wire_id`.
    pub fn incoming(mode: StreamMode, wire_id: u32) -> Self {
        Self {
            core: Core::new(mode, Some(wire_id), usize::MAX, false),
        }
    }

    pub fn mode(&self) -> StreamMode {
        self.core.mode
    }

    pub fn is_octets(&self) -> bool {
        self.core.mode == StreamMode::Octets
    }

    /// The ID this stream was announced under, for streams received from a
    /// peer.
    pub fn wire_id(&self) -> Option<u32> {
        self.core.wire_id
    }

    /// Whether a reader has been taken.
    pub fn is_locked(&self) -> bool {
        self.core.state().locked
    }

    pub fn is_cancelled(&self) -> bool {
        self.core.state().cancelled
    }

    pub fn same_stream(&self, other: &StreamHandle) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }

    /// Lock the stream and return its only reader.
    ///
    /// Returns `None` if the stream is already locked.
    pub fn reader(&self) -> Option<StreamReader> {
        let mut st = self.core.state();
        if st.locked {
            return None;
        }
        st.locked = true;
        Some(StreamReader {
            core: Arc::clone(&self.core),
        })
    }

    /// Cancel the stream unless a reader holds it.
    pub fn cancel(&self) {
        if self.is_locked() {
            return;
        }
        if let Some(Some(observer)) = self.core.cancel() {
            observer.cancelled();
        }
    }

    /// Attach the feeding side of an incoming stream.
    ///
    /// The returned writer never blocks: memory for incoming streams is
    /// bounded by flow control, not by the pipe. Returns `None` if the stream
    /// was already attached.
    pub fn attach(&self, observer: Arc<dyn StreamObserver>) -> Option<StreamWriter> {
        let mut st = self.core.state();
        if st.attached {
            return None;
        }
        st.attached = true;
        st.observer = Some(observer);
        Some(StreamWriter {
            core: Arc::clone(&self.core),
            done: false,
        })
    }
}

impl PartialEq for StreamHandle {
    fn eq(&self, other: &Self) -> bool {
        self.same_stream(other)
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("mode", &self.core.mode)
            .field("wire_id", &self.core.wire_id)
            .finish_non_exhaustive()
    }
}

/// The producing side of a stream.
///
/// Dropping a writer without calling [`finish`](Self::finish) or
/// [`fail`](Self::fail) ends the stream with an error.
pub struct StreamWriter {
    core: Arc<Core>,
    done: bool,
}

impl StreamWriter {
    pub fn mode(&self) -> StreamMode {
        self.core.mode
    }

    /// Append data, waiting while the stream is at capacity.
    pub async fn write(&self, chunk: impl Into<Chunk>) -> Result<(), StreamCancelled> {
        let chunk = chunk.into();
        let size = self.size_of(&chunk);
        let mut chunk = Some(chunk);
        loop {
            let notified = self.core.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.core.state();
                if st.cancelled {
                    return Err(StreamCancelled);
                }
                if st.buffered < self.core.capacity || st.queue.is_empty() {
                    if let Some(chunk) = chunk.take() {
                        st.buffered += size;
                        st.queue.push_back((chunk, size));
                    }
                    drop(st);
                    self.core.readable.notify_waiters();
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Append data without waiting, accounting it as `size` bytes.
    pub fn push(&self, chunk: Chunk, size: usize) -> Result<(), StreamCancelled> {
        {
            let mut st = self.core.state();
            if st.cancelled {
                return Err(StreamCancelled);
            }
            st.buffered += size;
            st.queue.push_back((chunk, size));
        }
        self.core.readable.notify_waiters();
        Ok(())
    }

    /// Bytes (or values, for local object streams) not yet taken by the
    /// reader.
    pub fn buffered(&self) -> usize {
        self.core.state().buffered
    }

    pub fn is_cancelled(&self) -> bool {
        self.core.state().cancelled
    }

    /// Resolves once the consumer has cancelled the stream.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.core.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.core.state().cancelled {
                return;
            }
            notified.await;
        }
    }

    /// End the stream. The reader sees the end after draining what is
    /// buffered.
    pub fn finish(mut self) {
        self.done = true;
        self.core.state().finished = true;
        self.core.readable.notify_waiters();
    }

    /// Fail the stream, discarding anything still buffered.
    pub fn fail(mut self, err: ErrorValue) {
        self.done = true;
        self.set_failure(err);
    }

    fn set_failure(&self, err: ErrorValue) {
        {
            let mut st = self.core.state();
            if st.finished || st.failure.is_some() {
                return;
            }
            st.queue.clear();
            st.buffered = 0;
            st.failure = Some(err);
        }
        self.core.readable.notify_waiters();
    }

    fn size_of(&self, chunk: &Chunk) -> usize {
        match chunk {
            Chunk::Octets(bytes) => bytes.len(),
            Chunk::Object(_) => 1,
        }
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        if !self.done {
            self.set_failure(ErrorValue::new(PREMATURE_CLOSE));
        }
    }
}

impl fmt::Debug for StreamWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamWriter")
            .field("mode", &self.core.mode)
            .finish_non_exhaustive()
    }
}

/// The consuming side of a stream. Dropping it early cancels the stream.
pub struct StreamReader {
    core: Arc<Core>,
}

impl StreamReader {
    pub fn mode(&self) -> StreamMode {
        self.core.mode
    }

    /// The next chunk, the stream's error, or `None` once it has ended.
    pub async fn next(&mut self) -> Option<Result<Chunk, ErrorValue>> {
        loop {
            let notified = self.core.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.core.state();
                if st.drained {
                    return None;
                }
                if let Some(err) = st.failure.take() {
                    st.drained = true;
                    return Some(Err(err));
                }
                if st.cancelled {
                    st.drained = true;
                    return Some(Err(ErrorValue::new(CANCELLED)));
                }
                if let Some((chunk, size)) = st.queue.pop_front() {
                    st.buffered -= size;
                    let observer = st.observer.clone();
                    drop(st);
                    self.core.writable.notify_waiters();
                    if let Some(observer) = observer {
                        observer.consumed(size);
                    }
                    return Some(Ok(chunk));
                }
                if st.finished {
                    st.drained = true;
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Read an octet stream to its end.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, ErrorValue> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next().await {
            match chunk? {
                Chunk::Octets(bytes) => out.extend_from_slice(&bytes),
                Chunk::Object(_) => return Err(ErrorValue::new("Expected an octet stream")),
            }
        }
        Ok(out)
    }

    /// Abandon the stream, dropping anything buffered.
    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        if self.core.state().drained {
            return;
        }
        if let Some(Some(observer)) = self.core.cancel() {
            observer.cancelled();
        }
    }
}

impl fmt::Debug for StreamReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamReader")
            .field("mode", &self.core.mode)
            .finish_non_exhaustive()
    }
}
