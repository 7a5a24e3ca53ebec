use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{Instrument, Span, debug};

use super::driver::Event;
use crate::{Frame, LinkTx};

/// Queue of frames bound for the writer task.
///
/// Bytes count as buffered from the moment they are queued until the
/// transport accepts them.
#[derive(Debug)]
pub(crate) struct Outbox {
    frames: mpsc::UnboundedSender<Frame>,
    buffered: Arc<AtomicUsize>,
    drain_wanted: Arc<AtomicBool>,
    low_water: usize,
    events: mpsc::UnboundedSender<Event>,
}

impl Outbox {
    pub(crate) fn spawn<T: LinkTx>(
        tx: T,
        low_water: usize,
        events: mpsc::UnboundedSender<Event>,
        span: Span,
    ) -> (Self, JoinHandle<()>) {
        let (frames, queue) = mpsc::unbounded_channel();
        let buffered = Arc::new(AtomicUsize::new(0));
        let drain_wanted = Arc::new(AtomicBool::new(false));
        let writer = Writer {
            tx,
            queue,
            buffered: Arc::clone(&buffered),
            drain_wanted: Arc::clone(&drain_wanted),
            low_water,
            events: events.clone(),
        };
        let task = tokio::spawn(writer.run().instrument(span));
        (
            Self {
                frames,
                buffered,
                drain_wanted,
                low_water,
                events,
            },
            task,
        )
    }

    pub(crate) fn buffered(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    /// Emit [`Event::Drained`] the next time the buffer falls below the
    /// low-water mark.
    pub(crate) fn want_drain(&self) {
        self.drain_wanted.store(true, Ordering::Release);
        // The writer may have emptied the buffer before seeing the flag.
        if self.buffered() < self.low_water && self.drain_wanted.swap(false, Ordering::AcqRel) {
            let _ = self.events.send(Event::Drained);
        }
    }

    pub(crate) fn send_bytes(&self, bytes: Bytes) {
        self.send_frame(Frame::Binary(bytes));
    }

    pub(crate) fn send_frame(&self, frame: Frame) {
        let len = frame.payload_len();
        self.buffered.fetch_add(len, Ordering::AcqRel);
        if self.frames.send(frame).is_err() {
            self.buffered.fetch_sub(len, Ordering::AcqRel);
        }
    }
}

struct Writer<T> {
    tx: T,
    queue: mpsc::UnboundedReceiver<Frame>,
    buffered: Arc<AtomicUsize>,
    drain_wanted: Arc<AtomicBool>,
    low_water: usize,
    events: mpsc::UnboundedSender<Event>,
}

impl<T: LinkTx> Writer<T> {
    async fn run(mut self) {
        while let Some(frame) = self.queue.recv().await {
            let len = frame.payload_len();
            let is_close = matches!(frame, Frame::Close(_));
            if let Err(err) = self.tx.send(frame).await {
                debug!(%err, "transport write failed");
                let _ = self.events.send(Event::WriteFailed(err.to_string()));
                return;
            }
            let left = self.buffered.fetch_sub(len, Ordering::AcqRel) - len;
            if left < self.low_water && self.drain_wanted.swap(false, Ordering::AcqRel) {
                let _ = self.events.send(Event::Drained);
            }
            if is_close {
                break;
            }
        }
        let _ = self.tx.close().await;
    }
}
