use bluerpc_types::{Chunk, ErrorValue, Message, StreamMode, StreamReader, Value};
use bluerpc_wire::Codec;
use bytes::{Bytes, BytesMut};
use tokio::sync::watch;
use tracing::trace;

use super::Outbound;
use crate::CancellationToken;

/// What the pump task read from a local stream.
#[derive(Debug)]
pub(crate) enum SourceItem {
    Data(Chunk),
    End,
    Error(ErrorValue),
}

/// Connection-side controls for a pump task.
#[derive(Debug)]
pub(crate) struct SourceControl {
    paused: watch::Sender<bool>,
    stop: CancellationToken,
}

/// Pump-side view of a [`SourceControl`].
#[derive(Debug)]
pub(crate) struct SourceSignals {
    paused: watch::Receiver<bool>,
    stop: CancellationToken,
}

impl SourceControl {
    /// A control that starts paused: nothing is read until the receiver
    /// grants a window.
    pub(crate) fn new() -> (Self, SourceSignals) {
        let (paused, paused_rx) = watch::channel(true);
        let stop = CancellationToken::new();
        (
            Self {
                paused,
                stop: stop.clone(),
            },
            SourceSignals {
                paused: paused_rx,
                stop,
            },
        )
    }

    fn pause(&self) {
        self.paused.send_replace(true);
    }

    fn resume(&self) {
        self.paused.send_replace(false);
    }

    fn stop(&self) {
        self.stop.cancel();
    }

    #[cfg(test)]
    pub(crate) fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }
}

/// Read `reader` on its own task, handing each item to `on_item`.
///
/// The task idles while paused and exits after the first terminal item or
/// once stopped. Stopping drops the reader, which cancels the local stream.
pub(crate) fn spawn_pump(
    mut reader: StreamReader,
    signals: SourceSignals,
    on_item: impl Fn(SourceItem) + Send + 'static,
) {
    let SourceSignals { mut paused, stop } = signals;
    tokio::spawn(async move {
        loop {
            loop {
                let is_paused = *paused.borrow_and_update();
                if !is_paused {
                    break;
                }
                tokio::select! {
                    changed = paused.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    _ = stop.cancelled() => return,
                }
            }
            let item = tokio::select! {
                _ = stop.cancelled() => return,
                item = reader.next() => item,
            };
            match item {
                Some(Ok(chunk)) => on_item(SourceItem::Data(chunk)),
                Some(Err(err)) => {
                    on_item(SourceItem::Error(err));
                    return;
                }
                None => {
                    on_item(SourceItem::End);
                    return;
                }
            }
        }
    });
}

/// Sending state for one outbound stream.
#[derive(Debug)]
pub(crate) struct StreamSender {
    stream_id: u32,
    serial: u64,
    mode: StreamMode,
    control: SourceControl,
    ideal_chunk: usize,
    high_water: usize,
    pending: BytesMut,
    sent: u64,
    window: u64,
    paused: bool,
    ended: bool,
    done: bool,
}

impl StreamSender {
    pub(crate) fn new(
        stream_id: u32,
        serial: u64,
        mode: StreamMode,
        control: SourceControl,
        ideal_chunk: usize,
        high_water: usize,
    ) -> Self {
        Self {
            stream_id,
            serial,
            mode,
            control,
            ideal_chunk,
            high_water,
            pending: BytesMut::new(),
            sent: 0,
            window: 0,
            paused: true,
            ended: false,
            done: false,
        }
    }

    pub(crate) fn serial(&self) -> u64 {
        self.serial
    }

    /// Handle one item from the pump. Returns `true` once the stream is
    /// finished and can be forgotten.
    pub(crate) fn on_item(
        &mut self,
        item: SourceItem,
        codec: &Codec,
        out: &mut impl Outbound,
    ) -> bool {
        if self.done {
            return true;
        }
        match item {
            SourceItem::Data(chunk) => self.on_data(chunk, codec, out),
            SourceItem::End => {
                self.ended = true;
                if !self.should_pause(out) {
                    self.flush(out);
                }
                self.finish_if_drained(out);
            }
            SourceItem::Error(err) => self.abort(&err, out),
        }
        self.done
    }

    fn on_data(&mut self, chunk: Chunk, codec: &Codec, out: &mut impl Outbound) {
        match self.mode {
            StreamMode::Octets => {
                let bytes = match chunk {
                    Chunk::Octets(bytes) | Chunk::Object(Value::Bytes(bytes)) => bytes,
                    Chunk::Object(Value::Str(text)) => Bytes::from(text),
                    Chunk::Object(_) => {
                        let err = ErrorValue::new("Octet streams only carry bytes or strings");
                        return self.abort(&err, out);
                    }
                };
                self.pending.extend_from_slice(&bytes);
                self.flush(out);
            }
            StreamMode::Objects => {
                let value = match chunk {
                    Chunk::Object(value) => value,
                    Chunk::Octets(bytes) => Value::Bytes(bytes),
                };
                match codec.encode_inert(&value) {
                    Ok(bytes) => {
                        self.send_data(bytes, out);
                    }
                    Err(err) => self.abort(&ErrorValue::from_error(&err), out),
                }
            }
        }
    }

    /// The receiver advertised a new window.
    pub(crate) fn signal(
        &mut self,
        received_kib: u64,
        available_kib: u64,
        out: &mut impl Outbound,
    ) -> bool {
        let window = received_kib.saturating_add(available_kib).saturating_mul(1024);
        trace!(
            stream_id = self.stream_id,
            window,
            sent = self.sent,
            "stream signal"
        );
        self.window = window;
        self.resume_if_possible(out)
    }

    /// Re-check after the transport buffer drained or the window grew.
    /// Returns `true` once the stream is finished.
    pub(crate) fn resume_if_possible(&mut self, out: &mut impl Outbound) -> bool {
        if self.done {
            return true;
        }
        if self.should_pause(out) {
            self.pause(out);
            return false;
        }
        if self.paused {
            self.paused = false;
            self.control.resume();
        }
        self.flush(out);
        self.finish_if_drained(out);
        self.done
    }

    /// Stop without telling the peer, which asked for it or is gone.
    pub(crate) fn cancel(&mut self) {
        self.done = true;
        self.pending.clear();
        self.control.stop();
    }

    /// Stop and report `err` to the peer as the stream's failure.
    pub(crate) fn abort(&mut self, err: &ErrorValue, out: &mut impl Outbound) {
        if self.done {
            return;
        }
        self.cancel();
        out.send(Message::StreamChunkError {
            stream_id: self.stream_id,
            error: err.for_wire(),
        });
    }

    fn credit(&self) -> i128 {
        i128::from(self.window) - i128::from(self.sent)
    }

    fn should_pause(&self, out: &impl Outbound) -> bool {
        out.buffered_amount() >= self.high_water || self.credit() <= 0
    }

    fn pause(&mut self, out: &mut impl Outbound) {
        if out.buffered_amount() >= self.high_water {
            out.want_drain();
        }
        if !self.paused {
            self.paused = true;
            self.control.pause();
        }
    }

    fn flush(&mut self, out: &mut impl Outbound) {
        while !self.done && !self.pending.is_empty() {
            if self.should_pause(out) {
                self.pause(out);
                break;
            }
            let full = self.pending.len() >= self.ideal_chunk;
            if !full && !self.ended && out.buffered_amount() >= self.ideal_chunk {
                // Hold the tail to coalesce it, but not past the next drain.
                out.want_drain();
                break;
            }
            let credit = usize::try_from(self.credit()).unwrap_or(usize::MAX);
            let take = self.pending.len().min(self.ideal_chunk).min(credit);
            let data = self.pending.split_to(take).freeze();
            if !self.send_data(data, out) {
                break;
            }
        }
    }

    /// Send one data message. Returns `false` if the sender had to pause.
    fn send_data(&mut self, data: Bytes, out: &mut impl Outbound) -> bool {
        self.sent += data.len() as u64;
        out.send(Message::StreamChunkData {
            stream_id: self.stream_id,
            data,
        });
        if self.should_pause(out) {
            self.pause(out);
            return false;
        }
        true
    }

    fn finish_if_drained(&mut self, out: &mut impl Outbound) {
        if self.ended && !self.done && self.pending.is_empty() {
            self.done = true;
            self.control.stop();
            out.send(Message::StreamChunkEnd {
                stream_id: self.stream_id,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::testing::Recording;

    const KIB: usize = 1024;

    fn octet_sender() -> StreamSender {
        let (control, _signals) = SourceControl::new();
        StreamSender::new(1, 0, StreamMode::Octets, control, 64 * KIB, 512 * KIB)
    }

    fn data_sizes(out: &Recording) -> Vec<usize> {
        out.sent
            .iter()
            .filter_map(|m| match m {
                Message::StreamChunkData { data, .. } => Some(data.len()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn nothing_flows_before_the_first_signal() {
        let codec = Codec::new();
        let mut out = Recording::default();
        let mut sender = octet_sender();
        assert!(sender.control.is_paused());

        sender.on_item(SourceItem::Data(Chunk::from(vec![0u8; 1000])), &codec, &mut out);
        assert!(out.sent.is_empty());

        sender.signal(0, 8, &mut out);
        assert_eq!(data_sizes(&out), vec![1000]);
        assert!(!sender.control.is_paused());
    }

    #[test]
    fn the_window_caps_bytes_in_flight() {
        let codec = Codec::new();
        let mut out = Recording::default();
        let mut sender = octet_sender();
        sender.signal(0, 128, &mut out);

        sender.on_item(SourceItem::Data(Chunk::from(vec![0u8; 256 * KIB])), &codec, &mut out);
        assert_eq!(data_sizes(&out), vec![64 * KIB, 64 * KIB]);
        assert!(sender.control.is_paused());

        out.buffered = 0;
        sender.signal(128, 128, &mut out);
        assert_eq!(data_sizes(&out).len(), 4);
        assert!(sender.control.is_paused());
    }

    #[test]
    fn a_full_transport_buffer_pauses_and_asks_for_drain() {
        let codec = Codec::new();
        let mut out = Recording::default();
        let mut sender = octet_sender();
        sender.signal(0, 64 * 1024, &mut out);

        sender.on_item(SourceItem::Data(Chunk::from(vec![0u8; 600 * KIB])), &codec, &mut out);
        assert_eq!(data_sizes(&out).len(), 8);
        assert!(out.wants_drain);
        assert!(sender.control.is_paused());

        out.buffered = 0;
        sender.resume_if_possible(&mut out);
        assert_eq!(data_sizes(&out).iter().sum::<usize>(), 576 * KIB);

        assert!(sender.on_item(SourceItem::End, &codec, &mut out));
        assert_eq!(data_sizes(&out).iter().sum::<usize>(), 600 * KIB);
    }

    #[test]
    fn small_tail_waits_for_end_then_flushes() {
        let codec = Codec::new();
        let mut out = Recording::default();
        let mut sender = octet_sender();
        sender.signal(0, 1024, &mut out);
        out.buffered = 128 * KIB;

        sender.on_item(SourceItem::Data(Chunk::from(vec![0u8; 10])), &codec, &mut out);
        assert!(out.sent.is_empty());
        assert!(out.wants_drain);

        assert!(sender.on_item(SourceItem::End, &codec, &mut out));
        assert_eq!(data_sizes(&out), vec![10]);
        assert_eq!(out.sent.last(), Some(&Message::StreamChunkEnd { stream_id: 1 }));
    }

    #[test]
    fn small_tail_goes_out_when_the_transport_drains() {
        let codec = Codec::new();
        let mut out = Recording::default();
        let mut sender = octet_sender();
        sender.signal(0, 8192, &mut out);
        out.buffered = 128 * KIB;

        sender.on_item(SourceItem::Data(Chunk::from(vec![0u8; 10])), &codec, &mut out);
        assert!(out.sent.is_empty());
        assert!(out.wants_drain);
        assert!(!sender.control.is_paused());

        out.buffered = 0;
        out.wants_drain = false;
        assert!(!sender.resume_if_possible(&mut out));
        assert_eq!(data_sizes(&out), vec![10]);
        assert!(!out.wants_drain);
    }

    #[test]
    fn source_failure_is_reported_once() {
        let codec = Codec::new();
        let mut out = Recording::default();
        let mut sender = octet_sender();
        sender.on_item(SourceItem::Data(Chunk::from(vec![1u8; 10])), &codec, &mut out);

        let err = ErrorValue::new("disk on fire").with_field("path", "/tmp");
        assert!(sender.on_item(SourceItem::Error(err), &codec, &mut out));
        assert!(sender.on_item(SourceItem::End, &codec, &mut out));

        assert_eq!(out.sent.len(), 1);
        match &out.sent[0] {
            Message::StreamChunkError { stream_id, error } => {
                assert_eq!(*stream_id, 1);
                assert_eq!(error.message(), "disk on fire");
                assert!(error.fields().is_empty());
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn object_values_become_one_chunk_each() {
        let codec = Codec::new();
        let mut out = Recording::default();
        let (control, _signals) = SourceControl::new();
        let mut sender = StreamSender::new(3, 0, StreamMode::Objects, control, 64 * KIB, 512 * KIB);
        sender.signal(0, 1, &mut out);

        sender.on_item(SourceItem::Data(Chunk::from(Value::from("a"))), &codec, &mut out);
        sender.on_item(SourceItem::Data(Chunk::from(Value::from(2))), &codec, &mut out);
        assert_eq!(data_sizes(&out).len(), 2);

        let (_writer, handle) = bluerpc_types::stream::octets();
        sender.on_item(SourceItem::Data(Chunk::from(Value::from(handle))), &codec, &mut out);
        assert!(matches!(
            out.sent.last(),
            Some(Message::StreamChunkError { stream_id: 3, .. })
        ));
    }

    #[tokio::test]
    async fn pump_waits_for_resume_and_stops_on_request() {
        use std::sync::{Arc, Mutex};

        let (writer, handle) = bluerpc_types::stream::octets();
        let (control, signals) = SourceControl::new();
        let items = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&items);
        spawn_pump(handle.reader().unwrap(), signals, move |item| {
            seen.lock().unwrap().push(format!("{item:?}"));
        });

        writer.write(Bytes::from_static(b"x")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(items.lock().unwrap().is_empty());

        control.resume();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(items.lock().unwrap().len(), 1);

        control.stop();
        writer.cancelled().await;
        assert!(handle.is_cancelled());
    }
}
