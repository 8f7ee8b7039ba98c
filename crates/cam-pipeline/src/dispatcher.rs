//! Result dispatch.
//!
//! [`ResultDispatcher`] turns frame progress into per-request callbacks on a
//! [`ResultSink`], in a fixed order per request:
//!
//! 1. one shutter, never ahead of an earlier request's shutter
//! 2. partial metadata
//! 3. one buffer delivery per target stream, tagged Ok or Error
//! 4. final metadata once every frame of the request completed
//!
//! Anything that arrives for a request before its shutter may be sent is queued on the
//! request's record and flushed right after the shutter. Every step is idempotent.
//!
//! A request record holds the request's pacing permit; retiring the record (final result
//! or error) releases it.

use cam_core::{
    CamError, CamResult, FrameNumber, RejectReason, RequestKey, ResultMetadata, SlotState,
    StreamId,
};
use cam_pool::Buffer;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tracing::{debug, info, trace, warn};

//==============================================================================
// Callback surface
//==============================================================================

/// Kind of error notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ErrorCode {
    /// The whole request failed before its shutter; no results follow except
    /// Error-tagged buffers
    Request,
    /// Metadata for the request is lost; buffers are still reported
    Result,
    /// One stream buffer failed
    Buffer,
}

/// Out-of-band notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notify {
    /// Start of exposure for the request
    Shutter {
        /// Request
        request: RequestKey,
        /// Frame that carried the timestamp
        frame_number: FrameNumber,
        /// Sensor timestamp
        timestamp_ns: u64,
    },
    /// Failure of a request, its metadata or one of its buffers
    Error {
        /// Request
        request: RequestKey,
        /// What failed
        code: ErrorCode,
        /// Stream, for [`ErrorCode::Buffer`]
        stream: Option<StreamId>,
    },
}

/// Outcome of one stream buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum BufferStatus {
    /// Buffer holds valid data
    Ok,
    /// Buffer content is invalid or missing
    Error,
}

/// One delivered stream buffer.
#[derive(Debug)]
pub struct StreamBuffer {
    /// Target stream
    pub stream: StreamId,
    /// Outcome
    pub status: BufferStatus,
    /// Buffer, handed to the caller on success
    pub buffer: Option<Buffer>,
}

/// One result callback.
///
/// `partial_index` is 1.. for partial metadata and 0 for buffer deliveries and the final
/// metadata.
#[derive(Debug)]
pub struct CaptureResult {
    /// Request
    pub request: RequestKey,
    /// Partial metadata counter
    pub partial_index: u32,
    /// Buffers delivered by this result
    pub buffers: Vec<StreamBuffer>,
    /// Metadata delivered by this result
    pub metadata: Option<ResultMetadata>,
}

impl CaptureResult {
    /// Final metadata of the request.
    #[must_use]
    pub fn is_final(&self) -> bool {
        self.partial_index == 0 && self.metadata.is_some()
    }

    /// Early metadata.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        self.partial_index > 0
    }
}

/// Receives callbacks for submitted requests.
///
/// Called with dispatcher locks held: implementations must not block and must not call
/// back into the session.
pub trait ResultSink: Send + Sync {
    /// Shutter or error notification.
    fn notify(&self, message: Notify);
    /// Buffers and / or metadata.
    fn deliver_result(&self, result: CaptureResult);
}

/// Anything a [`ChannelSink`] forwards.
#[derive(Debug)]
pub enum SessionEvent {
    /// Notification
    Notify(Notify),
    /// Result
    Result(CaptureResult),
}

/// Sink forwarding every callback to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelSink {
    /// Sink and the receiving end of its channel.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ResultSink for ChannelSink {
    fn notify(&self, message: Notify) {
        if self.tx.send(SessionEvent::Notify(message)).is_err() {
            trace!("Result receiver dropped");
        }
    }

    fn deliver_result(&self, result: CaptureResult) {
        if self.tx.send(SessionEvent::Result(result)).is_err() {
            trace!("Result receiver dropped");
        }
    }
}

//==============================================================================
// Per-request records
//==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shutter {
    Waiting,
    Ready {
        frame: FrameNumber,
        timestamp_ns: u64,
    },
    Sent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamProgress {
    Pending,
    Queued,
    Emitted,
}

enum Queued {
    Partial(ResultMetadata),
    Buffer(StreamBuffer),
    Final,
}

struct Record {
    seq: u64,
    streams: BTreeMap<StreamId, StreamProgress>,
    frames_expected: u32,
    frames_done: u32,
    shutter: Shutter,
    queued: Vec<Queued>,
    partials: u32,
    metadata: ResultMetadata,
    _permit: Option<OwnedSemaphorePermit>,
}

#[derive(Default)]
struct DispatchState {
    order: BTreeMap<u64, RequestKey>,
    records: HashMap<RequestKey, Record>,
    next_seq: u64,
    completed: u64,
    failed: u64,
    shutters: u64,
}

/// Dispatcher counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct DispatcherStats {
    /// Requests registered and not retired
    pub outstanding: usize,
    /// Requests retired with final metadata
    pub completed: u64,
    /// Requests retired with an error notification
    pub failed: u64,
    /// Shutter notifications sent
    pub shutters: u64,
}

/// Ordered per-request result assembly.
pub struct ResultDispatcher {
    sink: Arc<dyn ResultSink>,
    state: Mutex<DispatchState>,
}

impl ResultDispatcher {
    /// Dispatcher reporting to `sink`.
    #[must_use]
    pub fn new(sink: Arc<dyn ResultSink>) -> Self {
        Self {
            sink,
            state: Mutex::new(DispatchState::default()),
        }
    }

    /// Starts tracking a request. Registration order is shutter order.
    pub fn register(
        &self,
        key: RequestKey,
        streams: &[StreamId],
        frames_expected: u32,
        permit: Option<OwnedSemaphorePermit>,
    ) -> CamResult<()> {
        let mut state = self.state.lock();
        if state.records.contains_key(&key) {
            return Err(CamError::rejected(key, RejectReason::DuplicateKey));
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.order.insert(seq, key);
        state.records.insert(
            key,
            Record {
                seq,
                streams: streams
                    .iter()
                    .map(|s| (*s, StreamProgress::Pending))
                    .collect(),
                frames_expected: frames_expected.max(1),
                frames_done: 0,
                shutter: Shutter::Waiting,
                queued: Vec::new(),
                partials: 0,
                metadata: ResultMetadata::default(),
                _permit: permit,
            },
        );
        trace!(request = %key, frames_expected, "Request registered");
        Ok(())
    }

    /// Whether `key` is registered and not retired.
    #[must_use]
    pub fn is_tracked(&self, key: RequestKey) -> bool {
        self.state.lock().records.contains_key(&key)
    }

    /// Records the start-of-exposure of `key`. Only the first call counts.
    pub fn shutter(&self, key: RequestKey, frame: FrameNumber, timestamp_ns: u64) {
        let mut state = self.state.lock();
        let Some(record) = state.records.get_mut(&key) else {
            return;
        };
        if record.shutter != Shutter::Waiting {
            return;
        }
        record.shutter = Shutter::Ready {
            frame,
            timestamp_ns,
        };
        self.advance(&mut state);
    }

    /// Partial metadata for `key`.
    pub fn partial(&self, key: RequestKey, metadata: ResultMetadata) {
        let mut state = self.state.lock();
        let Some(record) = state.records.get_mut(&key) else {
            return;
        };
        if record.shutter == Shutter::Sent {
            record.partials += 1;
            let index = record.partials;
            self.emit_partial(key, index, metadata);
        } else {
            record.queued.push(Queued::Partial(metadata));
        }
    }

    /// Delivers the output for `stream`. Later deliveries for the same stream are ignored.
    pub fn deliver(
        &self,
        key: RequestKey,
        stream: StreamId,
        slot: SlotState,
        buffer: Option<Buffer>,
    ) {
        let mut state = self.state.lock();
        let Some(record) = state.records.get_mut(&key) else {
            return;
        };
        match record.streams.get(&stream) {
            Some(StreamProgress::Pending) => {}
            _ => {
                debug!(request = %key, %stream, "Duplicate or unknown stream delivery ignored");
                return;
            }
        }
        let delivery = if slot == SlotState::Complete && buffer.is_some() {
            StreamBuffer {
                stream,
                status: BufferStatus::Ok,
                buffer,
            }
        } else {
            StreamBuffer {
                stream,
                status: BufferStatus::Error,
                buffer: None,
            }
        };
        if record.shutter == Shutter::Sent {
            record.streams.insert(stream, StreamProgress::Emitted);
            self.emit_buffer(key, delivery);
        } else {
            record.streams.insert(stream, StreamProgress::Queued);
            record.queued.push(Queued::Buffer(delivery));
        }
    }

    /// One frame of `key` completed.
    pub fn frame_done(&self, key: RequestKey, metadata: &ResultMetadata) {
        let mut state = self.state.lock();
        let Some(record) = state.records.get_mut(&key) else {
            return;
        };
        record.frames_done += 1;
        record.metadata.merge(metadata);
        if record.frames_done < record.frames_expected {
            return;
        }
        match record.shutter {
            Shutter::Sent => self.finalize(&mut state, key),
            Shutter::Ready { .. } => record.queued.push(Queued::Final),
            Shutter::Waiting => {
                warn!(request = %key, "Request completed without a sensor timestamp");
                self.fail_locked(&mut state, key);
            }
        }
    }

    /// A frame of `key` will never be built: its streams fail and it counts as done.
    pub fn abandon_frame(&self, key: RequestKey, streams: &[StreamId]) {
        for stream in streams {
            self.deliver(key, *stream, SlotState::Error, None);
        }
        self.frame_done(key, &ResultMetadata::default());
    }

    /// Fails `key` with one error notification. Undelivered streams report Error.
    pub fn fail_request(&self, key: RequestKey) {
        let mut state = self.state.lock();
        if state.records.contains_key(&key) {
            self.fail_locked(&mut state, key);
        }
    }

    /// Fails every tracked request, oldest first. Returns how many were failed.
    pub fn fail_all(&self) -> usize {
        let mut state = self.state.lock();
        let keys: Vec<RequestKey> = state.order.values().copied().collect();
        for key in &keys {
            self.fail_locked(&mut state, *key);
        }
        if !keys.is_empty() {
            info!(count = keys.len(), "Failed back all outstanding requests");
        }
        keys.len()
    }

    /// Requests registered and not retired.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> DispatcherStats {
        let state = self.state.lock();
        DispatcherStats {
            outstanding: state.records.len(),
            completed: state.completed,
            failed: state.failed,
            shutters: state.shutters,
        }
    }

    //--------------------------------------------------------------------------
    // Internals, all called with the state lock held
    //--------------------------------------------------------------------------

    /// Sends every shutter that no earlier request blocks, then whatever was queued behind
    /// each of them.
    fn advance(&self, state: &mut DispatchState) {
        let keys: Vec<RequestKey> = state.order.values().copied().collect();
        for key in keys {
            let Some(record) = state.records.get_mut(&key) else {
                continue;
            };
            match record.shutter {
                Shutter::Sent => continue,
                Shutter::Waiting => break,
                Shutter::Ready {
                    frame,
                    timestamp_ns,
                } => {
                    record.shutter = Shutter::Sent;
                    let queued = std::mem::take(&mut record.queued);
                    state.shutters += 1;
                    self.sink.notify(Notify::Shutter {
                        request: key,
                        frame_number: frame,
                        timestamp_ns,
                    });
                    self.flush_queued(state, key, queued);
                }
            }
        }
    }

    fn flush_queued(&self, state: &mut DispatchState, key: RequestKey, queued: Vec<Queued>) {
        for item in queued {
            match item {
                Queued::Partial(metadata) => {
                    if let Some(record) = state.records.get_mut(&key) {
                        record.partials += 1;
                        let index = record.partials;
                        self.emit_partial(key, index, metadata);
                    }
                }
                Queued::Buffer(delivery) => {
                    if let Some(record) = state.records.get_mut(&key) {
                        record.streams.insert(delivery.stream, StreamProgress::Emitted);
                    }
                    self.emit_buffer(key, delivery);
                }
                Queued::Final => self.finalize(state, key),
            }
        }
    }

    fn finalize(&self, state: &mut DispatchState, key: RequestKey) {
        let Some(record) = state.records.remove(&key) else {
            return;
        };
        state.order.remove(&record.seq);
        for (stream, progress) in &record.streams {
            if *progress != StreamProgress::Emitted {
                self.emit_buffer(
                    key,
                    StreamBuffer {
                        stream: *stream,
                        status: BufferStatus::Error,
                        buffer: None,
                    },
                );
            }
        }
        self.sink.deliver_result(CaptureResult {
            request: key,
            partial_index: 0,
            buffers: Vec::new(),
            metadata: Some(record.metadata),
        });
        state.completed += 1;
        debug!(request = %key, "Request completed");
    }

    fn fail_locked(&self, state: &mut DispatchState, key: RequestKey) {
        let Some(record) = state.records.remove(&key) else {
            return;
        };
        state.order.remove(&record.seq);
        let code = if record.shutter == Shutter::Sent {
            ErrorCode::Result
        } else {
            ErrorCode::Request
        };
        self.sink.notify(Notify::Error {
            request: key,
            code,
            stream: None,
        });
        // Queued Ok buffers go back to their pools; the caller sees Error for them.
        drop(record.queued);
        for (stream, progress) in &record.streams {
            if *progress != StreamProgress::Emitted {
                self.sink.deliver_result(CaptureResult {
                    request: key,
                    partial_index: 0,
                    buffers: vec![StreamBuffer {
                        stream: *stream,
                        status: BufferStatus::Error,
                        buffer: None,
                    }],
                    metadata: None,
                });
            }
        }
        state.failed += 1;
        warn!(request = %key, ?code, "Request failed");
        self.advance(state);
    }

    fn emit_partial(&self, key: RequestKey, index: u32, metadata: ResultMetadata) {
        self.sink.deliver_result(CaptureResult {
            request: key,
            partial_index: index,
            buffers: Vec::new(),
            metadata: Some(metadata),
        });
    }

    fn emit_buffer(&self, key: RequestKey, delivery: StreamBuffer) {
        if delivery.status == BufferStatus::Error {
            self.sink.notify(Notify::Error {
                request: key,
                code: ErrorCode::Buffer,
                stream: Some(delivery.stream),
            });
        }
        self.sink.deliver_result(CaptureResult {
            request: key,
            partial_index: 0,
            buffers: vec![delivery],
            metadata: None,
        });
    }
}

impl std::fmt::Debug for ResultDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultDispatcher")
            .field("outstanding", &self.outstanding())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cam_pool::{BufferLayout, BufferPool, PoolSpec};
    use tokio::sync::Semaphore;

    fn setup() -> (ResultDispatcher, mpsc::UnboundedReceiver<SessionEvent>) {
        let (sink, rx) = ChannelSink::new();
        (ResultDispatcher::new(Arc::new(sink)), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn label(event: &SessionEvent) -> String {
        match event {
            SessionEvent::Notify(Notify::Shutter { request, .. }) => format!("shutter:{}", request.0),
            SessionEvent::Notify(Notify::Error { request, code, .. }) => {
                format!("error:{}:{code:?}", request.0)
            }
            SessionEvent::Result(r) if r.is_final() => format!("final:{}", r.request.0),
            SessionEvent::Result(r) if r.is_partial() => format!("partial:{}", r.request.0),
            SessionEvent::Result(r) => {
                let status = r.buffers.first().map(|b| b.status);
                format!("buffer:{}:{status:?}", r.request.0)
            }
        }
    }

    fn labels(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<String> {
        drain(rx).iter().map(label).collect()
    }

    fn pool() -> BufferPool {
        BufferPool::with_heap(PoolSpec::fixed("out", 4, BufferLayout::single_plane(8))).unwrap()
    }

    #[test]
    fn single_request_order() {
        let (d, mut rx) = setup();
        let pool = pool();
        let key = RequestKey(1);
        d.register(key, &[StreamId(0)], 1, None).unwrap();

        d.partial(key, ResultMetadata::default());
        d.deliver(key, StreamId(0), SlotState::Complete, Some(pool.try_acquire().unwrap()));
        assert!(labels(&mut rx).is_empty());

        d.shutter(key, FrameNumber(0), 100);
        d.frame_done(key, &ResultMetadata::default());
        assert_eq!(
            labels(&mut rx),
            vec!["shutter:1", "partial:1", "buffer:1:Some(Ok)", "final:1"]
        );
        assert_eq!(d.outstanding(), 0);
        assert_eq!(d.stats().completed, 1);
    }

    #[test]
    fn later_shutter_waits_for_earlier_request() {
        let (d, mut rx) = setup();
        d.register(RequestKey(1), &[StreamId(0)], 1, None).unwrap();
        d.register(RequestKey(2), &[StreamId(0)], 1, None).unwrap();

        d.shutter(RequestKey(2), FrameNumber(1), 200);
        d.deliver(RequestKey(2), StreamId(0), SlotState::Error, None);
        d.frame_done(RequestKey(2), &ResultMetadata::default());
        assert!(labels(&mut rx).is_empty());

        d.shutter(RequestKey(1), FrameNumber(0), 100);
        let got = labels(&mut rx);
        assert_eq!(got[0], "shutter:1");
        assert_eq!(got[1], "shutter:2");
        assert!(got.contains(&"error:2:Buffer".to_string()));
        assert_eq!(got.last().unwrap(), "final:2");
    }

    #[test]
    fn duplicate_delivery_is_ignored_and_key_reuse_rejected() {
        let (d, mut rx) = setup();
        let key = RequestKey(5);
        d.register(key, &[StreamId(0)], 1, None).unwrap();
        let err = d.register(key, &[StreamId(0)], 1, None).unwrap_err();
        assert_eq!(err.reject_reason(), Some(RejectReason::DuplicateKey));

        d.shutter(key, FrameNumber(0), 1);
        d.shutter(key, FrameNumber(1), 2);
        d.deliver(key, StreamId(0), SlotState::Error, None);
        d.deliver(key, StreamId(0), SlotState::Error, None);
        d.deliver(key, StreamId(9), SlotState::Error, None);
        assert_eq!(
            labels(&mut rx),
            vec!["shutter:5", "error:5:Buffer", "buffer:5:Some(Error)"]
        );
    }

    #[test]
    fn failure_before_shutter_is_request_error() {
        let (d, mut rx) = setup();
        let pool = pool();
        let key = RequestKey(3);
        d.register(key, &[StreamId(0), StreamId(1)], 1, None).unwrap();
        d.deliver(key, StreamId(0), SlotState::Complete, Some(pool.try_acquire().unwrap()));
        assert_eq!(pool.outstanding(), 1);

        d.fail_request(key);
        assert_eq!(
            labels(&mut rx),
            vec!["error:3:Request", "buffer:3:Some(Error)", "buffer:3:Some(Error)"]
        );
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(d.stats().failed, 1);
        // late events for a retired request are dropped
        d.frame_done(key, &ResultMetadata::default());
        assert!(labels(&mut rx).is_empty());
    }

    #[test]
    fn failure_after_shutter_is_result_error() {
        let (d, mut rx) = setup();
        let key = RequestKey(4);
        d.register(key, &[StreamId(0)], 2, None).unwrap();
        d.shutter(key, FrameNumber(0), 1);
        d.frame_done(key, &ResultMetadata::default());
        d.fail_all();
        assert_eq!(
            labels(&mut rx),
            vec!["shutter:4", "error:4:Result", "buffer:4:Some(Error)"]
        );
    }

    #[test]
    fn completion_without_timestamp_fails_request() {
        let (d, mut rx) = setup();
        let key = RequestKey(6);
        d.register(key, &[StreamId(0)], 1, None).unwrap();
        d.frame_done(key, &ResultMetadata::default());
        assert_eq!(labels(&mut rx)[0], "error:6:Request");
    }

    #[test]
    fn abandoned_frame_counts_as_done() {
        let (d, mut rx) = setup();
        let key = RequestKey(7);
        d.register(key, &[StreamId(0), StreamId(2)], 2, None).unwrap();
        d.shutter(key, FrameNumber(0), 1);
        d.deliver(key, StreamId(0), SlotState::Error, None);
        d.frame_done(key, &ResultMetadata::default());
        d.abandon_frame(key, &[StreamId(2)]);
        let got = labels(&mut rx);
        assert_eq!(got.last().unwrap(), "final:7");
        assert_eq!(got.iter().filter(|l| l.starts_with("buffer")).count(), 2);
    }

    #[test]
    fn retiring_releases_pacing_permit() {
        let (d, _rx) = setup();
        let semaphore = Arc::new(Semaphore::new(1));
        let permit = Arc::clone(&semaphore).try_acquire_owned().unwrap();
        d.register(RequestKey(1), &[StreamId(0)], 1, Some(permit)).unwrap();
        assert_eq!(semaphore.available_permits(), 0);
        d.fail_request(RequestKey(1));
        assert_eq!(semaphore.available_permits(), 1);
    }
}
