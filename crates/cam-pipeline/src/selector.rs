//! Capture selector: which retained raw buffer feeds a still capture.
//!
//! Two retention policies:
//!
//! - **AlwaysOn**: every offered raw buffer enters a bounded FIFO of `hold_count` entries;
//!   the oldest is released when a new one arrives.
//! - **Dynamic**: raw buffers are kept only while a capture needs one (`need > 0`);
//!   otherwise they go straight back to their pool.
//!
//! A pending [`CaptureSelector::select`] claims its frame numbers, so buffers it waits for
//! are never evicted. Waiting uses [`Notify`] with a deadline, never polling.

use cam_core::{
    CamError, CamResult, FrameNumber, ReprocessingMode, ResultMetadata, StageError,
    StageErrorKind, StageId,
};
use cam_pool::Buffer;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

struct Held {
    buffer: Option<Buffer>,
    metadata: ResultMetadata,
}

#[derive(Default)]
struct SelectorState {
    held: VecDeque<(FrameNumber, Held)>,
    claimed: BTreeMap<FrameNumber, Held>,
    wanted: BTreeSet<FrameNumber>,
    cancelled: bool,
    dropped: u64,
    evicted: u64,
}

impl SelectorState {
    fn release_range(&mut self, range: &[FrameNumber]) {
        for frame in range {
            self.wanted.remove(frame);
            self.claimed.remove(frame);
        }
    }
}

/// Buffers chosen for one capture, oldest first.
#[derive(Debug)]
pub struct Selection {
    /// Frame numbers the buffers came from
    pub frames: Vec<FrameNumber>,
    /// Raw buffers
    pub buffers: Vec<Buffer>,
    /// Result metadata of the first frame
    pub metadata: ResultMetadata,
}

/// Retention counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct SelectorStats {
    /// Captures waiting for raw data
    pub need: usize,
    /// Entries in the retention FIFO, unavailable frames included
    pub retained: usize,
    /// Buffers claimed by a pending selection
    pub claimed: usize,
    /// Offers released because nothing needed them
    pub dropped: u64,
    /// Buffers pushed out of a full FIFO
    pub evicted: u64,
}

/// Raw buffer retention and lookup.
pub struct CaptureSelector {
    mode: ReprocessingMode,
    hold_count: usize,
    state: Mutex<SelectorState>,
    need: AtomicUsize,
    changed: Notify,
}

impl CaptureSelector {
    /// Selector for `mode` keeping at most `hold_count` unclaimed buffers.
    #[must_use]
    pub fn new(mode: ReprocessingMode, hold_count: usize) -> Self {
        Self {
            mode,
            hold_count: hold_count.max(1),
            state: Mutex::new(SelectorState::default()),
            need: AtomicUsize::new(0),
            changed: Notify::new(),
        }
    }

    /// Retention policy.
    #[must_use]
    pub fn mode(&self) -> ReprocessingMode {
        self.mode
    }

    /// Whether buffers offered now would be kept.
    #[must_use]
    pub fn is_retaining(&self) -> bool {
        match self.mode {
            ReprocessingMode::AlwaysOn => true,
            ReprocessingMode::Dynamic => self.need() > 0,
            ReprocessingMode::None => false,
        }
    }

    /// Captures currently waiting for raw data.
    #[must_use]
    pub fn need(&self) -> usize {
        self.need.load(Ordering::SeqCst)
    }

    /// A capture needing raw data was admitted.
    pub fn need_increment(&self) {
        let need = self.need.fetch_add(1, Ordering::SeqCst) + 1;
        trace!(need, "Raw need incremented");
    }

    /// A capture consumed (or gave up on) its raw data.
    pub fn need_decrement(&self) {
        let _ = self
            .need
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
    }

    /// Offers the raw output of `frame`. Returns whether it was kept.
    pub fn offer(&self, frame: FrameNumber, buffer: Buffer, metadata: ResultMetadata) -> bool {
        let held = Held {
            buffer: Some(buffer),
            metadata,
        };
        if self.retain(frame, held) {
            return true;
        }
        self.state.lock().dropped += 1;
        trace!(%frame, "No capture pending, raw buffer released");
        false
    }

    /// Records that `frame` produced no usable raw output.
    ///
    /// Kept like an offer so a capture selecting `frame` later fails instead of waiting
    /// out its budget.
    pub fn mark_unavailable(&self, frame: FrameNumber) {
        let held = Held {
            buffer: None,
            metadata: ResultMetadata::default(),
        };
        if self.retain(frame, held) {
            trace!(%frame, "Raw output unavailable");
        }
    }

    fn retain(&self, frame: FrameNumber, held: Held) -> bool {
        let mut state = self.state.lock();
        if state.wanted.contains(&frame) {
            state.claimed.insert(frame, held);
        } else if self.is_retaining() {
            state.held.push_back((frame, held));
            while state.held.len() > self.hold_count {
                if let Some((old, _)) = state.held.pop_front() {
                    state.evicted += 1;
                    trace!(frame = %old, "Raw buffer evicted");
                }
            }
        } else {
            return false;
        }
        drop(state);
        self.changed.notify_waiters();
        true
    }

    /// Waits up to `budget` for the raw buffers of `count` consecutive frames starting at
    /// `target`.
    pub async fn select(
        &self,
        target: FrameNumber,
        count: u32,
        budget: Duration,
    ) -> CamResult<Selection> {
        let range: Vec<FrameNumber> = (0..u64::from(count.max(1)))
            .map(|i| FrameNumber(target.0 + i))
            .collect();
        {
            let mut state = self.state.lock();
            if state.cancelled {
                return Err(CamError::Shutdown("capture selection cancelled".into()));
            }
            for frame in &range {
                state.wanted.insert(*frame);
                if let Some(pos) = state.held.iter().position(|(n, _)| n == frame) {
                    if let Some((n, held)) = state.held.remove(pos) {
                        state.claimed.insert(n, held);
                    }
                }
            }
        }

        let deadline = Instant::now() + budget;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(result) = self.try_take(&range) {
                return result;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero()
                || tokio::time::timeout(remaining, notified).await.is_err()
            {
                if let Some(result) = self.try_take(&range) {
                    return result;
                }
                self.state.lock().release_range(&range);
                debug!(%target, count, "Raw selection timed out");
                return Err(CamError::Timeout(format!(
                    "raw frame {target} not retained within {} ms",
                    budget.as_millis()
                )));
            }
        }
    }

    /// Completes a selection if everything it waits for arrived.
    fn try_take(&self, range: &[FrameNumber]) -> Option<CamResult<Selection>> {
        let mut state = self.state.lock();
        if state.cancelled {
            state.release_range(range);
            return Some(Err(CamError::Shutdown("capture selection cancelled".into())));
        }
        let missing = range
            .iter()
            .find(|f| state.claimed.get(*f).is_some_and(|h| h.buffer.is_none()));
        if let Some(frame) = missing.copied() {
            state.release_range(range);
            return Some(Err(CamError::Stage(StageError::new(
                StageId::Sensor,
                StageErrorKind::UpstreamFailed,
                format!("raw output of frame {frame} unavailable"),
            ))));
        }
        if !range.iter().all(|f| state.claimed.contains_key(f)) {
            return None;
        }

        let mut selection = Selection {
            frames: Vec::with_capacity(range.len()),
            buffers: Vec::with_capacity(range.len()),
            metadata: ResultMetadata::default(),
        };
        for frame in range {
            state.wanted.remove(frame);
            if let Some(held) = state.claimed.remove(frame) {
                if selection.frames.is_empty() {
                    selection.metadata = held.metadata;
                }
                selection.frames.push(*frame);
                selection.buffers.extend(held.buffer);
            }
        }
        Some(Ok(selection))
    }

    /// Wakes every pending selection with an error. Offers are still accepted.
    pub fn cancel(&self) {
        self.state.lock().cancelled = true;
        self.changed.notify_waiters();
    }

    /// Releases every retained buffer and resets the need counter. Returns how many
    /// buffers were released.
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let released = state.held.len() + state.claimed.len();
        state.held.clear();
        state.claimed.clear();
        state.wanted.clear();
        state.cancelled = false;
        self.need.store(0, Ordering::SeqCst);
        debug!(released, "Capture selector cleared");
        released
    }

    /// Buffers in the retention FIFO.
    #[must_use]
    pub fn retained_len(&self) -> usize {
        self.state.lock().held.len()
    }

    /// Whether `frame`'s raw buffer is retained.
    #[must_use]
    pub fn is_retained(&self, frame: FrameNumber) -> bool {
        let state = self.state.lock();
        state
            .held
            .iter()
            .find(|(n, _)| *n == frame)
            .map(|(_, held)| held)
            .or_else(|| state.claimed.get(&frame))
            .is_some_and(|held| held.buffer.is_some())
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> SelectorStats {
        let state = self.state.lock();
        SelectorStats {
            need: self.need(),
            retained: state.held.len(),
            claimed: state.claimed.len(),
            dropped: state.dropped,
            evicted: state.evicted,
        }
    }
}

impl std::fmt::Debug for CaptureSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSelector")
            .field("mode", &self.mode)
            .field("hold_count", &self.hold_count)
            .field("need", &self.need())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cam_pool::{BufferLayout, BufferPool, PoolSpec};
    use std::sync::Arc;

    fn pool() -> BufferPool {
        BufferPool::with_heap(PoolSpec::fixed("raw", 8, BufferLayout::single_plane(8))).unwrap()
    }

    fn offer(selector: &CaptureSelector, pool: &BufferPool, frame: u64) -> bool {
        selector.offer(
            FrameNumber(frame),
            pool.try_acquire().unwrap(),
            ResultMetadata::default(),
        )
    }

    #[tokio::test]
    async fn always_on_keeps_newest() {
        let pool = pool();
        let selector = CaptureSelector::new(ReprocessingMode::AlwaysOn, 2);
        for f in 0..3 {
            assert!(offer(&selector, &pool, f));
        }
        assert_eq!(selector.retained_len(), 2);
        assert!(!selector.is_retained(FrameNumber(0)));
        assert_eq!(pool.outstanding(), 2);

        let selection = selector
            .select(FrameNumber(1), 1, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(selection.frames, vec![FrameNumber(1)]);
        assert_eq!(selection.buffers.len(), 1);
        assert_eq!(selector.stats().evicted, 1);
    }

    #[tokio::test]
    async fn evicted_frame_times_out() {
        let pool = pool();
        let selector = CaptureSelector::new(ReprocessingMode::AlwaysOn, 1);
        offer(&selector, &pool, 0);
        offer(&selector, &pool, 1);
        let err = selector
            .select(FrameNumber(0), 1, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, CamError::Timeout(_)));
        assert_eq!(selector.stats().claimed, 0);
    }

    #[tokio::test]
    async fn dynamic_drops_without_need() {
        let pool = pool();
        let selector = CaptureSelector::new(ReprocessingMode::Dynamic, 2);
        assert!(!offer(&selector, &pool, 0));
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(selector.stats().dropped, 1);

        selector.need_increment();
        assert!(offer(&selector, &pool, 1));
        assert_eq!(selector.retained_len(), 1);
        selector.need_decrement();
        selector.need_decrement();
        assert_eq!(selector.need(), 0);
    }

    #[tokio::test]
    async fn select_waits_for_later_offer() {
        let pool = pool();
        let selector = Arc::new(CaptureSelector::new(ReprocessingMode::Dynamic, 1));
        selector.need_increment();

        let waiter = {
            let selector = Arc::clone(&selector);
            tokio::spawn(async move {
                selector
                    .select(FrameNumber(4), 1, Duration::from_secs(2))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        // unrelated frame fills the FIFO; the claimed one bypasses it
        offer(&selector, &pool, 3);
        offer(&selector, &pool, 4);

        let selection = waiter.await.unwrap().unwrap();
        assert_eq!(selection.frames, vec![FrameNumber(4)]);
        assert_eq!(selector.retained_len(), 1);
    }

    #[tokio::test]
    async fn long_exposure_gathers_consecutive_frames() {
        let pool = pool();
        let selector = Arc::new(CaptureSelector::new(ReprocessingMode::AlwaysOn, 1));
        offer(&selector, &pool, 10);

        let waiter = {
            let selector = Arc::clone(&selector);
            tokio::spawn(async move {
                selector
                    .select(FrameNumber(10), 3, Duration::from_secs(2))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        offer(&selector, &pool, 11);
        offer(&selector, &pool, 12);

        let selection = waiter.await.unwrap().unwrap();
        assert_eq!(
            selection.frames,
            vec![FrameNumber(10), FrameNumber(11), FrameNumber(12)]
        );
        assert_eq!(selection.buffers.len(), 3);
    }

    #[tokio::test]
    async fn unavailable_frame_fails_selection() {
        let selector = Arc::new(CaptureSelector::new(ReprocessingMode::AlwaysOn, 2));
        let waiter = {
            let selector = Arc::clone(&selector);
            tokio::spawn(async move {
                selector
                    .select(FrameNumber(2), 1, Duration::from_secs(2))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        selector.mark_unavailable(FrameNumber(2));
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, CamError::Stage(_)));
    }

    #[tokio::test]
    async fn unavailable_before_selection_fails_fast() {
        let pool = pool();
        let selector = CaptureSelector::new(ReprocessingMode::Dynamic, 4);
        selector.mark_unavailable(FrameNumber(1));
        assert_eq!(selector.retained_len(), 0);

        selector.need_increment();
        offer(&selector, &pool, 3);
        selector.mark_unavailable(FrameNumber(4));
        offer(&selector, &pool, 5);
        assert_eq!(selector.retained_len(), 3);
        assert!(selector.is_retained(FrameNumber(3)));
        assert!(!selector.is_retained(FrameNumber(4)));

        let started = Instant::now();
        let err = selector
            .select(FrameNumber(3), 3, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, CamError::Stage(_)));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(selector.stats().claimed, 0);
        assert_eq!(selector.retained_len(), 0);
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn cancel_wakes_waiters_and_clear_resets() {
        let pool = pool();
        let selector = Arc::new(CaptureSelector::new(ReprocessingMode::AlwaysOn, 2));
        offer(&selector, &pool, 0);
        selector.need_increment();
        let waiter = {
            let selector = Arc::clone(&selector);
            tokio::spawn(async move {
                selector
                    .select(FrameNumber(9), 1, Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        selector.cancel();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, CamError::Shutdown(_)));

        assert_eq!(selector.clear(), 1);
        assert_eq!(selector.need(), 0);
        assert_eq!(pool.outstanding(), 0);
        // usable again after clear
        assert!(offer(&selector, &pool, 1));
    }
}
