use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::{Condvar, Mutex};

use crate::arena::Arena;
use crate::cancel::CancellationToken;
use crate::error::{Error, Result};

/// How often a cancellable wait re-checks its token.
const CANCEL_POLL: Duration = Duration::from_millis(10);

/// Lifecycle of a frame buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Not owned by either queue; the client may submit it.
    Idle,
    /// Submitted, waiting in the availability queue.
    Queued,
    /// Reserved by the producer, currently being filled.
    Active,
    /// Filled successfully, waiting to be claimed.
    Done,
    /// Filling failed or was cancelled; the contents are not trustworthy.
    Error,
}

impl BufferState {
    /// Whether the buffer is still owned by the producer side. A claim must
    /// wait as long as this holds.
    pub fn is_pending(self) -> bool {
        matches!(self, BufferState::Queued | BufferState::Active)
    }
}

#[derive(Debug)]
struct BufferMeta {
    state: BufferState,
    used_bytes: usize,
    sequence: u32,
    timestamp: Option<SystemTime>,
}

/// Read-only projection of a buffer's public fields.
#[derive(Debug, Clone)]
pub struct BufferStatus {
    pub index: u32,
    /// Byte offset of this buffer's region inside the pool arena. The mapping
    /// collaborator maps buffers individually by this offset.
    pub offset: usize,
    /// Usable region length in bytes.
    pub length: usize,
    /// Bytes actually filled by the producer.
    pub used_bytes: usize,
    pub state: BufferState,
    /// Frame counter stamped at completion.
    pub sequence: u32,
    /// Capture-completion time, stamped at completion.
    pub timestamp: Option<SystemTime>,
    /// At least one external mapping references this buffer's memory.
    pub mapped: bool,
    /// State is Done or Error.
    pub done: bool,
    /// State is Queued or Active.
    pub queued: bool,
}

/// One slot in the pool.
///
/// Shared between the client and producer surfaces through `Arc`; all mutable
/// metadata sits behind the per-buffer mutex, and the condvar is signalled
/// whenever the state leaves {Queued, Active}.
pub struct FrameBuffer {
    index: u32,
    offset: usize,
    length: usize,
    arena: Arc<Arena>,
    map_count: AtomicU32,
    meta: Mutex<BufferMeta>,
    settled: Condvar,
}

impl FrameBuffer {
    pub(crate) fn new(index: u32, offset: usize, length: usize, arena: Arc<Arena>) -> Self {
        Self {
            index,
            offset,
            length,
            arena,
            map_count: AtomicU32::new(0),
            meta: Mutex::new(BufferMeta {
                state: BufferState::Idle,
                used_bytes: 0,
                sequence: 0,
                timestamp: None,
            }),
            settled: Condvar::new(),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn state(&self) -> BufferState {
        self.meta.lock().state
    }

    /// Number of external mappings currently referencing this buffer.
    pub fn map_count(&self) -> u32 {
        self.map_count.load(Ordering::Acquire)
    }

    /// Snapshot of the buffer's public fields plus derived flags.
    pub fn status(&self) -> BufferStatus {
        let meta = self.meta.lock();
        BufferStatus {
            index: self.index,
            offset: self.offset,
            length: self.length,
            used_bytes: meta.used_bytes,
            state: meta.state,
            sequence: meta.sequence,
            timestamp: meta.timestamp,
            mapped: self.map_count() > 0,
            done: matches!(meta.state, BufferState::Done | BufferState::Error),
            queued: meta.state.is_pending(),
        }
    }

    /// Idle -> Queued, resetting the fill count. Any other starting state is
    /// the client's error.
    pub(crate) fn begin_submit(&self) -> Result<()> {
        let mut meta = self.meta.lock();
        if meta.state != BufferState::Idle {
            return Err(Error::InvalidState("buffer is not idle"));
        }
        meta.state = BufferState::Queued;
        meta.used_bytes = 0;
        Ok(())
    }

    /// Queued -> Active when the producer picks the buffer up. Tolerates a
    /// buffer that is already active.
    pub(crate) fn begin_fill(&self) {
        let mut meta = self.meta.lock();
        if meta.state == BufferState::Queued {
            meta.state = BufferState::Active;
        }
    }

    /// Producer completion: leave {Queued, Active}, stamp the frame counter
    /// and timestamp, and wake this buffer's waiters.
    pub(crate) fn settle(
        &self,
        state: BufferState,
        used_bytes: Option<usize>,
        sequence: u32,
        timestamp: SystemTime,
    ) {
        debug_assert!(!state.is_pending());
        let mut meta = self.meta.lock();
        meta.state = state;
        if let Some(used) = used_bytes {
            meta.used_bytes = used.min(self.length);
        }
        meta.sequence = sequence;
        meta.timestamp = Some(timestamp);
        drop(meta);
        self.settled.notify_all();
    }

    /// Cancellation: mark the fill as failed and wake the waiters. No frame
    /// counter is stamped.
    pub(crate) fn settle_error(&self) {
        let mut meta = self.meta.lock();
        meta.state = BufferState::Error;
        drop(meta);
        self.settled.notify_all();
    }

    /// Done/Error -> Idle on a successful claim.
    pub(crate) fn finish_claim(&self) {
        self.meta.lock().state = BufferState::Idle;
    }

    /// Unconditional reset when the queue is disabled.
    pub(crate) fn force_idle(&self) {
        let mut meta = self.meta.lock();
        meta.state = BufferState::Idle;
        drop(meta);
        self.settled.notify_all();
    }

    /// Suspend until the state leaves {Queued, Active}. With a token, the
    /// wait re-checks for cancellation every few milliseconds and reports
    /// `Interrupted` instead of being silently swallowed.
    pub(crate) fn wait_settled(&self, token: Option<&CancellationToken>) -> Result<()> {
        let mut meta = self.meta.lock();
        while meta.state.is_pending() {
            match token {
                Some(token) => {
                    if token.is_cancelled() {
                        return Err(Error::Interrupted);
                    }
                    self.settled.wait_for(&mut meta, CANCEL_POLL);
                }
                None => self.settled.wait(&mut meta),
            }
        }
        Ok(())
    }

    /// Copy `src` into the frame region starting at byte `at`.
    ///
    /// Only valid while the producer owns the buffer (Queued or Active). The
    /// copy runs under the buffer lock so a concurrent reader never observes
    /// a torn frame.
    pub fn write_at(&self, at: usize, src: &[u8]) -> Result<usize> {
        let end = at
            .checked_add(src.len())
            .filter(|&end| end <= self.length)
            .ok_or(Error::InvalidArgument("write past end of buffer"))?;
        let mut meta = self.meta.lock();
        if !meta.state.is_pending() {
            return Err(Error::InvalidState("buffer is not being filled"));
        }
        unsafe { self.arena.copy_into(self.offset + at, src) };
        if end > meta.used_bytes {
            meta.used_bytes = end;
        }
        Ok(src.len())
    }

    /// Copy filled bytes out of the frame region starting at byte `at`.
    /// Returns the number of bytes copied, bounded by `used_bytes`.
    pub fn read_at(&self, at: usize, dst: &mut [u8]) -> Result<usize> {
        if at > self.length {
            return Err(Error::InvalidArgument("read past end of buffer"));
        }
        let meta = self.meta.lock();
        if meta.state.is_pending() {
            return Err(Error::InvalidState("buffer is being filled"));
        }
        let avail = meta.used_bytes.saturating_sub(at);
        let count = avail.min(dst.len());
        unsafe { self.arena.copy_out(self.offset + at, &mut dst[..count]) };
        Ok(count)
    }
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let meta = self.meta.lock();
        f.debug_struct("FrameBuffer")
            .field("index", &self.index)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("state", &meta.state)
            .field("used_bytes", &meta.used_bytes)
            .field("map_count", &self.map_count())
            .finish()
    }
}

/// RAII handle for an external mapping of a buffer's memory.
///
/// Freeing the pool reports `Busy` while any guard is alive.
pub struct MapGuard {
    buffer: Arc<FrameBuffer>,
}

impl MapGuard {
    /// Register an external mapping of the buffer's memory. The pool cannot
    /// be freed while the guard is alive.
    pub fn new(buffer: Arc<FrameBuffer>) -> Self {
        buffer.map_count.fetch_add(1, Ordering::AcqRel);
        Self { buffer }
    }

    pub fn index(&self) -> u32 {
        self.buffer.index()
    }

    pub fn offset(&self) -> usize {
        self.buffer.offset()
    }

    pub fn length(&self) -> usize {
        self.buffer.length()
    }

    pub fn buffer(&self) -> &Arc<FrameBuffer> {
        &self.buffer
    }
}

impl Drop for MapGuard {
    fn drop(&mut self) {
        self.buffer.map_count.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer() -> Arc<FrameBuffer> {
        let arena = Arc::new(Arena::with_capacity(1, 4096).unwrap());
        Arc::new(FrameBuffer::new(0, 0, 4096, arena))
    }

    #[test]
    fn submit_requires_idle() {
        let buf = buffer();
        buf.begin_submit().unwrap();
        assert_eq!(buf.state(), BufferState::Queued);
        assert!(matches!(
            buf.begin_submit(),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn settle_leaves_pending_and_stamps_metadata() {
        let buf = buffer();
        buf.begin_submit().unwrap();
        buf.begin_fill();
        assert_eq!(buf.state(), BufferState::Active);

        buf.settle(BufferState::Done, Some(100), 7, SystemTime::now());
        let status = buf.status();
        assert_eq!(status.state, BufferState::Done);
        assert_eq!(status.used_bytes, 100);
        assert_eq!(status.sequence, 7);
        assert!(status.timestamp.is_some());
        assert!(status.done);
        assert!(!status.queued);
    }

    #[test]
    fn map_guard_tracks_reference_count() {
        let buf = buffer();
        assert_eq!(buf.map_count(), 0);
        let first = MapGuard::new(Arc::clone(&buf));
        let second = MapGuard::new(Arc::clone(&buf));
        assert_eq!(buf.map_count(), 2);
        assert!(buf.status().mapped);
        drop(first);
        assert_eq!(buf.map_count(), 1);
        drop(second);
        assert_eq!(buf.map_count(), 0);
        assert!(!buf.status().mapped);
    }

    #[test]
    fn writes_gated_by_state() {
        let buf = buffer();
        let payload = [1u8, 2, 3, 4];
        assert!(matches!(
            buf.write_at(0, &payload),
            Err(Error::InvalidState(_))
        ));

        buf.begin_submit().unwrap();
        buf.begin_fill();
        assert_eq!(buf.write_at(0, &payload).unwrap(), 4);
        buf.settle(BufferState::Done, None, 0, SystemTime::now());

        let mut out = [0u8; 8];
        assert_eq!(buf.read_at(0, &mut out).unwrap(), 4);
        assert_eq!(&out[..4], &payload);
    }

    #[test]
    fn out_of_range_read_is_rejected() {
        let buf = buffer();
        buf.begin_submit().unwrap();
        buf.begin_fill();
        buf.write_at(0, &[7u8; 16]).unwrap();
        buf.settle(BufferState::Done, None, 0, SystemTime::now());

        let mut out = [0u8; 4];
        assert!(matches!(
            buf.read_at(usize::MAX, &mut out),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            buf.read_at(5000, &mut out),
            Err(Error::InvalidArgument(_))
        ));
        // Reading at the very end is in range, just empty.
        assert_eq!(buf.read_at(4096, &mut out).unwrap(), 0);
        assert_eq!(buf.read_at(16, &mut out).unwrap(), 0);
    }

    #[test]
    fn oversized_write_is_rejected() {
        let buf = buffer();
        buf.begin_submit().unwrap();
        let payload = vec![0u8; 5000];
        assert!(matches!(
            buf.write_at(0, &payload),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn wait_settled_reports_interruption() {
        let buf = buffer();
        buf.begin_submit().unwrap();
        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(
            buf.wait_settled(Some(&token)),
            Err(Error::Interrupted)
        ));
    }
}
