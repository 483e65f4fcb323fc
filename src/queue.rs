//! Frame queue management.
//!
//! Buffers are managed through two queues: a completion-order queue holding
//! every submitted buffer (both still-empty and done buffers), which fixes the
//! order claims come back in, and an availability queue holding only the
//! buffers the producer may fill next. Only the availability queue is shared
//! with the producer's restricted completion context, which keeps that
//! context off the blocking control lock entirely.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::arena;
use crate::buffer::{BufferState, BufferStatus, FrameBuffer, MapGuard};
use crate::cancel::CancellationToken;
use crate::error::{Error, Result};
use crate::pool::{Pool, MAX_BUFFERS};

/// Tunables for a frame queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Upper bound on the number of buffers a single allocation may request.
    pub max_buffers: usize,
    /// Page size used to align per-buffer regions; `None` queries the
    /// platform.
    pub page_size: Option<usize>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_buffers: MAX_BUFFERS,
            page_size: None,
        }
    }
}

/// How a fill attempt ended.
#[derive(Debug, Clone, Copy)]
pub enum FillOutcome {
    /// The buffer holds `used_bytes` of valid frame data.
    Done { used_bytes: usize },
    /// The transfer failed; the contents must not be trusted.
    Error,
}

/// A buffer returned by a claim.
///
/// `corrupted` flags data from a failed or cancelled fill. The claim itself
/// still succeeded: the buffer has been reset and may be resubmitted.
#[derive(Debug, Clone)]
pub struct ClaimedFrame {
    pub buffer: BufferStatus,
    pub corrupted: bool,
}

struct Control {
    /// Completion-order FIFO of buffer indices; claims pop its head.
    completion: VecDeque<u32>,
    streaming: bool,
}

struct Shared {
    /// Blocking control lock serializing all client-context operations.
    control: Mutex<Control>,
    /// Written only under the control lock (allocate/free); read-locked
    /// briefly by any context for descriptor lookup.
    pool: RwLock<Option<Pool>>,
    /// Availability queue. The only lock the producer surface takes; client
    /// sections here are bounded and never suspend.
    pending: Mutex<VecDeque<Arc<FrameBuffer>>>,
    /// Frame counter, stamped in completion order.
    sequence: AtomicU32,
    /// Frame-boundary scratch for the transport collaborator; -1 = none.
    last_fid: AtomicI64,
}

impl Shared {
    /// Drain the availability queue, failing every buffer still on it and
    /// waking each buffer's waiters individually. Waking only the head is
    /// not enough: a woken claimer can re-check and suspend again before its
    /// siblings are marked.
    fn cancel_pending(&self) {
        let drained: Vec<_> = self.pending.lock().drain(..).collect();
        for buf in &drained {
            buf.settle_error();
        }
        if !drained.is_empty() {
            debug!(count = drained.len(), "cancelled pending buffers");
        }
    }
}

/// Client-facing surface of the frame buffer queue.
///
/// All operations here may block and are serialized by the control lock; none
/// of them may be called from the producer's completion context. That context
/// gets its own surface, [`Completer`], which exposes no blocking operation.
pub struct FrameQueue {
    config: QueueConfig,
    shared: Arc<Shared>,
}

impl FrameQueue {
    pub fn new() -> Self {
        Self::with_config(QueueConfig::default())
    }

    pub fn with_config(config: QueueConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared {
                control: Mutex::new(Control {
                    completion: VecDeque::new(),
                    streaming: false,
                }),
                pool: RwLock::new(None),
                pending: Mutex::new(VecDeque::new()),
                sequence: AtomicU32::new(0),
                last_fid: AtomicI64::new(-1),
            }),
        }
    }

    /// Handle for the producer's completion context.
    pub fn completer(&self) -> Completer {
        Completer {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Allocate `requested` buffers of `per_buffer_len` bytes each, replacing
    /// any previous pool. Returns the actual count, which may be smaller
    /// than requested under memory pressure.
    ///
    /// Fails with `Busy` while streaming or while any buffer of the previous
    /// pool is still mapped.
    pub fn allocate_buffers(&self, requested: usize, per_buffer_len: usize) -> Result<usize> {
        let mut control = self.shared.control.lock();
        if control.streaming {
            return Err(Error::Busy);
        }
        let mut pool_slot = self.shared.pool.write();
        if let Some(pool) = pool_slot.as_ref() {
            pool.check_unmapped()?;
        }
        // Reclaim the previous pool before allocating the new arena. Anything
        // still awaiting data is failed so no claimer stays suspended on a
        // buffer that no longer has a pool, and the completion-order queue is
        // emptied so no index survives into the new pool.
        self.shared.cancel_pending();
        control.completion.clear();
        *pool_slot = None;

        let page = self.config.page_size.unwrap_or_else(arena::page_size);
        let requested = requested.min(self.config.max_buffers);
        let pool = Pool::allocate(requested, per_buffer_len, page)?;
        let count = pool.len();
        *pool_slot = Some(pool);
        debug!(count, per_buffer_len, "buffers allocated");
        Ok(count)
    }

    /// Release the pool. Fails with `Busy` while streaming or while any
    /// buffer's memory is externally mapped.
    pub fn free_buffers(&self) -> Result<()> {
        let mut control = self.shared.control.lock();
        if control.streaming {
            return Err(Error::Busy);
        }
        let mut pool_slot = self.shared.pool.write();
        if let Some(pool) = pool_slot.as_ref() {
            pool.check_unmapped()?;
        }
        self.shared.cancel_pending();
        control.completion.clear();
        *pool_slot = None;
        debug!("buffers freed");
        Ok(())
    }

    /// Submit an idle buffer for filling. The buffer joins the tail of both
    /// the completion-order queue and the availability queue.
    pub fn submit(&self, index: usize) -> Result<()> {
        let mut control = self.shared.control.lock();
        let buf = {
            let pool = self.shared.pool.read();
            let pool = pool
                .as_ref()
                .ok_or(Error::InvalidState("no buffers allocated"))?;
            pool.get(index)
                .cloned()
                .ok_or(Error::InvalidArgument("buffer index out of range"))?
        };
        trace!(index, "queuing buffer");
        buf.begin_submit()?;
        control.completion.push_back(buf.index());
        self.shared.pending.lock().push_back(buf);
        Ok(())
    }

    /// Claim the head of the completion-order queue without blocking.
    /// `WouldBlock` if it is still being filled.
    pub fn try_claim(&self) -> Result<ClaimedFrame> {
        self.claim_inner(false, None)
    }

    /// Claim the head of the completion-order queue, blocking until it has
    /// been filled or failed. A cancelled token interrupts the wait.
    pub fn claim(&self, token: Option<&CancellationToken>) -> Result<ClaimedFrame> {
        self.claim_inner(true, token)
    }

    fn claim_inner(
        &self,
        blocking: bool,
        token: Option<&CancellationToken>,
    ) -> Result<ClaimedFrame> {
        loop {
            let mut control = self.shared.control.lock();
            let head = *control
                .completion
                .front()
                .ok_or(Error::InvalidState("buffer queue is empty"))?;
            let buf = {
                let pool = self.shared.pool.read();
                pool.as_ref()
                    .and_then(|pool| pool.get(head as usize))
                    .cloned()
                    .ok_or(Error::InvalidState("queued buffer has no pool"))?
            };

            let state = buf.state();
            if state.is_pending() {
                if !blocking {
                    return Err(Error::WouldBlock);
                }
                // Wait with the control lock released so submit and disable
                // can proceed, then re-validate the head: disable may have
                // cleared the queue in the meantime.
                drop(control);
                buf.wait_settled(token)?;
                continue;
            }

            let corrupted = match state {
                BufferState::Done => false,
                BufferState::Error => {
                    trace!(index = buf.index(), "corrupted data (transfer error)");
                    true
                }
                _ => {
                    warn!(index = buf.index(), ?state, "queued buffer in invalid state");
                    return Err(Error::InvalidState("queued buffer settled incorrectly"));
                }
            };

            control.completion.pop_front();
            buf.finish_claim();
            trace!(index = buf.index(), corrupted, "dequeuing buffer");
            return Ok(ClaimedFrame {
                buffer: buf.status(),
                corrupted,
            });
        }
    }

    /// Enable or disable streaming.
    ///
    /// Enabling resets the frame counter and the last frame id, and fails
    /// with `Busy` if already enabled. Disabling cancels the availability
    /// queue, clears the completion-order queue and resets every buffer to
    /// idle. Must never be called from the producer's completion context;
    /// that context uses [`Completer::cancel`].
    pub fn set_streaming(&self, enable: bool) -> Result<()> {
        let mut control = self.shared.control.lock();
        if enable {
            if control.streaming {
                return Err(Error::Busy);
            }
            self.shared.sequence.store(0, Ordering::Relaxed);
            self.shared.last_fid.store(-1, Ordering::Relaxed);
            control.streaming = true;
            debug!("streaming enabled");
        } else {
            self.shared.cancel_pending();
            control.completion.clear();
            if let Some(pool) = self.shared.pool.read().as_ref() {
                for buf in pool.buffers() {
                    buf.force_idle();
                }
            }
            control.streaming = false;
            debug!("streaming disabled");
        }
        Ok(())
    }

    pub fn is_streaming(&self) -> bool {
        self.shared.control.lock().streaming
    }

    pub fn buffer_count(&self) -> usize {
        self.shared.pool.read().as_ref().map_or(0, Pool::len)
    }

    /// Point query of a buffer's status, usable without the control lock.
    /// Best-effort consistency: the snapshot may race with in-flight
    /// operations.
    pub fn query_buffer(&self, index: usize) -> Result<BufferStatus> {
        let pool = self.shared.pool.read();
        let pool = pool
            .as_ref()
            .ok_or(Error::InvalidState("no buffers allocated"))?;
        let buf = pool
            .get(index)
            .ok_or(Error::InvalidArgument("buffer index out of range"))?;
        Ok(buf.status())
    }

    /// Mapping-collaborator hook: register an external mapping of a buffer's
    /// memory. The pool cannot be freed while the guard is alive.
    pub fn map_buffer(&self, index: usize) -> Result<MapGuard> {
        let pool = self.shared.pool.read();
        let pool = pool
            .as_ref()
            .ok_or(Error::InvalidState("no buffers allocated"))?;
        let buf = pool
            .get(index)
            .ok_or(Error::InvalidArgument("buffer index out of range"))?;
        Ok(MapGuard::new(Arc::clone(buf)))
    }
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Producer-facing surface, safe to drive from the completion context.
///
/// Every operation here is non-blocking: the only lock taken is the
/// availability lock, always for a bounded critical section, plus the
/// per-buffer mutex of the buffer being completed. The control lock is never
/// touched.
#[derive(Clone)]
pub struct Completer {
    shared: Arc<Shared>,
}

impl Completer {
    /// First buffer to fill when the stream starts, reserved for the
    /// producer. `None` if nothing has been submitted yet.
    pub fn head(&self) -> Option<Arc<FrameBuffer>> {
        let buf = self.shared.pending.lock().front().cloned()?;
        buf.begin_fill();
        Some(buf)
    }

    /// Complete a fill attempt.
    ///
    /// Removes `current` from the availability queue, stamps its frame
    /// counter and completion timestamp, records the outcome and wakes the
    /// buffer's waiters. Returns the next buffer to fill, already reserved,
    /// or `None` if the availability queue is empty, in which case the
    /// producer must idle until a new submission replenishes it.
    pub fn advance(
        &self,
        current: &Arc<FrameBuffer>,
        outcome: FillOutcome,
    ) -> Option<Arc<FrameBuffer>> {
        let next = {
            let mut pending = self.shared.pending.lock();
            if let Some(pos) = pending.iter().position(|buf| buf.index() == current.index()) {
                pending.remove(pos);
            }
            pending.front().cloned()
        };

        let sequence = self.shared.sequence.fetch_add(1, Ordering::Relaxed);
        let (state, used_bytes) = match outcome {
            FillOutcome::Done { used_bytes } => (BufferState::Done, Some(used_bytes)),
            FillOutcome::Error => (BufferState::Error, None),
        };
        current.settle(state, used_bytes, sequence, SystemTime::now());
        trace!(index = current.index(), sequence, ?outcome, "buffer completed");

        if let Some(next) = &next {
            next.begin_fill();
        }
        next
    }

    /// Cancel the availability queue after the device became unavailable.
    ///
    /// Every buffer still awaiting data is failed and its waiters are woken.
    /// Reentrant: a no-op when nothing is pending.
    pub fn cancel(&self) {
        self.shared.cancel_pending();
    }

    /// Frame id of the last completed transfer, if any.
    pub fn last_frame_id(&self) -> Option<u32> {
        let fid = self.shared.last_fid.load(Ordering::Relaxed);
        u32::try_from(fid).ok()
    }

    pub fn set_last_frame_id(&self, fid: Option<u32>) {
        let value = fid.map_or(-1, i64::from);
        self.shared.last_fid.store(value, Ordering::Relaxed);
    }
}
