//! Frame buffer queue for a video capture pipeline.
//!
//! A fixed pool of large, page-aligned frame buffers is shared between two
//! execution contexts with very different constraints: a client that submits
//! empty buffers and claims filled ones, free to block, and a producer
//! completion path that fills buffers at device rate and must never block or
//! allocate.
//!
//! Rather than the usual in/out queue pair, buffers are tracked by a main
//! completion-order queue holding every submitted buffer (empty and done
//! alike) and an availability queue holding only the buffers awaiting data.
//! Only the availability queue is shared with the completion context, which
//! keeps the locking it needs down to one short, non-suspending critical
//! section.
//!
//! The usual flow: the client allocates a pool with
//! [`FrameQueue::allocate_buffers`], submits buffers, and enables streaming.
//! The producer drives a [`Completer`]: [`Completer::head`] hands it the
//! first buffer to fill, and each [`Completer::advance`] records the outcome,
//! wakes any claim waiting on that buffer and returns the next one. If the
//! availability queue runs empty the producer idles until a submission
//! replenishes it. A claim on a buffer that is still being filled suspends on
//! that buffer's own condition, without holding the control lock.
//!
//! On disconnect or fatal transport error the producer calls
//! [`Completer::cancel`], which fails every buffer still awaiting data and
//! wakes all of their waiters - all of them, not just the head, since a woken
//! claimer may re-check and suspend again before the rest are marked.

pub mod arena;
pub mod buffer;
pub mod cancel;
pub mod error;
pub mod pool;
pub mod queue;

pub use buffer::{BufferState, BufferStatus, FrameBuffer, MapGuard};
pub use cancel::CancellationToken;
pub use error::{Error, Result};
pub use pool::MAX_BUFFERS;
pub use queue::{ClaimedFrame, Completer, FillOutcome, FrameQueue, QueueConfig};
