use std::sync::Arc;

use tracing::{debug, warn};

use crate::arena::{align_up, Arena};
use crate::buffer::FrameBuffer;
use crate::error::{Error, Result};

/// Hard cap on the number of buffers in a pool.
pub const MAX_BUFFERS: usize = 32;

/// Fixed pool of frame buffer descriptors over one contiguous arena.
pub(crate) struct Pool {
    arena: Arc<Arena>,
    buffers: Vec<Arc<FrameBuffer>>,
}

impl Pool {
    /// Allocate `requested` buffers of `per_buffer_len` bytes each, rounded
    /// up to `page` so buffers can be mapped individually.
    ///
    /// The buffer count is decremented until the arena allocation succeeds,
    /// so under memory pressure the pool may come back smaller than
    /// requested. Zero is `OutOfMemory`.
    pub fn allocate(requested: usize, per_buffer_len: usize, page: usize) -> Result<Pool> {
        if requested == 0 || per_buffer_len == 0 {
            return Err(Error::InvalidArgument("zero buffer count or length"));
        }
        let stride = align_up(per_buffer_len, page);
        let mut count = requested.min(MAX_BUFFERS);

        let arena = loop {
            match Arena::with_capacity(count, stride) {
                Ok(arena) => break arena,
                Err(_) if count > 1 => {
                    warn!(count, stride, "arena allocation failed, shrinking pool");
                    count -= 1;
                }
                Err(_) => return Err(Error::OutOfMemory),
            }
        };
        let arena = Arc::new(arena);

        let buffers = (0..count)
            .map(|i| {
                Arc::new(FrameBuffer::new(
                    i as u32,
                    i * stride,
                    per_buffer_len,
                    Arc::clone(&arena),
                ))
            })
            .collect();

        debug!(count, stride, "allocated buffer pool");
        Ok(Pool { arena, buffers })
    }

    /// `Busy` while any buffer's memory is externally mapped; freeing or
    /// replacing the pool must be refused in that case.
    pub fn check_unmapped(&self) -> Result<()> {
        if self.buffers.iter().any(|buf| buf.map_count() > 0) {
            return Err(Error::Busy);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<FrameBuffer>> {
        self.buffers.get(index)
    }

    pub fn buffers(&self) -> &[Arc<FrameBuffer>] {
        &self.buffers
    }

    pub fn arena_len(&self) -> usize {
        self.arena.len()
    }
}
