//! Session buffer pool
//!
//! Sessions churn quickly under load, and each one needs a pair of
//! fixed 2 KiB I/O buffers. Instead of allocating fresh buffers per
//! connection, finished sessions return theirs to a bounded free list
//! that the acceptor draws from. The list holds at most
//! [`MAX_POOLED`] entries; beyond that, returned buffers are dropped.

use crate::buffer::{IoBuffer, BUFFER_SIZE};
use std::sync::Mutex;

/// Upper bound on pooled buffer sets.
pub const MAX_POOLED: usize = 50;

/// The buffers a single session owns: one for bytes read from the
/// client, one for bytes read from the origin.
#[derive(Debug)]
pub struct SessionBuffers {
    pub client: IoBuffer,
    pub origin: IoBuffer,
}

impl SessionBuffers {
    fn new() -> Self {
        Self {
            client: IoBuffer::new(BUFFER_SIZE),
            origin: IoBuffer::new(BUFFER_SIZE),
        }
    }

    fn reset(&mut self) {
        self.client.reset();
        self.origin.reset();
    }
}

/// Bounded free list of [`SessionBuffers`]. Drained when dropped.
#[derive(Debug, Default)]
pub struct BufferPool {
    free: Mutex<Vec<SessionBuffers>>,
}

impl BufferPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out a buffer set, reusing a pooled one if available.
    #[must_use]
    pub fn acquire(&self) -> SessionBuffers {
        self.free
            .lock()
            .expect("buffer pool poisoned")
            .pop()
            .unwrap_or_else(SessionBuffers::new)
    }

    /// Return a buffer set. Kept only while the pool is below
    /// [`MAX_POOLED`].
    pub fn release(&self, mut buffers: SessionBuffers) {
        let mut free = self.free.lock().expect("buffer pool poisoned");
        if free.len() < MAX_POOLED {
            buffers.reset();
            free.push(buffers);
        }
    }

    #[must_use]
    pub fn pooled(&self) -> usize {
        self.free.lock().expect("buffer pool poisoned").len()
    }
}
