//! Reusable receive buffers.
//!
//! Every receive borrows a fixed-capacity buffer for the duration of one
//! decode. The guard hands it back on drop, so decode failures and early
//! returns release it too.

use std::ops::{Deref, DerefMut};
use std::sync::Mutex;

/// Idle buffers kept around. The loop and the kill listener are the only
/// concurrent receivers, so a handful is plenty.
const MAX_IDLE: usize = 4;

/// Arena of equally sized byte buffers.
#[derive(Debug)]
pub struct BufferPool {
    buffer_size: usize,
    idle: Mutex<Vec<Box<[u8]>>>,
}

impl BufferPool {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size,
            idle: Mutex::new(Vec::new()),
        }
    }

    pub const fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Take a buffer, allocating only when none is idle.
    pub fn acquire(&self) -> PooledBuffer<'_> {
        let buf = self
            .idle
            .lock()
            .ok()
            .and_then(|mut idle| idle.pop())
            .unwrap_or_else(|| vec![0u8; self.buffer_size].into_boxed_slice());
        PooledBuffer {
            pool: self,
            buf: Some(buf),
        }
    }

    fn release(&self, buf: Box<[u8]>) {
        if let Ok(mut idle) = self.idle.lock() {
            if idle.len() < MAX_IDLE {
                idle.push(buf);
            }
        }
    }

    #[cfg(test)]
    fn idle_count(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }
}

/// Scoped loan of one pool buffer.
#[derive(Debug)]
pub struct PooledBuffer<'a> {
    pool: &'a BufferPool,
    buf: Option<Box<[u8]>>,
}

impl Deref for PooledBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or_default()
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or_default()
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}
