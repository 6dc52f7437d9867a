use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::trace;

use crate::{
    Error, Result,
    constants::{BUFFER_SIZE, POOL_HIGH_WATER},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BufState {
    InUse,
    Free,
}

/// A fixed-size byte block with a logical length. Handed out by [`BufferPool`] and
/// expected to go back there through [`BufferPool::release`].
pub struct Buffer {
    data: Box<[u8]>,
    len: usize,
    state: BufState,
}

impl Buffer {
    fn new() -> Self {
        Self {
            data: vec![0u8; BUFFER_SIZE].into_boxed_slice(),
            len: 0,
            state: BufState::InUse,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn remaining(&self) -> usize {
        self.capacity() - self.len
    }

    pub fn get(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn get_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }

    /// Reserve count bytes at the end, e.g. for a header written later through
    /// [`Buffer::get_mut`].
    pub fn advance(&mut self, count: usize) {
        debug_assert!(self.len + count <= self.data.len());
        self.len = (self.len + count).min(self.data.len());
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.remaining() {
            return Err(Error::BugTooSmallBuffer {
                len: self.len + bytes.len(),
                capacity: self.capacity(),
            });
        }
        self.data[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        Ok(())
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.len)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Recycles [`Buffer`]s so that a busy tunnel doesn't allocate per packet.
pub struct BufferPool {
    free: Mutex<Vec<Buffer>>,
    high_water: usize,
    outstanding: AtomicUsize,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(POOL_HIGH_WATER)
    }
}

impl BufferPool {
    pub fn new(high_water: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            high_water,
            outstanding: AtomicUsize::new(0),
        }
    }

    pub fn acquire(&self) -> Result<Buffer> {
        let recycled = self.free.lock().pop();
        let buf = match recycled {
            Some(mut buf) => {
                if buf.state != BufState::Free {
                    return Err(Error::BugBufferInUse);
                }
                buf.state = BufState::InUse;
                buf.len = 0;
                buf
            }
            None => Buffer::new(),
        };
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        Ok(buf)
    }

    /// Acquire a buffer and fill it with a copy of bytes.
    pub fn acquire_from(&self, bytes: &[u8]) -> Result<Buffer> {
        let mut buf = self.acquire()?;
        if let Err(e) = buf.extend_from_slice(bytes) {
            self.release(buf)?;
            return Err(e);
        }
        Ok(buf)
    }

    pub fn release(&self, mut buf: Buffer) -> Result<()> {
        if buf.state == BufState::Free {
            return Err(Error::BugBufferAlreadyFree);
        }
        buf.state = BufState::Free;
        buf.len = 0;
        self.outstanding.fetch_sub(1, Ordering::Relaxed);

        let mut free = self.free.lock();
        if free.len() < self.high_water {
            free.push(buf);
        } else {
            trace!(free = free.len(), "buffer pool above high water, dropping buffer");
        }
        Ok(())
    }

    /// How many buffers were acquired and not released yet.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// How many buffers are ready for reuse.
    pub fn free_len(&self) -> usize {
        self.free.lock().len()
    }
}
