use std::io;
use std::os::unix::io::RawFd;

use tracing::trace;

use crate::service::{is_transient, AppError, AppResult};

/// Fixed-capacity circular byte buffer.
///
/// State is `(read, count)`; the write cursor is derived as `(read + count) % capacity`.
/// A single fill from a descriptor only covers the contiguous free span that ends at
/// the read cursor or at the physical end of the store, whichever comes first, so
/// using the whole free capacity may take two fills.
#[derive(Debug)]
pub struct RingBuffer {
    store: Box<[u8]>,
    read: usize,
    count: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be > 0");
        RingBuffer {
            store: vec![0u8; capacity].into_boxed_slice(),
            read: 0,
            count: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.store.len()
    }

    /// Number of unread bytes.
    #[inline]
    pub fn total_size(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.count == self.capacity()
    }

    #[inline]
    fn write_cursor(&self) -> usize {
        (self.read + self.count) % self.capacity()
    }

    /// Unread bytes from the read cursor up to the write cursor or the physical end.
    pub fn readable(&self) -> &[u8] {
        let end = (self.read + self.count).min(self.capacity());
        &self.store[self.read..end]
    }

    /// Free bytes from the write cursor up to the read cursor or the physical end.
    pub fn writable(&mut self) -> &mut [u8] {
        if self.is_full() {
            return &mut [];
        }
        let start = self.write_cursor();
        let end = if start >= self.read {
            self.capacity()
        } else {
            self.read
        };
        &mut self.store[start..end]
    }

    /// Marks `amount` bytes of the writable span as filled.
    pub fn commit(&mut self, amount: usize) -> AppResult<()> {
        if amount > self.capacity() - self.count {
            return Err(AppError::IllegalState(format!(
                "commit {} bytes exceeds free space {}",
                amount,
                self.capacity() - self.count
            )));
        }
        self.count += amount;
        Ok(())
    }

    /// Copies as much of `data` as fits, returning the number of bytes taken.
    pub fn write(&mut self, mut data: &[u8]) -> usize {
        let mut total = 0;
        while !data.is_empty() {
            let span = self.writable();
            if span.is_empty() {
                break;
            }
            let n = span.len().min(data.len());
            span[..n].copy_from_slice(&data[..n]);
            self.count += n;
            data = &data[n..];
            total += n;
        }
        total
    }

    pub fn consume(&mut self, amount: usize) -> AppResult<()> {
        if amount > self.count {
            return Err(AppError::IllegalState(format!(
                "consume {} bytes but only {} available",
                amount, self.count
            )));
        }
        self.read = (self.read + amount) % self.capacity();
        self.count -= amount;
        if self.count == 0 {
            // keep the next fill as large as possible
            self.read = 0;
        }
        Ok(())
    }

    /// Issues exactly one `read(2)` into the writable span.
    ///
    /// Returns `Ok(None)` when the descriptor would block, `Ok(Some(0))` at end of
    /// stream and `Ok(Some(n))` otherwise. Reading into a full buffer is rejected.
    pub fn read_from(&mut self, fd: RawFd) -> AppResult<Option<usize>> {
        let span = self.writable();
        if span.is_empty() {
            return Err(AppError::IllegalState(
                "read into a full ring buffer".into(),
            ));
        }
        let len = span.len();
        // SAFETY: `span` is a live, exclusively borrowed region of `len` bytes.
        let result = unsafe { libc::read(fd, span.as_mut_ptr() as *mut libc::c_void, len) };
        if result < 0 {
            let err = io::Error::last_os_error();
            if is_transient(&err) {
                return Ok(None);
            }
            return Err(AppError::from_io("read", err));
        }
        let n = result as usize;
        self.count += n;
        trace!(fd, requested = len, read = n, available = self.count, "ring buffer fill");
        Ok(Some(n))
    }
}
