use std::collections::VecDeque;
use std::io::{self, IoSlice};
use std::os::unix::io::RawFd;

use bytes::Bytes;
use tracing::trace;

use crate::service::{is_transient, AppError, AppResult};

/// Upper bound on iovecs handed to one `writev(2)`; Linux rejects more than 1024.
const MAX_IOVECS: usize = 1024;

/// Ordered queue of shared buffers waiting to be written.
///
/// Buffers are `Bytes`, so the same payload can sit in many streams at once
/// without copying. `offset` always points inside the front buffer; a buffer is
/// dropped from the queue only after its last byte has been written.
#[derive(Debug, Default)]
pub struct OutputStream {
    buffers: VecDeque<Bytes>,
    offset: usize,
}

impl OutputStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `buffer` at the tail. Empty buffers are ignored.
    pub fn append(&mut self, buffer: Bytes) {
        if !buffer.is_empty() {
            self.buffers.push_back(buffer);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Bytes still waiting to be written.
    pub fn pending(&self) -> usize {
        self.buffers.iter().map(Bytes::len).sum::<usize>() - self.offset
    }

    pub fn queued_buffers(&self) -> usize {
        self.buffers.len()
    }

    /// Writes as much of the queue as the descriptor accepts in one `writev(2)`.
    ///
    /// Returns 0 without a syscall when the queue is empty, and 0 when the
    /// descriptor would block.
    pub fn write_to(&mut self, fd: RawFd) -> AppResult<usize> {
        if self.buffers.is_empty() {
            return Ok(0);
        }

        let iov: Vec<IoSlice<'_>> = self
            .buffers
            .iter()
            .take(MAX_IOVECS)
            .enumerate()
            .map(|(i, buffer)| {
                if i == 0 {
                    IoSlice::new(&buffer[self.offset..])
                } else {
                    IoSlice::new(buffer)
                }
            })
            .collect();

        // SAFETY: `IoSlice` is ABI compatible with `iovec` on unix, and every
        // slice borrows a buffer owned by `self.buffers` for the whole call.
        let result = unsafe {
            libc::writev(
                fd,
                iov.as_ptr() as *const libc::iovec,
                iov.len() as libc::c_int,
            )
        };
        let iov_count = iov.len();
        drop(iov);

        if result < 0 {
            let err = io::Error::last_os_error();
            if is_transient(&err) {
                return Ok(0);
            }
            return Err(AppError::from_io("writev", err));
        }

        let written = result as usize;
        self.advance(written);
        trace!(fd, iov_count, written, pending = self.pending(), "output stream flush");
        Ok(written)
    }

    fn advance(&mut self, mut written: usize) {
        while written > 0 {
            let Some(front) = self.buffers.front() else {
                break;
            };
            let remaining = front.len() - self.offset;
            if written >= remaining {
                written -= remaining;
                self.buffers.pop_front();
                self.offset = 0;
            } else {
                self.offset += written;
                written = 0;
            }
        }
    }
}
