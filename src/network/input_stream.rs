use std::os::unix::io::RawFd;

use super::RingBuffer;
use crate::AppResult;

pub const DEFAULT_INPUT_BUFFER_SIZE: usize = 8 * 1024;

/// Accumulates bytes read from a descriptor until the parser consumes them.
///
/// `read_from` fills at most the contiguous free span of the ring, so when
/// `available()` is still short and the descriptor stays ready it must be called
/// again.
#[derive(Debug)]
pub struct InputStream {
    ring_buffer: RingBuffer,
}

impl Default for InputStream {
    fn default() -> Self {
        InputStream::new(DEFAULT_INPUT_BUFFER_SIZE)
    }
}

impl InputStream {
    pub fn new(buffer_size: usize) -> Self {
        InputStream {
            ring_buffer: RingBuffer::new(buffer_size),
        }
    }

    /// The ring from which unread data can be borrowed with `readable()`.
    pub fn buffer(&self) -> &RingBuffer {
        &self.ring_buffer
    }

    pub fn available(&self) -> usize {
        self.ring_buffer.total_size()
    }

    pub fn is_full(&self) -> bool {
        self.ring_buffer.is_full()
    }

    pub fn consume(&mut self, amount: usize) -> AppResult<()> {
        self.ring_buffer.consume(amount)
    }

    /// One read from `fd`: `None` if it would block, `Some(0)` at end of stream.
    pub fn read_from(&mut self, fd: RawFd) -> AppResult<Option<usize>> {
        self.ring_buffer.read_from(fd)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    use super::*;
    use crate::AppError;

    #[test]
    fn test_read_data_from_descriptor() -> AppResult<()> {
        let (mut writer, reader) = UnixStream::pair()?;
        let mut input_stream = InputStream::default();

        writer.write_all(b"Test")?;
        assert_eq!(input_stream.read_from(reader.as_raw_fd())?, Some(4));
        assert_eq!(input_stream.available(), 4);
        assert_eq!(input_stream.buffer().readable(), b"Test");
        Ok(())
    }

    #[test]
    fn test_consume_and_overconsume() -> AppResult<()> {
        let (mut writer, reader) = UnixStream::pair()?;
        let mut input_stream = InputStream::new(16);

        writer.write_all(b"0123456789")?;
        input_stream.read_from(reader.as_raw_fd())?;
        input_stream.consume(4)?;
        assert_eq!(input_stream.available(), 6);
        assert!(matches!(
            input_stream.consume(7),
            Err(AppError::IllegalState(_))
        ));
        assert_eq!(input_stream.available(), 6);
        Ok(())
    }

    #[test]
    fn test_repeated_reads_use_full_capacity_after_wrap() -> AppResult<()> {
        let (mut writer, reader) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        let mut input_stream = InputStream::new(8);

        writer.write_all(b"abcdef")?;
        input_stream.read_from(reader.as_raw_fd())?;
        input_stream.consume(5)?;

        writer.write_all(b"ghijklm")?;
        let mut total = 0;
        while let Some(n) = input_stream.read_from(reader.as_raw_fd())? {
            total += n;
            if input_stream.is_full() {
                break;
            }
        }
        assert_eq!(total, 7);
        assert_eq!(input_stream.available(), 8);
        Ok(())
    }
}
