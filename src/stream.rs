//! Output stream seam: the writer emits through this trait and two stock
//! implementations, one in-memory and one over any seekable sink.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("seek to negative position {0}")]
    NegativeSeek(i64),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Current,
}

/// Where OAT bytes go. `seek` returns the resulting absolute position; the
/// writer checks every returned position against its plan.
pub trait OutputStream {
    fn write_fully(&mut self, buf: &[u8]) -> Result<(), StreamError>;

    fn seek(&mut self, offset: i64, whence: Whence) -> Result<u64, StreamError>;

    /// Human-readable name for diagnostics, typically a path.
    fn location(&self) -> &str;
}

/// In-memory output stream.
///
/// Forward seeks zero-fill the buffer, so the buffer length always equals
/// the planned file length even when nothing is written after a gap.
#[derive(Debug, Default)]
pub struct VecStream {
    buf: Vec<u8>,
    pos: usize,
    location: String,
}

impl VecStream {
    pub fn new(location: impl Into<String>) -> Self {
        VecStream {
            buf: Vec::new(),
            pos: 0,
            location: location.into(),
        }
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

impl OutputStream for VecStream {
    fn write_fully(&mut self, buf: &[u8]) -> Result<(), StreamError> {
        let end = self.pos + buf.len();
        if end > self.buf.len() {
            self.buf.resize(end, 0);
        }
        self.buf[self.pos..end].copy_from_slice(buf);
        self.pos = end;
        Ok(())
    }

    fn seek(&mut self, offset: i64, whence: Whence) -> Result<u64, StreamError> {
        let target = match whence {
            Whence::Set => offset,
            Whence::Current => self.pos as i64 + offset,
        };
        if target < 0 {
            return Err(StreamError::NegativeSeek(target));
        }
        let target = target as usize;
        if target > self.buf.len() {
            self.buf.resize(target, 0);
        }
        self.pos = target;
        Ok(target as u64)
    }

    fn location(&self) -> &str {
        &self.location
    }
}

/// Output stream over any seekable sink, typically a `File`.
#[derive(Debug)]
pub struct FileStream<W> {
    inner: W,
    location: String,
}

impl<W: io::Write + io::Seek> FileStream<W> {
    pub fn new(inner: W, location: impl Into<String>) -> Self {
        FileStream {
            inner,
            location: location.into(),
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: io::Write + io::Seek> OutputStream for FileStream<W> {
    fn write_fully(&mut self, buf: &[u8]) -> Result<(), StreamError> {
        self.inner.write_all(buf)?;
        Ok(())
    }

    fn seek(&mut self, offset: i64, whence: Whence) -> Result<u64, StreamError> {
        let pos = match whence {
            Whence::Set => {
                let offset =
                    u64::try_from(offset).map_err(|_| StreamError::NegativeSeek(offset))?;
                io::SeekFrom::Start(offset)
            }
            Whence::Current => io::SeekFrom::Current(offset),
        };
        Ok(self.inner.seek(pos)?)
    }

    fn location(&self) -> &str {
        &self.location
    }
}
