//! Captured guest stdout/stderr.
//!
//! Each instance owns one [`OutputCapture`] per stream. Guests write to it
//! through WASI; the host reads it back through [`OutputReader`]s. Two
//! backings exist, selected by [`OutputMode`]:
//!
//! - **Pipe**: an OS temporary file. Every reader is an independent handle
//!   opened on the same file and starts from the first byte.
//! - **Buffer**: a fixed-capacity in-memory ring. When full the oldest bytes
//!   are dropped. Readers share the ring and consume what they read.
//!
//! Once closed, further writes are silently discarded.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tempfile::NamedTempFile;
use wasmtime_wasi::{HostOutputStream, StdoutStream, StreamError, StreamResult, Subscribe};

use edgevm_common::{OutputMode, RuntimeError};

/// Largest chunk a guest may hand over in one write.
const WRITE_BUDGET: usize = 64 * 1024;

/// A captured output stream.
#[derive(Clone)]
pub struct OutputCapture {
    inner: Arc<CaptureInner>,
}

struct CaptureInner {
    closed: AtomicBool,
    backing: Backing,
}

enum Backing {
    Buffer(Mutex<Ring>),
    Pipe(Mutex<NamedTempFile>),
}

struct Ring {
    data: VecDeque<u8>,
    capacity: usize,
}

impl Ring {
    fn push(&mut self, bytes: &[u8]) {
        if self.capacity == 0 {
            return;
        }
        // Only the tail of an oversized write can survive
        let bytes = if bytes.len() > self.capacity {
            &bytes[bytes.len() - self.capacity..]
        } else {
            bytes
        };
        let overflow = (self.data.len() + bytes.len()).saturating_sub(self.capacity);
        self.data.drain(..overflow);
        self.data.extend(bytes);
    }

    fn pop_into(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.data.len());
        for (slot, byte) in buf.iter_mut().zip(self.data.drain(..n)) {
            *slot = byte;
        }
        n
    }
}

impl OutputCapture {
    /// Create a capture with the given backing.
    ///
    /// # Errors
    ///
    /// Returns an error if the temporary file for pipe mode cannot be created.
    pub fn new(mode: OutputMode, buffer_capacity: usize) -> Result<Self, RuntimeError> {
        let backing = match mode {
            OutputMode::Buffer => Backing::Buffer(Mutex::new(Ring {
                data: VecDeque::with_capacity(buffer_capacity.min(WRITE_BUDGET)),
                capacity: buffer_capacity,
            })),
            OutputMode::Pipe => Backing::Pipe(Mutex::new(NamedTempFile::new()?)),
        };

        Ok(Self {
            inner: Arc::new(CaptureInner {
                closed: AtomicBool::new(false),
                backing,
            }),
        })
    }

    /// Append bytes. A no-op once closed.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipe file cannot be written.
    pub fn write(&self, bytes: &[u8]) -> io::Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        match &self.inner.backing {
            Backing::Buffer(ring) => {
                ring.lock().push(bytes);
                Ok(())
            }
            Backing::Pipe(file) => file.lock().write_all(bytes),
        }
    }

    /// Open a reader over the captured bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipe file cannot be reopened.
    pub fn reader(&self) -> Result<OutputReader, RuntimeError> {
        match &self.inner.backing {
            Backing::Buffer(_) => Ok(OutputReader(ReaderKind::Buffer(Arc::clone(&self.inner)))),
            Backing::Pipe(file) => Ok(OutputReader(ReaderKind::Pipe(file.lock().reopen()?))),
        }
    }

    /// Stop accepting writes. Idempotent.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for OutputCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match self.inner.backing {
            Backing::Buffer(_) => OutputMode::Buffer,
            Backing::Pipe(_) => OutputMode::Pipe,
        };
        f.debug_struct("OutputCapture")
            .field("mode", &mode)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Reader over an [`OutputCapture`].
pub struct OutputReader(ReaderKind);

enum ReaderKind {
    /// Consumes from the shared ring.
    Buffer(Arc<CaptureInner>),
    /// Independent handle on the pipe file.
    Pipe(File),
}

impl Read for OutputReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.0 {
            ReaderKind::Buffer(inner) => match &inner.backing {
                Backing::Buffer(ring) => Ok(ring.lock().pop_into(buf)),
                Backing::Pipe(_) => Ok(0),
            },
            ReaderKind::Pipe(file) => file.read(buf),
        }
    }
}

impl std::fmt::Debug for OutputReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            ReaderKind::Buffer(_) => f.write_str("OutputReader::Buffer"),
            ReaderKind::Pipe(_) => f.write_str("OutputReader::Pipe"),
        }
    }
}

impl StdoutStream for OutputCapture {
    fn stream(&self) -> Box<dyn HostOutputStream> {
        Box::new(CaptureStream {
            capture: self.clone(),
        })
    }

    fn isatty(&self) -> bool {
        false
    }
}

/// WASI-facing write end of a capture.
struct CaptureStream {
    capture: OutputCapture,
}

impl HostOutputStream for CaptureStream {
    fn write(&mut self, bytes: Bytes) -> StreamResult<()> {
        self.capture
            .write(&bytes)
            .map_err(|e| StreamError::LastOperationFailed(e.into()))
    }

    fn flush(&mut self) -> StreamResult<()> {
        Ok(())
    }

    fn check_write(&mut self) -> StreamResult<usize> {
        Ok(WRITE_BUDGET)
    }
}

#[async_trait::async_trait]
impl Subscribe for CaptureStream {
    async fn ready(&mut self) {}
}
