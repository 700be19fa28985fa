//! A concurrent-safe writer wrapper that tees everything written to an
//! underlying sink while retaining a bounded rolling tail, so a failed
//! step's error can be enriched with the last bytes of its stderr.
use std::io::{self, Write};
use std::sync::Arc;

use parking_lot::Mutex;

const DEFAULT_TAIL_BYTES: usize = 1024;

struct Inner {
    buf: Vec<u8>,
    max: usize,
}

impl Inner {
    fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        if self.buf.len() > self.max {
            let excess = self.buf.len() - self.max;
            self.buf.drain(0..excess);
        }
    }
}

/// Tees writes to `sink` (or stderr if none given) while keeping the last
/// `max` bytes (default 1024 when `max == 0`) for `tail()`.
#[derive(Clone)]
pub struct TailWriter {
    inner: Arc<Mutex<Inner>>,
    sink: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl TailWriter {
    pub fn new(sink: Option<Box<dyn Write + Send>>, max: usize) -> Self {
        let max = if max == 0 { DEFAULT_TAIL_BYTES } else { max };
        Self {
            inner: Arc::new(Mutex::new(Inner {
                buf: Vec::with_capacity(max),
                max,
            })),
            sink: Arc::new(Mutex::new(sink.unwrap_or_else(|| Box::new(io::stderr())))),
        }
    }

    /// A snapshot of the last `max` bytes written so far.
    pub fn tail(&self) -> Vec<u8> {
        self.inner.lock().buf.clone()
    }

    /// `tail()` decoded lossily as UTF-8, for attaching to error messages.
    pub fn tail_string(&self) -> String {
        String::from_utf8_lossy(&self.tail()).into_owned()
    }
}

impl Write for TailWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.sink.lock().write(buf)?;
        self.inner.lock().push(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sink.lock().flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retains_only_the_last_max_bytes() {
        let mut w = TailWriter::new(Some(Box::new(io::sink())), 4);
        w.write_all(b"abcdef").unwrap();
        assert_eq!(w.tail(), b"cdef");
    }

    #[test]
    fn defaults_to_1024_bytes_when_max_is_zero() {
        let w = TailWriter::new(Some(Box::new(io::sink())), 0);
        assert_eq!(w.inner.lock().max, 1024);
    }

    #[test]
    fn tail_reflects_true_suffix_across_many_writes() {
        let mut w = TailWriter::new(Some(Box::new(io::sink())), 5);
        for chunk in ["12", "345", "6789", "0"] {
            w.write_all(chunk.as_bytes()).unwrap();
        }
        // full stream is "123456789 0" -> last 5 bytes of "1234567890"
        assert_eq!(w.tail(), b"67890");
    }

    #[test]
    fn concurrent_writers_share_one_rolling_buffer() {
        let w = TailWriter::new(Some(Box::new(io::sink())), 1024);
        let mut a = w.clone();
        let mut b = w.clone();
        a.write_all(b"hello ").unwrap();
        b.write_all(b"world").unwrap();
        assert_eq!(w.tail_string(), "hello world");
    }
}
