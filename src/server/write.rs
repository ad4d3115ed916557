//! Scheduled writes
//!
//! A non-blocking send may accept only part of the bytes offered. The unsent
//! tail is kept here and written on the next write-readiness event, ahead of
//! anything sent later, so the byte stream reaches the peer unchanged.

use bytes::{Buf, BytesMut};
use std::io::{self, Write};

/// Result of a send or flush
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    /// Every byte reached the socket
    Drained,
    /// Bytes remain scheduled; wait for write-readiness
    Pending,
}

/// Pending outbound bytes for one direction of a session
#[derive(Debug, Default)]
pub struct ScheduledWrite {
    pending: BytesMut,
}

impl ScheduledWrite {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if nothing is scheduled
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Number of scheduled bytes
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Schedule bytes without attempting a write
    pub fn push(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
    }

    /// Send `data`, scheduling whatever the writer does not take
    ///
    /// If bytes are already scheduled, `data` is queued behind them and
    /// nothing is written until a flush.
    pub fn send<W: Write + ?Sized>(&mut self, writer: &mut W, data: &[u8]) -> io::Result<Flush> {
        if !self.pending.is_empty() {
            self.pending.extend_from_slice(data);
            return Ok(Flush::Pending);
        }

        let written = write_some(writer, data)?;
        if written == data.len() {
            Ok(Flush::Drained)
        } else {
            self.pending.extend_from_slice(&data[written..]);
            Ok(Flush::Pending)
        }
    }

    /// Write scheduled bytes
    pub fn flush<W: Write + ?Sized>(&mut self, writer: &mut W) -> io::Result<Flush> {
        if self.pending.is_empty() {
            return Ok(Flush::Drained);
        }

        let written = write_some(writer, &self.pending)?;
        self.pending.advance(written);

        if self.pending.is_empty() {
            Ok(Flush::Drained)
        } else {
            Ok(Flush::Pending)
        }
    }

    /// Take every scheduled byte, leaving the buffer empty
    pub fn take(&mut self) -> BytesMut {
        self.pending.split()
    }
}

/// Write as much of `data` as the writer accepts before it would block
fn write_some<W: Write + ?Sized>(writer: &mut W, data: &[u8]) -> io::Result<usize> {
    let mut written = 0;

    while written < data.len() {
        match writer.write(&data[written..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Accepts up to `budget` bytes, then reports would-block
    struct ThrottledWriter {
        accepted: Vec<u8>,
        budget: usize,
    }

    impl ThrottledWriter {
        fn new(budget: usize) -> Self {
            ThrottledWriter {
                accepted: Vec::new(),
                budget,
            }
        }
    }

    impl Write for ThrottledWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            // Hand out at most 3 bytes per call to exercise the inner loop
            let n = buf.len().min(self.budget).min(3);
            self.accepted.extend_from_slice(&buf[..n]);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_send_complete() {
        let mut writer = ThrottledWriter::new(100);
        let mut schedule = ScheduledWrite::new();

        assert_eq!(schedule.send(&mut writer, b"hello").unwrap(), Flush::Drained);
        assert!(schedule.is_empty());
        assert_eq!(writer.accepted, b"hello");
    }

    #[test]
    fn test_partial_send_then_flush() {
        let data: Vec<u8> = (0..=255u8).collect();
        let mut writer = ThrottledWriter::new(100);
        let mut schedule = ScheduledWrite::new();

        assert_eq!(schedule.send(&mut writer, &data).unwrap(), Flush::Pending);
        assert_eq!(writer.accepted.len(), 100);
        assert_eq!(schedule.len(), 156);

        // Still blocked: nothing moves
        assert_eq!(schedule.flush(&mut writer).unwrap(), Flush::Pending);
        assert_eq!(schedule.len(), 156);

        writer.budget = 50;
        assert_eq!(schedule.flush(&mut writer).unwrap(), Flush::Pending);
        assert_eq!(schedule.len(), 106);

        writer.budget = 1000;
        assert_eq!(schedule.flush(&mut writer).unwrap(), Flush::Drained);
        assert!(schedule.is_empty());
        assert_eq!(writer.accepted, data);
    }

    #[test]
    fn test_send_while_pending_preserves_order() {
        let mut writer = ThrottledWriter::new(2);
        let mut schedule = ScheduledWrite::new();

        assert_eq!(schedule.send(&mut writer, b"abcd").unwrap(), Flush::Pending);
        writer.budget = 100;
        // Queued behind "cd" without touching the writer
        assert_eq!(schedule.send(&mut writer, b"ef").unwrap(), Flush::Pending);
        assert_eq!(writer.accepted, b"ab");

        assert_eq!(schedule.flush(&mut writer).unwrap(), Flush::Drained);
        assert_eq!(writer.accepted, b"abcdef");
    }

    #[test]
    fn test_flush_empty() {
        let mut writer = ThrottledWriter::new(0);
        let mut schedule = ScheduledWrite::new();
        assert_eq!(schedule.flush(&mut writer).unwrap(), Flush::Drained);
    }

    #[test]
    fn test_push_and_take() {
        let mut schedule = ScheduledWrite::new();
        schedule.push(b"early");
        assert_eq!(schedule.len(), 5);
        assert_eq!(&schedule.take()[..], b"early");
        assert!(schedule.is_empty());
    }

    #[test]
    fn test_write_error_propagates() {
        struct Broken;
        impl Write for Broken {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::ErrorKind::BrokenPipe.into())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut schedule = ScheduledWrite::new();
        let err = schedule.send(&mut Broken, b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
