//! Outbound byte stream to 'D' frame conversion.
//!
//! A cooperating TNC will split one AGWPE data frame across several radio
//! packets, but it will never concatenate two AGWPE frames into one. So
//! the best radio packing comes from emitting 'D' frames of exactly
//! `frame_length` bytes whenever there is that much to send, and holding
//! smaller writes briefly in case more bytes follow.

use std::mem;
use std::time::{Duration, Instant};

use crate::call::Addr;
use crate::frame::{DataKind, Frame, NO_PID};
use crate::timer::Timer;

/// How long a short write may sit in the coalescing buffer.
pub const MAX_WRITE_DELAY: Duration = Duration::from_millis(250);

/// Default 'D' frame payload size. Bigger is legal but some TNCs drop the
/// TCP connection when a data frame exceeds what they are willing to
/// buffer, so stay conservative unless you know your TNC.
pub const DEFAULT_FRAME_LENGTH: usize = 128;

/// Coalesces and splits one connection's outbound bytes into 'D' frames.
#[derive(Debug)]
pub struct Assembler {
    port: u8,
    call_from: String,
    call_to: String,
    max: usize,
    buf: Vec<u8>,
    timer: Timer,
}

impl Assembler {
    #[must_use]
    pub fn new(port: u8, local: &Addr, remote: &Addr, frame_length: usize) -> Self {
        Self {
            port,
            call_from: local.call(),
            call_to: remote.call(),
            max: frame_length.max(1),
            buf: Vec::new(),
            timer: Timer::default(),
        }
    }

    /// Accept one chunk of application bytes. Small chunks accumulate
    /// until the buffer fills or the delay timer fires; a chunk that
    /// overflows the buffer is split into full-size frames immediately.
    pub fn write(&mut self, chunk: &[u8]) -> Vec<Frame> {
        let mut out = Vec::new();
        if chunk.is_empty() {
            return out;
        }
        if self.buf.len() + chunk.len() < self.max {
            self.buf.extend_from_slice(chunk);
            if !self.timer.running() {
                self.timer.start(MAX_WRITE_DELAY);
            }
            return out;
        }
        let fill = self.max - self.buf.len();
        self.buf.extend_from_slice(&chunk[..fill]);
        let buf = mem::take(&mut self.buf);
        out.push(self.frame(buf));
        self.timer.stop();

        let mut rest = &chunk[fill..];
        while rest.len() >= self.max {
            out.push(self.frame(rest[..self.max].to_vec()));
            rest = &rest[self.max..];
        }
        if !rest.is_empty() {
            self.buf = rest.to_vec();
            self.timer.start(MAX_WRITE_DELAY);
        }
        out
    }

    /// Emit whatever is buffered, if anything.
    pub fn flush(&mut self) -> Option<Frame> {
        self.timer.stop();
        if self.buf.is_empty() {
            None
        } else {
            let buf = mem::take(&mut self.buf);
            Some(self.frame(buf))
        }
    }

    /// Flush if the coalescing timer has fired.
    pub fn tick(&mut self) -> Option<Frame> {
        if self.timer.expired() {
            self.flush()
        } else {
            None
        }
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.timer.deadline()
    }

    fn frame(&self, payload: Vec<u8>) -> Frame {
        Frame {
            port: self.port,
            kind: DataKind::Data,
            pid: NO_PID,
            call_from: self.call_from.clone(),
            call_to: self.call_to.clone(),
            user: 0,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;

    fn asm(max: usize) -> Result<Assembler> {
        Ok(Assembler::new(
            0,
            &Addr::new("N0CALL")?,
            &Addr::new("W1AW")?,
            max,
        ))
    }

    #[test]
    fn small_write_waits_for_timer() -> Result<()> {
        let mut a = asm(128)?;
        assert!(a.write(b"HI").is_empty());
        assert!(a.deadline().is_some());
        let f = a.flush().expect("buffered bytes");
        assert_eq!(f.payload, b"HI");
        assert_eq!(f.kind, DataKind::Data);
        assert_eq!(f.call_to, "W1AW");
        assert!(a.flush().is_none());
        assert!(a.deadline().is_none());
        Ok(())
    }

    #[test]
    fn big_chunk_splits_immediately() -> Result<()> {
        let mut a = asm(128)?;
        let input: Vec<u8> = (0..300).map(|i| i as u8).collect();
        let frames = a.write(&input);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].payload, input[..128]);
        assert_eq!(frames[1].payload, input[128..256]);
        // The 44-byte tail waits on the timer.
        assert!(a.deadline().is_some());
        assert_eq!(a.flush().expect("tail").payload, input[256..]);
        Ok(())
    }

    #[test]
    fn exact_fill_flushes_without_remainder() -> Result<()> {
        let mut a = asm(16)?;
        let frames = a.write(&[7u8; 16]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload.len(), 16);
        assert!(a.deadline().is_none());
        assert!(a.flush().is_none());
        Ok(())
    }

    #[test]
    fn conservation_across_chunkings() -> Result<()> {
        // Whatever the chunking, the concatenated payloads equal the
        // input and no frame exceeds the limit.
        let input: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        for chunk_size in [1, 7, 16, 100, 333, 1000] {
            let mut a = asm(16)?;
            let mut out = Vec::new();
            for chunk in input.chunks(chunk_size) {
                for f in a.write(chunk) {
                    assert!(f.payload.len() <= 16);
                    out.extend(f.payload);
                }
            }
            if let Some(f) = a.flush() {
                assert!(f.payload.len() <= 16);
                out.extend(f.payload);
            }
            assert_eq!(out, input, "chunk size {chunk_size}");
        }
        Ok(())
    }

    #[test]
    fn tick_only_fires_after_delay() -> Result<()> {
        let mut a = asm(128)?;
        let _ = a.write(b"short");
        assert!(a.tick().is_none());
        Ok(())
    }
}
