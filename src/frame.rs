//! AGWPE frame codec and TCP stream reassembly.
//!
//! The AGWPE TCP protocol is documented at
//! https://www.sv2agw.com/downloads/develop.zip and, more readably, in the
//! Direwolf User Guide. Every frame is a fixed 36-byte header followed by
//! an optional payload:
//!
//! ```text
//! offset len  field
//! 0      1    TNC port
//! 1      3    reserved (zero)
//! 4      1    data kind (ASCII)
//! 5      1    reserved (zero)
//! 6      1    PID (0xF0 = none)
//! 7      1    reserved (zero)
//! 8      10   call from, ASCII, NUL padded
//! 18     10   call to, ASCII, NUL padded
//! 28     4    payload length, u32 LE
//! 32     4    user, u32 LE
//! 36     N    payload
//! ```
//!
//! Integers are little-endian. The header's call fields are strictly ASCII;
//! payloads are opaque bytes.

use std::fmt;

use crate::error::{Error, Result};

pub const HEADER_LEN: usize = 36;

/// PID value meaning "no layer 3 protocol".
pub const NO_PID: u8 = 0xF0;

/// Upper bound on a sane payload length. The biggest real frames are 'G'
/// port lists and 'K' raw packets, both well under a kilobyte; anything
/// past this means we lost framing on the TCP stream.
const MAX_PAYLOAD_LEN: u32 = 1 << 20;

/// The command/response class of an AGWPE frame, from header offset 4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataKind {
    /// 'G': port list request / reply.
    Ports,
    /// 'g': capabilities of one port.
    PortCaps,
    /// 'X': register a local call sign.
    Register,
    /// 'C': direct connect request / connected event.
    Connect,
    /// 'v': connect through digipeaters.
    ConnectVia,
    /// 'D': connected-mode data.
    Data,
    /// 'd': disconnect request / disconnected event.
    Disconnect,
    /// 'Y': frames in flight for one connection.
    ConnInFlight,
    /// 'y': frames in flight for one port.
    PortInFlight,
    /// 'K': raw AX.25 packet.
    Raw,
    /// 'k': toggle raw-packet reception.
    RawToggle,
    /// 'M': UNPROTO data.
    Unproto,
    /// 'V': UNPROTO through digipeaters.
    UnprotoVia,
    Other(u8),
}

impl DataKind {
    #[must_use]
    pub fn from_byte(b: u8) -> Self {
        match b {
            b'G' => DataKind::Ports,
            b'g' => DataKind::PortCaps,
            b'X' => DataKind::Register,
            b'C' => DataKind::Connect,
            b'v' => DataKind::ConnectVia,
            b'D' => DataKind::Data,
            b'd' => DataKind::Disconnect,
            b'Y' => DataKind::ConnInFlight,
            b'y' => DataKind::PortInFlight,
            b'K' => DataKind::Raw,
            b'k' => DataKind::RawToggle,
            b'M' => DataKind::Unproto,
            b'V' => DataKind::UnprotoVia,
            other => DataKind::Other(other),
        }
    }

    #[must_use]
    pub fn byte(self) -> u8 {
        match self {
            DataKind::Ports => b'G',
            DataKind::PortCaps => b'g',
            DataKind::Register => b'X',
            DataKind::Connect => b'C',
            DataKind::ConnectVia => b'v',
            DataKind::Data => b'D',
            DataKind::Disconnect => b'd',
            DataKind::ConnInFlight => b'Y',
            DataKind::PortInFlight => b'y',
            DataKind::Raw => b'K',
            DataKind::RawToggle => b'k',
            DataKind::Unproto => b'M',
            DataKind::UnprotoVia => b'V',
            DataKind::Other(b) => b,
        }
    }

    /// True for the kinds whose transmission occupies the radio channel:
    /// 'D', 'K', 'M' and 'V'. Only these count against the TNC's
    /// frames-in-flight limit.
    #[must_use]
    pub fn is_data_bearing(self) -> bool {
        matches!(
            self,
            DataKind::Data | DataKind::Raw | DataKind::Unproto | DataKind::UnprotoVia
        )
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.byte();
        if b.is_ascii_graphic() {
            write!(f, "'{}'", b as char)
        } else {
            write!(f, "0x{b:02x}")
        }
    }
}

/// One AGWPE frame in object form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub port: u8,
    pub kind: DataKind,
    pub pid: u8,
    pub call_from: String,
    pub call_to: String,
    pub user: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    /// An empty frame of the given kind. Callers fill in what they need.
    #[must_use]
    pub fn new(kind: DataKind, port: u8) -> Self {
        Self {
            port,
            kind,
            pid: NO_PID,
            call_from: String::new(),
            call_to: String::new(),
            user: 0,
            payload: Vec::new(),
        }
    }

    /// Serialize to wire form: exactly 36 header bytes plus the payload.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        debug_assert!(self.call_from.len() <= 9 && self.call_from.is_ascii());
        debug_assert!(self.call_to.len() <= 9 && self.call_to.is_ascii());
        let mut out = vec![0u8; HEADER_LEN + self.payload.len()];
        out[0] = self.port;
        out[4] = self.kind.byte();
        out[6] = self.pid;
        write_call(&mut out[8..18], &self.call_from);
        write_call(&mut out[18..28], &self.call_to);
        out[28..32].copy_from_slice(&(self.payload.len() as u32).to_le_bytes());
        out[32..36].copy_from_slice(&self.user.to_le_bytes());
        out[HEADER_LEN..].copy_from_slice(&self.payload);
        out
    }

    /// Parse one frame from the start of `buf`. The buffer must contain the
    /// whole header and payload.
    pub fn decode(buf: &[u8]) -> Result<Frame> {
        if buf.len() < HEADER_LEN {
            return Err(Error::Protocol(format!(
                "AGWPE header truncated at {} bytes",
                buf.len()
            )));
        }
        let len = header_payload_len(buf)? as usize;
        if buf.len() < HEADER_LEN + len {
            return Err(Error::Protocol(format!(
                "AGWPE payload truncated: have {}, header says {len}",
                buf.len() - HEADER_LEN
            )));
        }
        Ok(Frame {
            port: buf[0],
            kind: DataKind::from_byte(buf[4]),
            pid: buf[6],
            call_from: read_call(&buf[8..18])?,
            call_to: read_call(&buf[18..28])?,
            user: u32::from_le_bytes([buf[32], buf[33], buf[34], buf[35]]),
            payload: buf[HEADER_LEN..HEADER_LEN + len].to_vec(),
        })
    }

    /// The first four payload bytes as u32 LE, for 'y'/'Y' replies.
    #[must_use]
    pub fn payload_u32(&self) -> Option<u32> {
        let b = self.payload.get(0..4)?;
        Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

fn header_payload_len(header: &[u8]) -> Result<u32> {
    let len = u32::from_le_bytes([header[28], header[29], header[30], header[31]]);
    if len > MAX_PAYLOAD_LEN {
        return Err(Error::Protocol(format!(
            "AGWPE payload length {len} is absurd, framing lost"
        )));
    }
    Ok(len)
}

fn read_call(field: &[u8]) -> Result<String> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    let bytes = &field[..end];
    if !bytes.is_ascii() {
        return Err(Error::Protocol("non-ASCII call field in header".into()));
    }
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

fn write_call(field: &mut [u8], call: &str) {
    for (dst, src) in field.iter_mut().zip(call.bytes().take(9)) {
        *dst = src;
    }
}

/// Reassembles whole AGWPE frames from arbitrary TCP chunks.
///
/// Holds at most one partial frame: a fixed header buffer with a fill
/// count, plus the payload collected so far. Frames come out in arrival
/// order; the bytes in equal the bytes out.
#[derive(Debug)]
pub struct Receiver {
    header: [u8; HEADER_LEN],
    fill: usize,
    payload: Vec<u8>,
}

impl Default for Receiver {
    fn default() -> Self {
        Self::new()
    }
}

impl Receiver {
    #[must_use]
    pub fn new() -> Self {
        Self {
            header: [0; HEADER_LEN],
            fill: 0,
            payload: Vec::new(),
        }
    }

    /// Consume one chunk, returning every frame it completes.
    ///
    /// An error means framing is lost and the stream must be torn down;
    /// the Receiver is not usable afterwards.
    pub fn feed(&mut self, mut chunk: &[u8]) -> Result<Vec<Frame>> {
        let mut out = Vec::new();
        loop {
            if self.fill < HEADER_LEN {
                let take = (HEADER_LEN - self.fill).min(chunk.len());
                self.header[self.fill..self.fill + take].copy_from_slice(&chunk[..take]);
                self.fill += take;
                chunk = &chunk[take..];
                if self.fill < HEADER_LEN {
                    break;
                }
            }
            let need = header_payload_len(&self.header)? as usize;
            let take = (need - self.payload.len()).min(chunk.len());
            self.payload.extend_from_slice(&chunk[..take]);
            chunk = &chunk[take..];
            if self.payload.len() < need {
                break;
            }
            let mut whole = self.header.to_vec();
            whole.append(&mut self.payload);
            out.push(Frame::decode(&whole)?);
            self.fill = 0;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Frame {
        Frame {
            port: 1,
            kind: DataKind::Data,
            pid: NO_PID,
            call_from: "N0CALL".into(),
            call_to: "W1AW".into(),
            user: 0,
            payload: b"HI".to_vec(),
        }
    }

    #[test]
    fn encode_is_byte_exact() {
        let mut want = vec![0u8; 38];
        want[0] = 1;
        want[4] = b'D';
        want[6] = 0xF0;
        want[8..14].copy_from_slice(b"N0CALL");
        want[18..22].copy_from_slice(b"W1AW");
        want[28] = 2; // payload length, LE
        want[36..38].copy_from_slice(b"HI");
        assert_eq!(sample().encode(), want);
    }

    #[test]
    fn round_trip() -> Result<()> {
        let f = sample();
        assert_eq!(Frame::decode(&f.encode())?, f);
        let g = Frame {
            port: 255,
            kind: DataKind::Ports,
            pid: 0,
            call_from: String::new(),
            call_to: String::new(),
            user: 0xDEAD_BEEF,
            payload: vec![],
        };
        assert_eq!(Frame::decode(&g.encode())?, g);
        Ok(())
    }

    #[test]
    fn short_header_rejected() {
        assert!(Frame::decode(&[0u8; 35]).is_err());
    }

    #[test]
    fn payload_u32() {
        let mut f = Frame::new(DataKind::PortInFlight, 0);
        f.payload = 8u32.to_le_bytes().to_vec();
        assert_eq!(f.payload_u32(), Some(8));
        f.payload = vec![1, 2];
        assert_eq!(f.payload_u32(), None);
    }

    #[test]
    fn receiver_one_byte_at_a_time() -> Result<()> {
        let f = sample();
        let bytes = f.encode();
        let mut r = Receiver::new();
        let mut got = Vec::new();
        for b in &bytes {
            got.extend(r.feed(std::slice::from_ref(b))?);
        }
        assert_eq!(got, vec![f]);
        Ok(())
    }

    #[test]
    fn receiver_coalesced_frames() -> Result<()> {
        let a = sample();
        let mut b = Frame::new(DataKind::PortInFlight, 0);
        b.payload = 3u32.to_le_bytes().to_vec();
        let c = Frame::new(DataKind::Disconnect, 2);

        let mut bytes = a.encode();
        bytes.extend(b.encode());
        bytes.extend(c.encode());
        // Split at an awkward boundary inside the second header.
        let mut r = Receiver::new();
        let mut got = r.feed(&bytes[..50])?;
        got.extend(r.feed(&bytes[50..])?);
        assert_eq!(got, vec![a, b, c]);
        Ok(())
    }

    #[test]
    fn receiver_zero_payload_frame_at_chunk_end() -> Result<()> {
        let f = Frame::new(DataKind::RawToggle, 0);
        let mut r = Receiver::new();
        let got = r.feed(&f.encode())?;
        assert_eq!(got, vec![f]);
        Ok(())
    }

    #[test]
    fn receiver_absurd_length_is_fatal() {
        let mut bytes = Frame::new(DataKind::Data, 0).encode();
        bytes[28..32].copy_from_slice(&u32::MAX.to_le_bytes());
        let mut r = Receiver::new();
        assert!(r.feed(&bytes).is_err());
    }
}
