//! AX.25 packet codec.
//!
//! The packet format is AX.25 2.2, https://www.tapr.org/pdf/AX25.2.2.pdf:
//! 7-byte addresses (characters shifted left one bit, SSID byte carrying
//! the end-of-addresses marker in bit 0), one control byte, an optional
//! PID byte for I and UI frames, then the information field.
//!
//! Command vs response travels in bit 7 of the destination and source SSID
//! bytes respectively. For S frames the poll/final bit rides on those same
//! address bits (an S command polls, an S response finalizes); for I and U
//! frames it is bit 4 of the control byte.

use std::fmt;

use crate::call::Addr;
use crate::error::{Error, Result};

/// One hop of a digipeater path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Via {
    pub addr: Addr,
    /// The has-been-repeated marker, bit 7 of the SSID byte.
    pub repeated: bool,
}

impl Via {
    #[must_use]
    pub fn new(addr: Addr) -> Self {
        Self {
            addr,
            repeated: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketType {
    Iframe { nr: u8, ns: u8, pid: u8, info: Vec<u8> },
    Ui { pid: u8, info: Vec<u8> },
    Rr { nr: u8 },
    Rnr { nr: u8 },
    Rej { nr: u8 },
    Srej { nr: u8 },
    Sabm,
    Sabme,
    Disc,
    Dm,
    Ua,
    Frmr,
    Xid,
    Test,
}

impl PacketType {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            PacketType::Iframe { .. } => "I",
            PacketType::Ui { .. } => "UI",
            PacketType::Rr { .. } => "RR",
            PacketType::Rnr { .. } => "RNR",
            PacketType::Rej { .. } => "REJ",
            PacketType::Srej { .. } => "SREJ",
            PacketType::Sabm => "SABM",
            PacketType::Sabme => "SABME",
            PacketType::Disc => "DISC",
            PacketType::Dm => "DM",
            PacketType::Ua => "UA",
            PacketType::Frmr => "FRMR",
            PacketType::Xid => "XID",
            PacketType::Test => "TEST",
        }
    }

    fn is_s(&self) -> bool {
        matches!(
            self,
            PacketType::Rr { .. }
                | PacketType::Rnr { .. }
                | PacketType::Rej { .. }
                | PacketType::Srej { .. }
        )
    }
}

/// A decoded (or to-be-encoded) AX.25 packet.
///
/// `command`/`response` and `poll`/`fin` are pairs of mutually exclusive
/// flags; `encode` rejects a packet that sets both of a pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// TNC port the packet was heard on / should be sent on. Not part of
    /// the radio bytes; it rides in the AGWPE 'K' wrapper.
    pub port: u8,
    pub dst: Addr,
    pub src: Addr,
    pub via: Vec<Via>,
    pub command: bool,
    pub response: bool,
    pub poll: bool,
    pub fin: bool,
    pub packet_type: PacketType,
}

// Control bytes without their P/F and sequence bits.
const CONTROL_UI: u8 = 0x03;
const CONTROL_SABM: u8 = 0x2F;
const CONTROL_SABME: u8 = 0x6F;
const CONTROL_DISC: u8 = 0x43;
const CONTROL_DM: u8 = 0x0F;
const CONTROL_UA: u8 = 0x63;
const CONTROL_FRMR: u8 = 0x87;
const CONTROL_XID: u8 = 0xAF;
const CONTROL_TEST: u8 = 0xE3;
const CONTROL_RR: u8 = 0x01;
const CONTROL_RNR: u8 = 0x05;
const CONTROL_REJ: u8 = 0x09;
const CONTROL_SREJ: u8 = 0x0D;

const PF_BIT: u8 = 0x10;

/// Dest + source + at most eight digipeaters.
const MAX_ADDRESSES: usize = 10;

impl Packet {
    /// Serialize to radio bytes (without the AGWPE 'K' port byte).
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.poll && self.fin {
            return Err(Error::Protocol("both P and F set".into()));
        }
        if self.command && self.response {
            return Err(Error::Protocol("both command and response set".into()));
        }
        if self.via.len() > MAX_ADDRESSES - 2 {
            return Err(Error::ViaTooLong(self.via.len()));
        }
        let is_s = self.packet_type.is_s();
        let dst_top = self.command || (is_s && self.poll);
        let src_top = self.response || (is_s && self.fin);

        let mut out = Vec::with_capacity(16);
        out.extend(encode_addr(&self.dst, dst_top, false));
        out.extend(encode_addr(&self.src, src_top, self.via.is_empty()));
        for (i, v) in self.via.iter().enumerate() {
            out.extend(encode_addr(&v.addr, v.repeated, i + 1 == self.via.len()));
        }

        let pf = u8::from(self.poll || self.fin) * PF_BIT;
        match &self.packet_type {
            PacketType::Iframe { nr, ns, pid, info } => {
                out.push((*nr << 5) | pf | (*ns << 1));
                out.push(*pid);
                out.extend_from_slice(info);
            }
            PacketType::Ui { pid, info } => {
                out.push(CONTROL_UI | pf);
                out.push(*pid);
                out.extend_from_slice(info);
            }
            // S frames: P/F is on the address bits, not the control byte.
            PacketType::Rr { nr } => out.push((*nr << 5) | CONTROL_RR),
            PacketType::Rnr { nr } => out.push((*nr << 5) | CONTROL_RNR),
            PacketType::Rej { nr } => out.push((*nr << 5) | CONTROL_REJ),
            PacketType::Srej { nr } => out.push((*nr << 5) | CONTROL_SREJ),
            PacketType::Sabm => out.push(CONTROL_SABM | pf),
            PacketType::Sabme => out.push(CONTROL_SABME | pf),
            PacketType::Disc => out.push(CONTROL_DISC | pf),
            PacketType::Dm => out.push(CONTROL_DM | pf),
            PacketType::Ua => out.push(CONTROL_UA | pf),
            PacketType::Frmr => out.push(CONTROL_FRMR | pf),
            PacketType::Xid => out.push(CONTROL_XID | pf),
            PacketType::Test => out.push(CONTROL_TEST | pf),
        }
        Ok(out)
    }

    /// Parse radio bytes heard on `port`.
    pub fn decode(port: u8, bytes: &[u8]) -> Result<Packet> {
        let mut addrs: Vec<(Addr, bool)> = Vec::new();
        let mut pos = 0;
        loop {
            if pos + 7 > bytes.len() {
                return Err(Error::Protocol("AX.25 address field out of bounds".into()));
            }
            if addrs.len() >= MAX_ADDRESSES {
                return Err(Error::Protocol("more than 8 digipeaters".into()));
            }
            let chunk = &bytes[pos..pos + 7];
            addrs.push(decode_addr(chunk)?);
            pos += 7;
            if chunk[6] & 0x01 != 0 {
                break;
            }
        }
        if addrs.len() < 2 {
            return Err(Error::Protocol("AX.25 source address missing".into()));
        }
        let mut it = addrs.into_iter();
        let (dst, dst_top) = match it.next() {
            Some(a) => a,
            None => return Err(Error::Protocol("AX.25 destination missing".into())),
        };
        let (src, src_top) = match it.next() {
            Some(a) => a,
            None => return Err(Error::Protocol("AX.25 source missing".into())),
        };
        let via = it
            .map(|(addr, repeated)| Via { addr, repeated })
            .collect::<Vec<_>>();

        let command = dst_top && !src_top;
        let response = src_top && !dst_top;

        let control = *bytes
            .get(pos)
            .ok_or_else(|| Error::Protocol("AX.25 control byte missing".into()))?;
        pos += 1;

        // P/F from the control byte; a response's bit means F, else P.
        let pf_bit = control & PF_BIT != 0;
        let mut poll = pf_bit && !response;
        let mut fin = pf_bit && response;

        let packet_type = if control & 0x01 == 0 {
            let (pid, info) = read_pid_info(bytes, pos)?;
            PacketType::Iframe {
                nr: control >> 5,
                ns: (control >> 1) & 0x07,
                pid,
                info,
            }
        } else if control & 0x02 == 0 {
            // S frame: P/F was carried on the address top bits.
            poll = command;
            fin = response;
            let nr = control >> 5;
            match control & 0x0F {
                CONTROL_RR => PacketType::Rr { nr },
                CONTROL_RNR => PacketType::Rnr { nr },
                CONTROL_REJ => PacketType::Rej { nr },
                CONTROL_SREJ => PacketType::Srej { nr },
                other => {
                    return Err(Error::Protocol(format!(
                        "unknown S control byte 0x{other:02x}"
                    )))
                }
            }
        } else {
            match control & !PF_BIT {
                CONTROL_UI => {
                    let (pid, info) = read_pid_info(bytes, pos)?;
                    PacketType::Ui { pid, info }
                }
                CONTROL_SABM => PacketType::Sabm,
                CONTROL_SABME => PacketType::Sabme,
                CONTROL_DISC => PacketType::Disc,
                CONTROL_DM => PacketType::Dm,
                CONTROL_UA => PacketType::Ua,
                // FRMR carries three status octets; tolerated and ignored.
                CONTROL_FRMR => PacketType::Frmr,
                CONTROL_XID => PacketType::Xid,
                CONTROL_TEST => PacketType::Test,
                other => {
                    return Err(Error::Protocol(format!(
                        "unknown U control byte 0x{other:02x}"
                    )))
                }
            }
        };

        Ok(Packet {
            port,
            dst,
            src,
            via,
            command,
            response,
            poll,
            fin,
            packet_type,
        })
    }
}

impl fmt::Display for Packet {
    /// TNC-2 style monitor line: `SRC>DST,DIGI*: <TYPE> info`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}>{}", self.src, self.dst)?;
        for v in &self.via {
            write!(f, ",{}{}", v.addr, if v.repeated { "*" } else { "" })?;
        }
        write!(f, " <{}>", self.packet_type.name())?;
        match &self.packet_type {
            PacketType::Iframe { info, .. } | PacketType::Ui { info, .. } => {
                write!(f, ": {}", String::from_utf8_lossy(info))
            }
            PacketType::Rr { nr }
            | PacketType::Rnr { nr }
            | PacketType::Rej { nr }
            | PacketType::Srej { nr } => write!(f, " nr={nr}"),
            _ => Ok(()),
        }
    }
}

fn read_pid_info(bytes: &[u8], mut pos: usize) -> Result<(u8, Vec<u8>)> {
    let mut pid = *bytes
        .get(pos)
        .ok_or_else(|| Error::Protocol("AX.25 PID byte missing".into()))?;
    pos += 1;
    // 0xFF and 0x08 mean the real PID is escaped into the next byte.
    if pid == 0xFF || pid == 0x08 {
        pid = *bytes
            .get(pos)
            .ok_or_else(|| Error::Protocol("escaped PID byte missing".into()))?;
        pos += 1;
    }
    Ok((pid, bytes.get(pos..).unwrap_or_default().to_vec()))
}

fn encode_addr(addr: &Addr, top: bool, last: bool) -> [u8; 7] {
    let mut out = [b' ' << 1; 7];
    for (dst, b) in out.iter_mut().zip(addr.base().bytes()) {
        *dst = b << 1;
    }
    // 0x60 are the reserved bits, set to one by every TNC since the 80s.
    out[6] = 0x60 | (addr.ssid() << 1) | u8::from(last) | if top { 0x80 } else { 0 };
    out
}

fn decode_addr(chunk: &[u8]) -> Result<(Addr, bool)> {
    let base: String = chunk[..6].iter().map(|&b| (b >> 1) as char).collect();
    let base = base.trim_end();
    let ssid = (chunk[6] >> 1) & 0x0F;
    let addr = if ssid == 0 {
        Addr::new(base)?
    } else {
        Addr::new(&format!("{base}-{ssid}"))?
    };
    Ok((addr, chunk[6] & 0x80 != 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Addr {
        Addr::new(s).expect("test call sign")
    }

    #[test]
    fn ui_response_is_byte_exact() -> Result<()> {
        // Known-good bytes: APRS beacon, N0CALL>APRS with the source C-bit.
        let p = Packet {
            port: 0,
            dst: addr("APRS"),
            src: addr("N0CALL"),
            via: vec![],
            command: false,
            response: true,
            poll: false,
            fin: false,
            packet_type: PacketType::Ui {
                pid: 0xF0,
                info: b"Hello APRS!".to_vec(),
            },
        };
        let mut want = Vec::new();
        want.extend_from_slice(&[0x82, 0xA0, 0xA4, 0xA6, 0x40, 0x40, 0x60]);
        want.extend_from_slice(&[0x9C, 0x60, 0x86, 0x82, 0x98, 0x98, 0xE1]);
        want.extend_from_slice(&[0x03, 0xF0]);
        want.extend_from_slice(b"Hello APRS!");
        assert_eq!(p.encode()?, want);
        assert_eq!(Packet::decode(0, &want)?, p);
        Ok(())
    }

    #[test]
    fn iframe_round_trip() -> Result<()> {
        let p = Packet {
            port: 3,
            dst: addr("M0THC-2"),
            src: addr("M0THC-1"),
            via: vec![],
            command: true,
            response: false,
            poll: true,
            fin: false,
            packet_type: PacketType::Iframe {
                nr: 5,
                ns: 3,
                pid: 0xF0,
                info: vec![1, 2, 3],
            },
        };
        assert_eq!(Packet::decode(3, &p.encode()?)?, p);
        Ok(())
    }

    #[test]
    fn iframe_control_bits() -> Result<()> {
        // ns=3 in bits 1-3, poll in bit 4, nr=5 in bits 5-7 = 0xB6.
        let p = Packet {
            port: 0,
            dst: addr("A"),
            src: addr("B"),
            via: vec![],
            command: true,
            response: false,
            poll: true,
            fin: false,
            packet_type: PacketType::Iframe {
                nr: 5,
                ns: 3,
                pid: 0xF0,
                info: vec![],
            },
        };
        let bytes = p.encode()?;
        assert_eq!(bytes[14], 0xB6);
        Ok(())
    }

    #[test]
    fn s_frame_poll_rides_on_address_bit() -> Result<()> {
        let p = Packet {
            port: 0,
            dst: addr("M0THC-2"),
            src: addr("M0THC-1"),
            via: vec![],
            command: true,
            response: false,
            poll: true,
            fin: false,
            packet_type: PacketType::Rr { nr: 3 },
        };
        let bytes = p.encode()?;
        // Control byte has no P bit; the destination SSID byte does.
        assert_eq!(bytes[14], (3 << 5) | 0x01);
        assert_eq!(bytes[6] & 0x80, 0x80);
        assert_eq!(bytes[13] & 0x80, 0);
        assert_eq!(Packet::decode(0, &bytes)?, p);

        let q = Packet {
            command: false,
            response: true,
            poll: false,
            fin: true,
            ..p
        };
        let bytes = q.encode()?;
        assert_eq!(bytes[6] & 0x80, 0);
        assert_eq!(bytes[13] & 0x80, 0x80);
        assert_eq!(Packet::decode(0, &bytes)?, q);
        Ok(())
    }

    #[test]
    fn sabm_round_trip() -> Result<()> {
        let p = Packet {
            port: 0,
            dst: addr("M0THC-2"),
            src: addr("M0THC-1"),
            via: vec![],
            command: true,
            response: false,
            poll: true,
            fin: false,
            packet_type: PacketType::Sabm,
        };
        let bytes = p.encode()?;
        assert_eq!(bytes[14], 0x3F); // SABM with P
        assert_eq!(Packet::decode(0, &bytes)?, p);
        Ok(())
    }

    #[test]
    fn digipeater_path_round_trip() -> Result<()> {
        let p = Packet {
            port: 1,
            dst: addr("APRS"),
            src: addr("N0CALL-7"),
            via: vec![
                Via {
                    addr: addr("WIDE1-1"),
                    repeated: true,
                },
                Via {
                    addr: addr("WIDE2-1"),
                    repeated: false,
                },
            ],
            command: true,
            response: false,
            poll: false,
            fin: false,
            packet_type: PacketType::Ui {
                pid: 0xF0,
                info: b"!4903.50N/07201.75W-".to_vec(),
            },
        };
        let bytes = p.encode()?;
        let q = Packet::decode(1, &bytes)?;
        assert_eq!(q, p);
        // End-of-addresses bit only on the final digipeater.
        assert_eq!(bytes[13] & 0x01, 0);
        assert_eq!(bytes[20] & 0x01, 0);
        assert_eq!(bytes[27] & 0x01, 1);
        Ok(())
    }

    #[test]
    fn escaped_pid_consumes_extra_byte() -> Result<()> {
        let p = Packet {
            port: 0,
            dst: addr("A"),
            src: addr("B"),
            via: vec![],
            command: true,
            response: false,
            poll: false,
            fin: false,
            packet_type: PacketType::Ui {
                pid: 0xF0,
                info: b"x".to_vec(),
            },
        };
        let mut bytes = p.encode()?;
        // Splice in an escape marker before the real PID.
        bytes.insert(15, 0xFF);
        let q = Packet::decode(0, &bytes)?;
        assert_eq!(q.packet_type, p.packet_type);
        Ok(())
    }

    #[test]
    fn encode_rejects_conflicting_flags() {
        let mut p = Packet {
            port: 0,
            dst: addr("A"),
            src: addr("B"),
            via: vec![],
            command: true,
            response: true,
            poll: false,
            fin: false,
            packet_type: PacketType::Ua,
        };
        assert!(p.encode().is_err());
        p.response = false;
        p.poll = true;
        p.fin = true;
        assert!(p.encode().is_err());
    }

    #[test]
    fn encode_rejects_long_via_path() {
        let p = Packet {
            port: 0,
            dst: addr("A"),
            src: addr("B"),
            via: (0..9).map(|i| Via::new(addr(&format!("D{i}")))).collect(),
            command: true,
            response: false,
            poll: false,
            fin: false,
            packet_type: PacketType::Disc,
        };
        assert!(p.encode().is_err());
    }

    #[test]
    fn decode_bounds_errors() {
        assert!(Packet::decode(0, &[0x82, 0xA0]).is_err());
        // Addresses never terminated.
        let bytes = [0x82u8; 7 * 11];
        assert!(Packet::decode(0, &bytes).is_err());
    }

    #[test]
    fn monitor_format() -> Result<()> {
        let p = Packet {
            port: 0,
            dst: addr("APRS"),
            src: addr("N0CALL"),
            via: vec![Via {
                addr: addr("WIDE1-1"),
                repeated: true,
            }],
            command: true,
            response: false,
            poll: false,
            fin: false,
            packet_type: PacketType::Ui {
                pid: 0xF0,
                info: b"hi".to_vec(),
            },
        };
        assert_eq!(p.to_string(), "N0CALL>APRS,WIDE1-1* <UI>: hi");
        Ok(())
    }
}
