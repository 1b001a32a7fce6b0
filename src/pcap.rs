//! pcap capture files for monitored packets.
//!
//! The classic pcap format is a 24-byte file header followed by
//! length-prefixed packet records; simple enough that linking libpcap (or
//! pulling a crate) for the writing side is not worth it. Files use
//! LINKTYPE_AX25, so Wireshark dissects the raw bytes from the 'K' stream
//! directly.
//!
//! References:
//! * https://wiki.wireshark.org/Development/LibpcapFileFormat
//! * https://www.tcpdump.org/linktypes.html

use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::Result;

// Little-endian magic; timestamps in seconds + microseconds.
const MAGIC: [u8; 4] = [0xd4, 0xc3, 0xb2, 0xa1];
const VERSION_MAJOR: u16 = 2;
const VERSION_MINOR: u16 = 4;
const LINKTYPE_AX25: u32 = 3;

// Conventional "capture everything" snap length.
const SNAPLEN: u32 = 65535;

fn write_u16(mut w: impl Write, v: u16) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn write_u32(mut w: impl Write, v: u32) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

/// Writes AX.25 packets to a pcap file.
///
/// Output is buffered; call [`PcapWriter::flush`] (or drop the writer) if
/// the file is being watched live.
pub struct PcapWriter {
    f: BufWriter<std::fs::File>,
}

impl PcapWriter {
    /// Create a new capture file. Refuses to overwrite an existing one.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let mut f = BufWriter::new(
            std::fs::File::options()
                .write(true)
                .create_new(true)
                .open(path)?,
        );
        f.write_all(&MAGIC)?;
        write_u16(&mut f, VERSION_MAJOR)?;
        write_u16(&mut f, VERSION_MINOR)?;
        // GMT offset and timestamp accuracy: every tool writes zero.
        write_u32(&mut f, 0)?;
        write_u32(&mut f, 0)?;
        write_u32(&mut f, SNAPLEN)?;
        write_u32(&mut f, LINKTYPE_AX25)?;
        Ok(Self { f })
    }

    /// Append one packet, stamped with the current wall clock.
    ///
    /// If this fails the record may be half-written and the file should
    /// not be appended to again.
    pub fn write(&mut self, packet: &[u8]) -> Result<()> {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .unwrap_or_default();
        let len = packet.len() as u32;
        write_u32(&mut self.f, now.as_secs() as u32)?;
        write_u32(&mut self.f, now.subsec_micros())?;
        write_u32(&mut self.f, len)?;
        write_u32(&mut self.f, len)?;
        self.f.write_all(packet)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.f.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_and_record_layout() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("ragwpe-pcap-{}", std::process::id()));
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("capture.pcap");
        let _ = std::fs::remove_file(&path);

        let mut w = PcapWriter::create(&path)?;
        w.write(&[0xAA, 0xBB, 0xCC])?;
        w.flush()?;
        drop(w);

        let bytes = std::fs::read(&path)?;
        assert_eq!(&bytes[..4], &MAGIC);
        assert_eq!(&bytes[20..24], &LINKTYPE_AX25.to_le_bytes());
        // 24-byte file header, 16-byte record header, 3 bytes of packet.
        assert_eq!(bytes.len(), 24 + 16 + 3);
        assert_eq!(&bytes[32..36], &3u32.to_le_bytes());
        assert_eq!(&bytes[40..], &[0xAA, 0xBB, 0xCC]);

        std::fs::remove_file(&path)?;
        Ok(())
    }

    #[test]
    fn refuses_to_overwrite() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("ragwpe-pcap2-{}", std::process::id()));
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("existing.pcap");
        std::fs::write(&path, b"precious")?;
        assert!(PcapWriter::create(&path).is_err());
        std::fs::remove_file(&path)?;
        Ok(())
    }
}
