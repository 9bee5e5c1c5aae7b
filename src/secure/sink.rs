//! Destinations for drained records

use std::io::{self, Write};

/// Marker written before the first record of a dump
pub const DUMP_START: &str = "log_dump:";
/// Marker written after the last record of a dump
pub const DUMP_END: &str = "log_dump_end:";

/// A record that passed tag and chain verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedRecord {
    /// Milliseconds since boot at write time
    pub timestamp: u32,
    /// Decrypted entry, including its trailing newline
    pub plaintext: Vec<u8>,
    /// The sealed record bytes exactly as stored on flash
    pub sealed: Vec<u8>,
}

impl VerifiedRecord {
    /// Plaintext as text, with invalid UTF-8 replaced
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.plaintext).into_owned()
    }
}

/// Receives the records of one drain
pub trait RecordSink {
    /// Called once before the first record
    fn begin(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Called for every verified record, in log order
    fn emit(&mut self, record: &VerifiedRecord) -> io::Result<()>;

    /// Called once after the last record
    fn end(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl RecordSink for Vec<VerifiedRecord> {
    fn emit(&mut self, record: &VerifiedRecord) -> io::Result<()> {
        self.push(record.clone());
        Ok(())
    }
}

/// Which bytes a [`HexLineSink`] encodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HexPayload {
    /// The sealed record, so a host holding the key can re-verify the chain
    Sealed,
    /// The decrypted entry
    Plaintext,
}

/// Line-oriented dump for serial transports
///
/// Output looks like:
///
/// ```text
/// log_dump:
/// 0A1B2C...
/// 0D4E5F...
/// log_dump_end:
/// ```
pub struct HexLineSink<W: Write> {
    writer: W,
    payload: HexPayload,
}

impl<W: Write> HexLineSink<W> {
    /// Emit sealed records
    pub fn sealed(writer: W) -> Self {
        Self {
            writer,
            payload: HexPayload::Sealed,
        }
    }

    /// Emit decrypted entries
    pub fn plaintext(writer: W) -> Self {
        Self {
            writer,
            payload: HexPayload::Plaintext,
        }
    }

    /// Recover the underlying writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> RecordSink for HexLineSink<W> {
    fn begin(&mut self) -> io::Result<()> {
        writeln!(self.writer, "{DUMP_START}")
    }

    fn emit(&mut self, record: &VerifiedRecord) -> io::Result<()> {
        let bytes = match self.payload {
            HexPayload::Sealed => &record.sealed,
            HexPayload::Plaintext => &record.plaintext,
        };
        writeln!(self.writer, "{}", hex::encode_upper(bytes))
    }

    fn end(&mut self) -> io::Result<()> {
        writeln!(self.writer, "{DUMP_END}")?;
        self.writer.flush()
    }
}
