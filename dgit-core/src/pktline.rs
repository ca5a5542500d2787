//! pkt-line framing
//!
//! Every record is a 4 hex digit length (counting the prefix itself) followed
//! by the payload. The reserved length `0000` is the flush-pkt which marks a
//! section boundary and carries no payload.

use std::io::{self, Read, Write};

/// The flush-pkt marker
pub const FLUSH_PKT: &[u8] = b"0000";

/// Largest payload a single record can carry (65520 minus the prefix)
pub const MAX_PAYLOAD_LEN: usize = 65516;

const PREFIX_LEN: usize = 4;

/// pkt-line framing errors
#[derive(Debug, thiserror::Error)]
pub enum PktLineError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid pkt-line length prefix {0:?}")]
    InvalidLength(String),

    #[error("pkt-line payload too large: {0} bytes")]
    TooLarge(usize),
}

pub type Result<T> = std::result::Result<T, PktLineError>;

/// Writes pkt-line records to an underlying writer
pub struct PktLineWriter<W> {
    inner: W,
}

impl<W: Write> PktLineWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Write one record carrying `payload`
    pub fn encode(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(PktLineError::TooLarge(payload.len()));
        }
        write!(self.inner, "{:04x}", payload.len() + PREFIX_LEN)?;
        self.inner.write_all(payload)?;
        Ok(())
    }

    /// Write the flush-pkt without flushing the underlying writer
    pub fn encode_flush(&mut self) -> Result<()> {
        self.inner.write_all(FLUSH_PKT)?;
        Ok(())
    }

    /// End the current section: write the flush-pkt and push any buffered
    /// output to the underlying stream
    pub fn flush(&mut self) -> Result<()> {
        self.encode_flush()?;
        self.inner.flush()?;
        Ok(())
    }

    /// Raw access for payloads that follow the framed section (pack data)
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Reads pkt-line records one at a time
///
/// Reads exactly one record per call and never buffers ahead, so the
/// underlying reader can be taken back with [`PktLineReader::into_inner`]
/// positioned right after the last record read.
pub struct PktLineReader<R> {
    inner: R,
}

impl<R: Read> PktLineReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read the next record
    ///
    /// Returns `Ok(None)` at a clean end of stream and `Ok(Some(vec![]))` for
    /// a flush-pkt.
    pub fn read_line(&mut self) -> Result<Option<Vec<u8>>> {
        let mut prefix = [0u8; PREFIX_LEN];
        let mut filled = 0;
        while filled < PREFIX_LEN {
            match self.inner.read(&mut prefix[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stream ended inside pkt-line length",
                    )
                    .into());
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        let len = parse_length(&prefix)?;
        match len {
            0 => Ok(Some(Vec::new())),
            1..=3 => Err(PktLineError::InvalidLength(
                String::from_utf8_lossy(&prefix).into_owned(),
            )),
            _ => {
                let size = len - PREFIX_LEN;
                if size > MAX_PAYLOAD_LEN {
                    return Err(PktLineError::TooLarge(size));
                }
                let mut payload = vec![0u8; size];
                self.inner.read_exact(&mut payload)?;
                Ok(Some(payload))
            }
        }
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Iterator for PktLineReader<R> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_line().transpose()
    }
}

fn parse_length(prefix: &[u8; PREFIX_LEN]) -> Result<usize> {
    let invalid = || PktLineError::InvalidLength(String::from_utf8_lossy(prefix).into_owned());
    if !prefix.iter().all(u8::is_ascii_hexdigit) {
        return Err(invalid());
    }
    let text = std::str::from_utf8(prefix).map_err(|_| invalid())?;
    usize::from_str_radix(text, 16).map_err(|_| invalid())
}

/// Strip one trailing `\n` from a payload
pub fn trim_newline(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\n").unwrap_or(line)
}
