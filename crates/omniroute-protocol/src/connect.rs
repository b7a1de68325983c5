//! Connect-RPC stream framing: 1 flag byte + 4-byte big-endian length,
//! followed by the payload. Payloads may be gzip-compressed (flag bit 0x01);
//! bit 0x02 marks the end-of-stream trailer frame.

use std::io::Read;

use bytes::Bytes;
use flate2::read::GzDecoder;

pub const FLAG_COMPRESSED: u8 = 0x01;
pub const FLAG_END_STREAM: u8 = 0x02;

#[derive(Debug, Clone)]
pub struct ConnectFrame {
    pub flags: u8,
    pub payload: Bytes,
}

impl ConnectFrame {
    pub fn is_end_stream(&self) -> bool {
        self.flags & FLAG_END_STREAM != 0
    }

    /// Payload with gzip undone when the compressed flag is set.
    pub fn decoded_payload(&self) -> Result<Bytes, FrameError> {
        if self.flags & FLAG_COMPRESSED == 0 {
            return Ok(self.payload.clone());
        }
        let mut out = Vec::new();
        GzDecoder::new(self.payload.as_ref())
            .read_to_end(&mut out)
            .map_err(|err| FrameError::Gzip(err.to_string()))?;
        Ok(Bytes::from(out))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    Oversized(usize),
    Gzip(String),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Oversized(len) => write!(f, "connect frame too large: {len} bytes"),
            FrameError::Gzip(msg) => write!(f, "gzip inflate failed: {msg}"),
        }
    }
}

impl std::error::Error for FrameError {}

const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

pub fn encode_frame(flags: u8, payload: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(5 + payload.len());
    out.push(flags);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    Bytes::from(out)
}

/// Incremental frame decoder; bytes arrive in arbitrary chunk boundaries.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<ConnectFrame>, FrameError> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        loop {
            if self.buf.len() < 5 {
                return Ok(frames);
            }
            let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]])
                as usize;
            if len > MAX_FRAME_LEN {
                return Err(FrameError::Oversized(len));
            }
            if self.buf.len() < 5 + len {
                return Ok(frames);
            }
            let flags = self.buf[0];
            let payload = Bytes::copy_from_slice(&self.buf[5..5 + len]);
            self.buf.drain(..5 + len);
            frames.push(ConnectFrame { flags, payload });
        }
    }

    /// Leftover bytes that never formed a complete frame (diagnostics only).
    pub fn residual_len(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{Compression, write::GzEncoder};
    use std::io::Write;

    #[test]
    fn header_layout() {
        let frame = encode_frame(0, b"abc");
        assert_eq!(frame[0], 0);
        assert_eq!(&frame[1..5], &3u32.to_be_bytes());
        assert_eq!(&frame[5..], b"abc");
    }

    #[test]
    fn split_frames_across_pushes() {
        let whole = encode_frame(0, b"payload-1");
        let mut dec = FrameDecoder::new();
        assert!(dec.push(&whole[..4]).unwrap().is_empty());
        let frames = dec.push(&whole[4..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].payload[..], b"payload-1");
    }

    #[test]
    fn gzip_payload_inflates() {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"{\"ok\":true}").unwrap();
        let gz = enc.finish().unwrap();
        let frame = encode_frame(FLAG_COMPRESSED | FLAG_END_STREAM, &gz);
        let mut dec = FrameDecoder::new();
        let frames = dec.push(&frame).unwrap();
        assert!(frames[0].is_end_stream());
        assert_eq!(&frames[0].decoded_payload().unwrap()[..], b"{\"ok\":true}");
    }
}
