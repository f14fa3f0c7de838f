//! Length-prefixed frame encoding/decoding
//!
//! Wire format: [4-byte big-endian length][JSON payload]
//! Maximum frame size: 64 KiB. A larger announced length is a protocol
//! violation and is rejected before any payload is buffered.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use seatlink_core::MessageFrame;

use crate::error::{Error, Result};
use crate::protocol::{decode_payload, encode_payload};

/// Maximum allowed payload size (64 KiB)
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

const LEN_SIZE: usize = 4;

/// Size of each socket read
const READ_CHUNK: usize = 8 * 1024;

/// Encode a frame as length prefix + payload
pub fn encode_frame(frame: &MessageFrame) -> Result<Vec<u8>> {
    let payload = encode_payload(frame)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge {
            len: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Incremental frame reassembly
///
/// Bytes are pushed as they arrive; complete frames are pulled out in order.
/// The buffer never holds more than one maximum-size frame plus one read.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the stream
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes held that do not yet form a complete frame
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pull the next complete frame, `Ok(None)` if more bytes are needed
    pub fn next_frame(&mut self) -> Result<Option<MessageFrame>> {
        if self.buf.len() < LEN_SIZE {
            return Ok(None);
        }

        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;

        // Sanity check
        if len == 0 {
            return Err(Error::MalformedFrame("Empty frame".into()));
        }
        if len > MAX_FRAME_SIZE {
            return Err(Error::FrameTooLarge {
                len,
                max: MAX_FRAME_SIZE,
            });
        }

        if self.buf.len() < LEN_SIZE + len {
            return Ok(None);
        }

        let frame = decode_payload(&self.buf[LEN_SIZE..LEN_SIZE + len]);
        self.buf.drain(..LEN_SIZE + len);
        frame.map(Some)
    }
}

/// Reads frames from a byte stream
pub struct FrameReader<R> {
    reader: R,
    decoder: FrameDecoder,
    chunk: Box<[u8]>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::new(),
            chunk: vec![0u8; READ_CHUNK].into_boxed_slice(),
        }
    }

    /// Wait for the next complete frame
    ///
    /// Cancel safe: bytes already read stay buffered in the decoder.
    pub async fn next_frame(&mut self) -> Result<MessageFrame> {
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                return Ok(frame);
            }

            let n = self.reader.read(&mut self.chunk).await?;
            if n == 0 {
                return Err(Error::UnexpectedDisconnect);
            }
            self.decoder.push(&self.chunk[..n]);
        }
    }
}

/// Write a length-prefixed frame to a stream
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &MessageFrame) -> Result<()> {
    let bytes = encode_frame(frame)?;
    writer.write_all(&bytes).await?;

    // Flush to ensure delivery
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use seatlink_core::FrameKind;
    use std::io::Cursor;

    fn sample(content: &str) -> MessageFrame {
        MessageFrame::text("Pixel7", "12A", content)
    }

    #[test]
    fn test_frame_roundtrip() {
        let frames = [
            sample("hello"),
            MessageFrame::user_info("Pixel7", "12A", "Hello"),
            MessageFrame::new(FrameKind::Unknown, "", "", "").with_timestamp(0),
            sample("ünïcödé ✈").with_timestamp(i64::MAX),
        ];

        for frame in frames {
            let bytes = encode_frame(&frame).unwrap();
            let mut decoder = FrameDecoder::new();
            decoder.push(&bytes);
            assert_eq!(decoder.next_frame().unwrap(), Some(frame));
            assert_eq!(decoder.buffered(), 0);
        }
    }

    #[test]
    fn test_partial_reads_reassemble() {
        let a = sample("first");
        let b = sample("second");
        let mut bytes = encode_frame(&a).unwrap();
        bytes.extend(encode_frame(&b).unwrap());

        let mut decoder = FrameDecoder::new();
        let mut decoded = Vec::new();
        for byte in &bytes {
            decoder.push(std::slice::from_ref(byte));
            while let Some(frame) = decoder.next_frame().unwrap() {
                decoded.push(frame);
            }
        }
        assert_eq!(decoded, vec![a, b]);
    }

    #[test]
    fn test_empty_frame_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&[0, 0, 0, 0]);
        assert!(matches!(
            decoder.next_frame(),
            Err(Error::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_oversized_prefix_rejected_before_payload() {
        let len = (MAX_FRAME_SIZE as u32 + 1).to_be_bytes();
        let mut decoder = FrameDecoder::new();
        decoder.push(&len);
        assert!(matches!(
            decoder.next_frame(),
            Err(Error::FrameTooLarge { .. })
        ));
        assert_eq!(decoder.buffered(), LEN_SIZE);
    }

    #[test]
    fn test_oversized_frame_not_encoded() {
        let frame = sample(&"x".repeat(MAX_FRAME_SIZE));
        assert!(matches!(
            encode_frame(&frame),
            Err(Error::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_garbage_payload_is_malformed() {
        let mut bytes = 3u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(b"{x}");
        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);
        assert!(matches!(
            decoder.next_frame(),
            Err(Error::MalformedFrame(_))
        ));
    }

    #[tokio::test]
    async fn test_reader_writer_roundtrip() {
        let frames: Vec<_> = (0..20).map(|i| sample(&format!("msg {}", i))).collect();

        let mut buf = Vec::new();
        for frame in &frames {
            write_frame(&mut buf, frame).await.unwrap();
        }

        let mut reader = FrameReader::new(Cursor::new(buf));
        for frame in &frames {
            assert_eq!(&reader.next_frame().await.unwrap(), frame);
        }
        assert!(matches!(
            reader.next_frame().await,
            Err(Error::UnexpectedDisconnect)
        ));
    }

    #[tokio::test]
    async fn test_reader_truncated_stream() {
        let bytes = encode_frame(&sample("cut short")).unwrap();
        let mut reader = FrameReader::new(Cursor::new(bytes[..bytes.len() - 3].to_vec()));
        assert!(matches!(
            reader.next_frame().await,
            Err(Error::UnexpectedDisconnect)
        ));
    }
}
