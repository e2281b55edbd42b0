//! Frame codec
//!
//! Each message travels as `header ‖ payload ‖ footer`:
//!
//! ```text
//! header  u64 magic | u64 random id | u64 payload size      (24 bytes, big-endian)
//! payload bincode(Message), zlib-compressed when the magic says so
//! footer  u64 random id | sha512(header ‖ payload)          (72 bytes)
//! ```
//!
//! The random id exists only to correlate ACKs. Decoding is tolerant of
//! corruption: a bad frame is skipped and reported with a recoverable
//! `CodecError`, the stream stays usable.

use std::io::{Read, Write};

use bytes::{Buf, BufMut, BytesMut};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use sha2::{Digest, Sha512};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tracing::{trace, warn};

use crate::broker::message::Message;
use crate::utils::error::CodecError;

pub const FRAME_MAGIC: u64 = 0x5453_494d_5347_5632;
pub const FRAME_MAGIC_DEFLATE: u64 = 0x5453_495a_4c42_5632;
pub const HEADER_SIZE: usize = 24;
pub const FOOTER_SIZE: usize = 72;
pub const MAX_FRAME_SIZE: usize = 32 * 1024 * 1024;

const HASH_SIZE: usize = 64;
const WRITE_BUFFER: usize = 32 * 1024;
const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, Default)]
pub struct EncodeOptions {
    pub id: u64,
    pub compress: bool,
}

impl EncodeOptions {
    /// Plain frame with a fresh random id.
    pub fn random() -> Self {
        Self {
            id: rand::random(),
            compress: false,
        }
    }
}

/// A decoded message plus the random id it was framed with.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub id: u64,
    pub message: Message,
}

/// Serialize `msg` into a complete frame.
pub fn encode_frame(msg: &Message, opts: EncodeOptions) -> Result<BytesMut, CodecError> {
    let mut payload = bincode::serialize(msg).map_err(CodecError::Serialize)?;
    let mut magic = FRAME_MAGIC;

    if opts.compress {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::best());
        enc.write_all(&payload).map_err(CodecError::Compress)?;
        let compressed = enc.finish().map_err(CodecError::Compress)?;
        if compressed.len() < payload.len() {
            trace!(
                original = payload.len(),
                compressed = compressed.len(),
                "compressed frame payload"
            );
            magic = FRAME_MAGIC_DEFLATE;
            payload = compressed;
        }
    }

    let total = HEADER_SIZE + payload.len() + FOOTER_SIZE;
    if total > MAX_FRAME_SIZE {
        return Err(CodecError::TooLarge(total));
    }

    let mut buf = BytesMut::with_capacity(total);
    buf.put_u64(magic);
    buf.put_u64(opts.id);
    buf.put_u64(payload.len() as u64);
    buf.put_slice(&payload);
    let hash = Sha512::digest(&buf[..]);
    buf.put_u64(opts.id);
    buf.put_slice(&hash);
    Ok(buf)
}

/// Incremental decoder over a byte buffer.
#[derive(Debug, Default)]
pub struct FrameDecoder;

impl FrameDecoder {
    pub fn new() -> Self {
        Self
    }

    /// Try to pull one frame off the front of `buf`.
    ///
    /// `Ok(None)` means more bytes are needed. A recoverable error means the
    /// offending bytes were consumed and the caller should simply try again.
    ///
    /// A corrupted size field that still lies within the frame limit is
    /// indistinguishable from a large frame in flight. Decoding waits until
    /// that many bytes are buffered, then the footer check fails and the
    /// stream resynchronizes on the next magic number.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        let mut header = &buf[..HEADER_SIZE];
        let magic = header.get_u64();
        let id = header.get_u64();
        let size = header.get_u64();

        let deflated = match magic {
            FRAME_MAGIC => false,
            FRAME_MAGIC_DEFLATE => true,
            other => {
                buf.advance(1);
                return Err(CodecError::BadMagic(other));
            }
        };

        let max_payload = (MAX_FRAME_SIZE - HEADER_SIZE - FOOTER_SIZE) as u64;
        if size > max_payload {
            // The size field itself can't be trusted, so rescan rather than skip.
            buf.advance(1);
            return Err(CodecError::Oversized {
                size,
                max: MAX_FRAME_SIZE,
            });
        }

        let footer_start = HEADER_SIZE + size as usize;
        let whole = footer_start + FOOTER_SIZE;
        if buf.len() < whole {
            buf.reserve(whole - buf.len());
            return Ok(None);
        }

        let mut footer = &buf[footer_start..whole];
        let footer_id = footer.get_u64();
        if footer_id != id {
            // Frame boundary is wrong; resynchronize on the next magic number.
            buf.advance(1);
            return Err(CodecError::IdMismatch {
                header: id,
                footer: footer_id,
            });
        }

        let hash = Sha512::digest(&buf[..footer_start]);
        if hash[..] != footer[..HASH_SIZE] {
            buf.advance(whole);
            return Err(CodecError::HashMismatch);
        }

        let frame = buf.split_to(whole);
        let raw = &frame[HEADER_SIZE..footer_start];
        let inflated;
        let payload = if deflated {
            let mut out = Vec::new();
            ZlibDecoder::new(raw)
                .take(MAX_FRAME_SIZE as u64)
                .read_to_end(&mut out)
                .map_err(CodecError::Decompress)?;
            inflated = out;
            &inflated[..]
        } else {
            raw
        };

        let message = bincode::deserialize(payload).map_err(CodecError::Deserialize)?;
        Ok(Some(Frame { id, message }))
    }
}

/// Reads frames from an async byte stream.
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
    decoder: FrameDecoder,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK),
            decoder: FrameDecoder::new(),
        }
    }

    /// Read the next frame. Recoverable errors are returned as-is so the
    /// caller decides whether to keep reading.
    pub async fn read_frame(&mut self) -> Result<Frame, CodecError> {
        loop {
            if let Some(frame) = self.decoder.decode(&mut self.buf)? {
                return Ok(frame);
            }
            if self.buf.capacity() - self.buf.len() < READ_CHUNK {
                self.buf.reserve(READ_CHUNK);
            }
            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                if !self.buf.is_empty() {
                    warn!(pending = self.buf.len(), "stream closed mid-frame");
                }
                return Err(CodecError::Closed);
            }
        }
    }

    /// Like `read_frame`, but silently steps over recoverable framing errors.
    pub async fn next_frame(&mut self) -> Result<Frame, CodecError> {
        loop {
            match self.read_frame().await {
                Err(e) if e.is_recoverable() => {
                    warn!(error = %e, "discarded corrupt frame data");
                }
                other => return other,
            }
        }
    }
}

/// Writes frames to an async byte stream, flushing after each one.
pub struct FrameWriter<W: AsyncWrite> {
    inner: BufWriter<W>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner: BufWriter::with_capacity(WRITE_BUFFER, inner),
        }
    }

    pub async fn write_frame(&mut self, msg: &Message, opts: EncodeOptions) -> Result<(), CodecError> {
        let frame = encode_frame(msg, opts)?;
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Flush and close the write side of the stream.
    pub async fn shutdown(&mut self) -> Result<(), CodecError> {
        self.inner.flush().await?;
        self.inner.shutdown().await?;
        Ok(())
    }
}
