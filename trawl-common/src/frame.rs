//! Length-prefixed framing for the producer ↔ service stream.
//!
//! A frame is a 4-byte big-endian payload length followed by the payload.
//! Payloads are JSON-encoded [`ServerCommand`](crate::ServerCommand) or
//! [`ProducerMessage`](crate::ProducerMessage) values.
//!
//! [`JsonFrameCodec`] layers JSON on top of a [`LengthDelimitedCodec`], so it
//! plugs into `tokio_util::codec::Framed` as-is. [`FrameReader`] and
//! [`FrameWriter`] drive the same codec over blocking `std::io` streams.

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{self, Read, Write};
use std::marker::PhantomData;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

const LENGTH_PREFIX_BYTES: usize = 4;
const READ_CHUNK_BYTES: usize = 8 * 1024;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("stream ended inside a frame ({buffered} bytes buffered)")]
    TruncatedFrame { buffered: usize },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Also carries frames over the size limit (`ErrorKind::InvalidData` on
    /// decode, `ErrorKind::InvalidInput` on encode).
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// JSON payloads in length-delimited frames. Decodes `In`, encodes any
/// serializable message.
pub struct JsonFrameCodec<In> {
    frames: LengthDelimitedCodec,
    _marker: PhantomData<fn() -> In>,
}

impl<In> JsonFrameCodec<In> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_frame_length(DEFAULT_MAX_FRAME_BYTES)
    }

    #[must_use]
    pub fn with_max_frame_length(max_frame_bytes: usize) -> Self {
        let frames = LengthDelimitedCodec::builder()
            .length_field_length(LENGTH_PREFIX_BYTES)
            .big_endian()
            .max_frame_length(max_frame_bytes)
            .new_codec();
        Self { frames, _marker: PhantomData }
    }
}

impl<In> Default for JsonFrameCodec<In> {
    fn default() -> Self {
        Self::new()
    }
}

impl<In: DeserializeOwned> Decoder for JsonFrameCodec<In> {
    type Item = In;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<In>, WireError> {
        match self.frames.decode(src)? {
            Some(payload) => Ok(Some(serde_json::from_slice(&payload)?)),
            None => Ok(None),
        }
    }
}

impl<Out: Serialize, In> Encoder<Out> for JsonFrameCodec<In> {
    type Error = WireError;

    fn encode(&mut self, message: Out, dst: &mut BytesMut) -> Result<(), WireError> {
        let payload = serde_json::to_vec(&message)?;
        self.frames.encode(Bytes::from(payload), dst)?;
        Ok(())
    }
}

/// Blocking frame decoder over any [`Read`].
pub struct FrameReader<R, In> {
    inner: R,
    buffer: BytesMut,
    codec: JsonFrameCodec<In>,
}

impl<R: Read, In: DeserializeOwned> FrameReader<R, In> {
    #[must_use]
    pub fn new(inner: R) -> Self {
        Self::with_codec(inner, JsonFrameCodec::new())
    }

    #[must_use]
    pub fn with_codec(inner: R, codec: JsonFrameCodec<In>) -> Self {
        Self { inner, buffer: BytesMut::with_capacity(READ_CHUNK_BYTES), codec }
    }

    /// Read one frame and deserialize it.
    ///
    /// Returns `Ok(None)` on a clean end of stream (EOF between frames).
    /// Interrupted reads are retried.
    ///
    /// # Errors
    /// I/O errors, frames cut short by EOF, oversized frames and invalid JSON.
    pub fn read_message(&mut self) -> Result<Option<In>, WireError> {
        let mut chunk = [0u8; READ_CHUNK_BYTES];
        loop {
            if let Some(message) = self.codec.decode(&mut self.buffer)? {
                return Ok(Some(message));
            }
            let n = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            if n == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(WireError::TruncatedFrame { buffered: self.buffer.len() });
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Blocking frame encoder over any [`Write`].
pub struct FrameWriter<W> {
    inner: W,
    buffer: BytesMut,
    codec: JsonFrameCodec<()>,
}

impl<W: Write> FrameWriter<W> {
    #[must_use]
    pub fn new(inner: W) -> Self {
        Self { inner, buffer: BytesMut::new(), codec: JsonFrameCodec::new() }
    }

    /// Serialize `message` and write it as one frame.
    ///
    /// # Errors
    /// Serialization, oversized payloads and I/O errors.
    pub fn write_message<T: Serialize>(&mut self, message: &T) -> Result<(), WireError> {
        self.buffer.clear();
        self.codec.encode(message, &mut self.buffer)?;
        self.inner.write_all(&self.buffer)?;
        self.inner.flush()?;
        Ok(())
    }
}
