//! Frame Protocol
//!
//! Wire formats for [`EventPacket`]s on socket channels. The format is
//! chosen from [`IpcOptions`] once, when the channel is built.
//!
//! # Length-prefixed (default)
//!
//! ```text
//! +----------------+----------------+------------------------------------------+
//! | Length (4)     | Checksum (4)   | JSON Payload (variable)                  |
//! | big-endian u32 | CRC32          | {"type": ..., "data": ...}               |
//! +----------------+----------------+------------------------------------------+
//! ```
//!
//! # Delimited
//!
//! JSON packets separated by the configured delimiter, for peers that
//! frame with a separator instead of a length.
//!
//! # Raw
//!
//! No envelope. Outbound string payloads are decoded with the configured
//! [`Encoding`] and written as bytes; inbound bytes surface as
//! [`events::DATA`] packets holding the encoded text. A character split
//! across reads is held back until its remaining bytes arrive.

use super::{events, EventPacket, Payload};
use crate::config::{Encoding, IpcOptions};
use crate::error::TransportError;

/// Maximum frame size (10 MB)
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

const MIN_BUFFER_CAPACITY: usize = 4096;

/// Length + checksum
const HEADER_SIZE: usize = 8;

/// Framing mode for one channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameCodec {
    /// `[len][crc32][json]`
    LengthPrefixed,
    /// `json` followed by the delimiter bytes
    Delimited(Vec<u8>),
    /// Unframed bytes in the given encoding
    Raw(Encoding),
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::LengthPrefixed
    }
}

impl FrameCodec {
    /// Pick the codec described by the options
    ///
    /// `raw_buffer` wins over `delimiter`.
    #[must_use]
    pub fn from_options(options: &IpcOptions) -> Self {
        if options.raw_buffer {
            Self::Raw(options.encoding)
        } else if let Some(delimiter) = &options.delimiter {
            Self::Delimited(delimiter.as_bytes().to_vec())
        } else {
            Self::LengthPrefixed
        }
    }

    /// Encode one packet to bytes
    ///
    /// # Errors
    ///
    /// Returns `TransportError::SerializationError` if the packet cannot be
    /// serialized or exceeds `MAX_FRAME_SIZE`.
    pub fn encode(&self, packet: &EventPacket) -> Result<Vec<u8>, TransportError> {
        match self {
            Self::LengthPrefixed => {
                let json = to_json(packet)?;
                let len = u32::try_from(json.len()).map_err(|_| oversized(json.len()))?;
                let mut buf = Vec::with_capacity(HEADER_SIZE + json.len());
                buf.extend_from_slice(&len.to_be_bytes());
                buf.extend_from_slice(&crc32fast::hash(&json).to_be_bytes());
                buf.extend_from_slice(&json);
                Ok(buf)
            }
            Self::Delimited(delimiter) => {
                let mut json = to_json(packet)?;
                json.extend_from_slice(delimiter);
                Ok(json)
            }
            Self::Raw(encoding) => {
                let bytes = match &packet.data {
                    Payload::String(text) => encoding.decode(text)?,
                    other => serde_json::to_vec(other)
                        .map_err(|e| TransportError::SerializationError(e.to_string()))?,
                };
                if bytes.len() > MAX_FRAME_SIZE {
                    return Err(oversized(bytes.len()));
                }
                Ok(bytes)
            }
        }
    }
}

fn to_json(packet: &EventPacket) -> Result<Vec<u8>, TransportError> {
    let json =
        serde_json::to_vec(packet).map_err(|e| TransportError::SerializationError(e.to_string()))?;
    if json.len() > MAX_FRAME_SIZE {
        return Err(oversized(json.len()));
    }
    Ok(json)
}

fn oversized(len: usize) -> TransportError {
    TransportError::SerializationError(format!(
        "Frame too large: {len} bytes (max: {MAX_FRAME_SIZE})"
    ))
}

/// Streaming decoder
///
/// Buffers incoming bytes and yields complete packets.
#[derive(Debug)]
pub struct FrameDecoder {
    codec: FrameCodec,
    buffer: Vec<u8>,
    read_pos: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(FrameCodec::default())
    }
}

impl FrameDecoder {
    /// Create a decoder for the given codec
    #[must_use]
    pub fn new(codec: FrameCodec) -> Self {
        Self {
            codec,
            buffer: Vec::with_capacity(MIN_BUFFER_CAPACITY),
            read_pos: 0,
        }
    }

    /// Append bytes to the buffer
    pub fn push(&mut self, data: &[u8]) {
        if self.read_pos > self.buffer.len() / 2 && self.read_pos > MIN_BUFFER_CAPACITY {
            self.buffer.drain(..self.read_pos);
            self.read_pos = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Bytes buffered but not yet consumed
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    /// Try to decode the next packet
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::ChecksumMismatch` on a corrupted
    /// length-prefixed frame and `TransportError::SerializationError` for
    /// oversized or malformed frames. A failed frame is consumed so the
    /// stream can continue.
    pub fn decode(&mut self) -> Result<Option<EventPacket>, TransportError> {
        match &self.codec {
            FrameCodec::LengthPrefixed => self.decode_length_prefixed(),
            FrameCodec::Delimited(delimiter) => {
                let delimiter = delimiter.clone();
                self.decode_delimited(&delimiter)
            }
            FrameCodec::Raw(encoding) => {
                let pending = &self.buffer[self.read_pos..];
                let complete = encoding.complete_len(pending);
                if complete == 0 {
                    return Ok(None);
                }
                let text = encoding.encode(&pending[..complete]);
                self.read_pos += complete;
                if self.read_pos == self.buffer.len() {
                    self.clear();
                }
                Ok(Some(EventPacket::new(events::DATA, Payload::String(text))))
            }
        }
    }

    fn decode_length_prefixed(&mut self) -> Result<Option<EventPacket>, TransportError> {
        let available = self.available();
        if available < HEADER_SIZE {
            return Ok(None);
        }

        let header = &self.buffer[self.read_pos..self.read_pos + HEADER_SIZE];
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let expected = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);

        if len > MAX_FRAME_SIZE {
            self.clear();
            return Err(TransportError::SerializationError(format!(
                "Frame size {len} exceeds maximum {MAX_FRAME_SIZE}"
            )));
        }
        if available < HEADER_SIZE + len {
            return Ok(None);
        }

        let start = self.read_pos + HEADER_SIZE;
        let end = start + len;
        self.read_pos = end;

        let payload = &self.buffer[start..end];
        let actual = crc32fast::hash(payload);
        if actual != expected {
            return Err(TransportError::ChecksumMismatch { expected, actual });
        }

        serde_json::from_slice(payload)
            .map(Some)
            .map_err(|e| TransportError::SerializationError(e.to_string()))
    }

    fn decode_delimited(&mut self, delimiter: &[u8]) -> Result<Option<EventPacket>, TransportError> {
        loop {
            let pending = &self.buffer[self.read_pos..];
            let Some(at) = pending
                .windows(delimiter.len())
                .position(|window| window == delimiter)
            else {
                if pending.len() > MAX_FRAME_SIZE {
                    self.clear();
                    return Err(oversized(MAX_FRAME_SIZE + 1));
                }
                return Ok(None);
            };

            let start = self.read_pos;
            self.read_pos += at + delimiter.len();

            let segment = &self.buffer[start..start + at];
            if segment.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return serde_json::from_slice(segment)
                .map(Some)
                .map_err(|e| TransportError::SerializationError(e.to_string()));
        }
    }

    /// Drop all buffered bytes
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.read_pos = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn packet() -> EventPacket {
        EventPacket::new("sum", json!([1, 2, 3]))
    }

    #[test]
    fn test_length_prefixed_split_across_pushes() {
        let codec = FrameCodec::LengthPrefixed;
        let encoded = codec.encode(&packet()).unwrap();

        let mut decoder = FrameDecoder::new(codec);
        decoder.push(&encoded[..5]);
        assert_eq!(decoder.decode().unwrap(), None);

        decoder.push(&encoded[5..]);
        assert_eq!(decoder.decode().unwrap(), Some(packet()));
        assert_eq!(decoder.available(), 0);
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let codec = FrameCodec::LengthPrefixed;
        let mut bytes = codec.encode(&packet()).unwrap();
        bytes.extend(codec.encode(&EventPacket::new("ping", Payload::Null)).unwrap());

        let mut decoder = FrameDecoder::new(codec);
        decoder.push(&bytes);
        assert_eq!(decoder.decode().unwrap().unwrap().event, "sum");
        assert_eq!(decoder.decode().unwrap().unwrap().event, "ping");
        assert_eq!(decoder.decode().unwrap(), None);
    }

    #[test]
    fn test_checksum_mismatch_detected_and_skipped() {
        let codec = FrameCodec::LengthPrefixed;
        let mut bad = codec.encode(&packet()).unwrap();
        let last = bad.len() - 2;
        bad[last] ^= 0xff;
        let good = codec.encode(&EventPacket::new("ping", Payload::Null)).unwrap();

        let mut decoder = FrameDecoder::new(codec);
        decoder.push(&bad);
        decoder.push(&good);

        assert!(matches!(
            decoder.decode(),
            Err(TransportError::ChecksumMismatch { .. })
        ));
        assert_eq!(decoder.decode().unwrap().unwrap().event, "ping");
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut header = Vec::new();
        header.extend_from_slice(&(u32::try_from(MAX_FRAME_SIZE).unwrap() + 1).to_be_bytes());
        header.extend_from_slice(&0u32.to_be_bytes());

        let mut decoder = FrameDecoder::default();
        decoder.push(&header);
        assert!(matches!(
            decoder.decode(),
            Err(TransportError::SerializationError(_))
        ));
        assert_eq!(decoder.available(), 0);
    }

    #[test]
    fn test_delimited_frames() {
        let codec = FrameCodec::Delimited(b"\x0c".to_vec());
        let encoded = codec.encode(&packet()).unwrap();
        assert_eq!(encoded.last(), Some(&0x0c));

        let mut decoder = FrameDecoder::new(codec);
        decoder.push(b"\x0c");
        decoder.push(&encoded[..4]);
        assert_eq!(decoder.decode().unwrap(), None);
        decoder.push(&encoded[4..]);
        assert_eq!(decoder.decode().unwrap(), Some(packet()));
    }

    #[test]
    fn test_raw_mode_uses_encoding() {
        let codec = FrameCodec::Raw(Encoding::Hex);
        let bytes = codec
            .encode(&EventPacket::new(events::DATA, json!("cafe")))
            .unwrap();
        assert_eq!(bytes, vec![0xca, 0xfe]);

        let mut decoder = FrameDecoder::new(codec);
        decoder.push(&bytes);
        assert_eq!(
            decoder.decode().unwrap(),
            Some(EventPacket::new(events::DATA, json!("cafe")))
        );
        assert_eq!(decoder.decode().unwrap(), None);
    }

    fn raw_text(decoder: &mut FrameDecoder) -> String {
        let mut text = String::new();
        while let Some(packet) = decoder.decode().unwrap() {
            text.push_str(packet.data.as_str().unwrap());
        }
        text
    }

    #[test]
    fn test_raw_mode_holds_partial_characters() {
        let cases = [
            (Encoding::Utf16le, "hi", 3),
            (Encoding::Ucs2, "h\u{1F600}", 4),
            (Encoding::Utf8, "\u{e9}", 1),
            (Encoding::Utf8, "a\u{1F600}b", 3),
        ];
        for (encoding, text, split) in cases {
            let bytes = encoding.decode(text).unwrap();
            let expected = encoding.encode(&bytes);

            let mut decoder = FrameDecoder::new(FrameCodec::Raw(encoding));
            decoder.push(&bytes[..split]);
            let mut seen = raw_text(&mut decoder);
            decoder.push(&bytes[split..]);
            seen.push_str(&raw_text(&mut decoder));

            assert_eq!(seen, expected, "{encoding:?} split at {split}");
            assert_eq!(decoder.available(), 0);
        }
    }

    #[test]
    fn test_codec_from_options() {
        let mut options = IpcOptions::new("worker");
        assert_eq!(FrameCodec::from_options(&options), FrameCodec::LengthPrefixed);

        options.delimiter = Some("\n".to_string());
        assert_eq!(
            FrameCodec::from_options(&options),
            FrameCodec::Delimited(b"\n".to_vec())
        );

        options.raw_buffer = true;
        options.encoding = Encoding::Base64;
        assert_eq!(
            FrameCodec::from_options(&options),
            FrameCodec::Raw(Encoding::Base64)
        );
    }
}
