//! Content-Length framing over a raw byte stream.
//!
//! LSP uses a simple framing protocol:
//! ```text
//! Content-Length: <length>\r\n
//! \r\n
//! <payload>
//! ```
//!
//! Additional `Key: Value` header lines may precede the blank line; only
//! `Content-Length` is interpreted.
//!
//! A header block that never yields a usable `Content-Length` stalls the
//! decoder: later bytes are buffered but nothing is emitted until
//! [`FrameDecoder::reset`] is called. The stall is reported once through
//! [`FrameBatch::error`].

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::transport::ByteTransport;

/// Log target for framing operations.
const FRAMING_TARGET: &str = "lsp_conduit::framing";

const HEADER_SEPARATOR: &[u8] = b"\r\n\r\n";
const CONTENT_LENGTH: &str = "Content-Length";

/// Why the decoder cannot make progress past the current header block.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The header block has no `Content-Length` header.
    #[error("missing Content-Length header")]
    MissingContentLength,

    /// The `Content-Length` value is not a valid byte count.
    #[error("invalid Content-Length value: {value}")]
    InvalidContentLength {
        /// The offending header value.
        value: String,
    },

    /// The header block is not valid UTF-8.
    #[error("header block is not valid UTF-8")]
    InvalidHeaderEncoding,
}

/// Prefixes `payload` with its `Content-Length` header.
#[must_use]
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let header = format!("{CONTENT_LENGTH}: {}\r\n\r\n", payload.len());
    let mut frame = Vec::with_capacity(header.len() + payload.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Messages extracted by one [`FrameDecoder::push`] call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FrameBatch {
    /// Complete payloads in arrival order.
    pub messages: Vec<Vec<u8>>,
    /// Set when the decoder newly stalled on a malformed header block.
    pub error: Option<FrameError>,
}

/// Incremental decoder turning arbitrary chunks into complete payloads.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Offset below which the buffer is known to hold no separator, or the
    /// start of the separator once found.
    scanned: usize,
    stall_reported: bool,
}

enum Extraction {
    Message(Vec<u8>),
    NeedMoreData,
    Malformed(FrameError),
}

impl FrameDecoder {
    /// Creates an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `chunk` and extracts every complete message now available.
    ///
    /// Empty chunks are ignored. Partial messages stay buffered.
    pub fn push(&mut self, chunk: &[u8]) -> FrameBatch {
        let mut batch = FrameBatch::default();
        if chunk.is_empty() {
            return batch;
        }
        self.buffer.extend_from_slice(chunk);

        while !self.buffer.is_empty() {
            match self.extract() {
                Extraction::Message(message) => {
                    self.stall_reported = false;
                    batch.messages.push(message);
                }
                Extraction::NeedMoreData => break,
                Extraction::Malformed(error) => {
                    if !self.stall_reported {
                        warn!(
                            target: FRAMING_TARGET,
                            %error,
                            buffered = self.buffer.len(),
                            "malformed header block, decoder stalled"
                        );
                        self.stall_reported = true;
                        batch.error = Some(error);
                    }
                    break;
                }
            }
        }
        batch
    }

    /// Number of bytes buffered but not yet emitted.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Discards buffered bytes, clearing a stalled header block.
    pub fn reset(&mut self) {
        debug!(
            target: FRAMING_TARGET,
            discarded = self.buffer.len(),
            "resetting frame decoder"
        );
        self.buffer.clear();
        self.scanned = 0;
        self.stall_reported = false;
    }

    fn extract(&mut self) -> Extraction {
        let Some(separator) = find_separator(&self.buffer, self.scanned) else {
            self.scanned = self
                .buffer
                .len()
                .saturating_sub(HEADER_SEPARATOR.len() - 1);
            return Extraction::NeedMoreData;
        };
        self.scanned = separator;
        let Some(headers) = self.buffer.get(..separator) else {
            return Extraction::NeedMoreData;
        };
        let length = match content_length(headers) {
            Ok(length) => length,
            Err(error) => return Extraction::Malformed(error),
        };

        let body_start = separator + HEADER_SEPARATOR.len();
        let Some(body_end) = body_start.checked_add(length) else {
            return Extraction::Malformed(FrameError::InvalidContentLength {
                value: length.to_string(),
            });
        };
        if self.buffer.len() < body_end {
            return Extraction::NeedMoreData;
        }

        let message = self.buffer.drain(..body_end).skip(body_start).collect();
        self.scanned = 0;
        Extraction::Message(message)
    }
}

fn find_separator(buffer: &[u8], from: usize) -> Option<usize> {
    buffer
        .get(from..)?
        .windows(HEADER_SEPARATOR.len())
        .position(|window| window == HEADER_SEPARATOR)
        .map(|position| position + from)
}

/// Parses `Key: Value` lines and returns the `Content-Length` value.
fn content_length(headers: &[u8]) -> Result<usize, FrameError> {
    let text = std::str::from_utf8(headers).map_err(|_| FrameError::InvalidHeaderEncoding)?;

    let value = text
        .split("\r\n")
        .filter_map(|line| line.split_once(':'))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case(CONTENT_LENGTH))
        .map(|(_, value)| value.trim())
        .ok_or(FrameError::MissingContentLength)?;

    value
        .parse()
        .map_err(|_| FrameError::InvalidContentLength {
            value: value.to_owned(),
        })
}

/// Writes framed messages to a [`ByteTransport`] and decodes inbound
/// chunks.
///
/// The framer owns its receive buffer exclusively; it is driven by whoever
/// owns it and performs no locking of its own.
pub struct MessageTransport {
    transport: Arc<dyn ByteTransport>,
    decoder: FrameDecoder,
}

impl MessageTransport {
    /// Wraps a byte transport.
    #[must_use]
    pub fn new(transport: Arc<dyn ByteTransport>) -> Self {
        Self {
            transport,
            decoder: FrameDecoder::new(),
        }
    }

    /// Frames `payload` and forwards it to the byte transport.
    ///
    /// # Errors
    ///
    /// Propagates the byte transport's write failure.
    pub fn write(&self, payload: &[u8]) -> Result<(), TransportError> {
        debug!(
            target: FRAMING_TARGET,
            len = payload.len(),
            "writing framed message"
        );
        self.transport.write(&encode_frame(payload))
    }

    /// Feeds an inbound chunk to the decoder.
    pub fn receive(&mut self, chunk: &[u8]) -> FrameBatch {
        self.decoder.push(chunk)
    }

    /// Discards buffered bytes, clearing a stalled header.
    pub fn reset(&mut self) {
        self.decoder.reset();
    }

    /// Returns the underlying byte transport.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn ByteTransport> {
        &self.transport
    }
}
