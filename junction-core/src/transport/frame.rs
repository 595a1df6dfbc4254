//! Length-prefixed framing for serial links.
//!
//! Every payload is preceded by its byte length as 8 zero-padded decimal
//! digits: a 42-byte body goes on the wire as `00000042{...}`.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::warn;

use crate::error::{CoreError, Result};

/// Length of the decimal prefix.
pub const PREFIX_LEN: usize = 8;

/// Largest payload a device accepts.
pub const MAX_PAYLOAD_SIZE: usize = 8192;

/// Largest length the prefix can express.
const MAX_ENCODABLE: usize = 99_999_999;

/// Prefix a payload with its length.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_ENCODABLE {
        return Err(CoreError::Frame(format!(
            "payload of {} bytes exceeds the 8-digit prefix",
            payload.len()
        )));
    }

    let mut frame = Vec::with_capacity(PREFIX_LEN + payload.len());
    frame.extend_from_slice(format!("{:08}", payload.len()).as_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Write one framed payload and flush.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[derive(Debug)]
enum DecodeState {
    Prefix,
    Payload { expected: usize },
}

/// Incremental decoder for the receiving side of a framed link.
///
/// Chunks may split prefixes and payloads anywhere. A chunk that starts with
/// `{` where a prefix is expected is taken as one unframed JSON payload.
#[derive(Debug)]
pub struct FrameDecoder {
    state: DecodeState,
    prefix: Vec<u8>,
    payload: Vec<u8>,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::Prefix,
            prefix: Vec::with_capacity(PREFIX_LEN),
            payload: Vec::new(),
        }
    }

    /// Discard any partial frame.
    pub fn reset(&mut self) {
        self.state = DecodeState::Prefix;
        self.prefix.clear();
        self.payload.clear();
    }

    /// Whether the decoder holds part of a frame.
    pub fn is_partial(&self) -> bool {
        !self.prefix.is_empty() || matches!(self.state, DecodeState::Payload { .. })
    }

    /// Feed a chunk and return every payload it completes.
    ///
    /// An invalid prefix drops the rest of the chunk; decoding resumes with
    /// the next chunk.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();

        if !self.is_partial() && chunk.first() == Some(&b'{') {
            frames.push(chunk.to_vec());
            return frames;
        }

        let mut rest = chunk;
        while !rest.is_empty() {
            match self.state {
                DecodeState::Prefix => {
                    let take = (PREFIX_LEN - self.prefix.len()).min(rest.len());
                    self.prefix.extend_from_slice(&rest[..take]);
                    rest = &rest[take..];

                    if self.prefix.len() < PREFIX_LEN {
                        break;
                    }

                    match parse_prefix(&self.prefix) {
                        Ok(expected) => {
                            self.prefix.clear();
                            self.payload.reserve(expected);
                            self.state = DecodeState::Payload { expected };
                        }
                        Err(e) => {
                            warn!(error = %e, "Dropping chunk with invalid frame prefix");
                            self.reset();
                            break;
                        }
                    }
                }
                DecodeState::Payload { expected } => {
                    let take = (expected - self.payload.len()).min(rest.len());
                    self.payload.extend_from_slice(&rest[..take]);
                    rest = &rest[take..];

                    if self.payload.len() == expected {
                        frames.push(std::mem::take(&mut self.payload));
                        self.state = DecodeState::Prefix;
                    }
                }
            }
        }

        frames
    }
}

fn parse_prefix(prefix: &[u8]) -> Result<usize> {
    if !prefix.iter().all(u8::is_ascii_digit) {
        return Err(CoreError::Frame(format!(
            "prefix {:?} is not 8 digits",
            String::from_utf8_lossy(prefix)
        )));
    }

    // Eight ASCII digits always fit in usize.
    let length = prefix
        .iter()
        .fold(0usize, |acc, digit| acc * 10 + usize::from(digit - b'0'));

    if length == 0 || length > MAX_PAYLOAD_SIZE {
        return Err(CoreError::Frame(format!("invalid payload length {}", length)));
    }

    Ok(length)
}
