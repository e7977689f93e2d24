//! Byte-level framing
//!
//! Two wire forms share the same length header, a decimal byte count terminated by
//! `\n`:
//!
//! - the command channel: `<len>\n<bincode bytes>`, repeated ([`DecimalLengthCodec`],
//!   [`CommandChannel`]);
//! - the relay multiplex on an agent's stdout: plain text lines interleaved with
//!   `pKl:<len>\n<bincode bytes>` events ([`MuxCodec`], [`RelayWriter`]).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};
use tracing::instrument;

use common::error::SyncError;

use crate::protocol::RelayEvent;

/// Largest frame accepted on any channel.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024 * 1024;
/// `u64::MAX` has 20 decimal digits.
const MAX_HEADER_DIGITS: usize = 20;
/// Prefix marking a structured event in relay output.
pub const RELAY_MARKER: &[u8] = b"pKl:";

fn parse_length(header: &[u8], max_frame: usize) -> Result<usize, SyncError> {
    if header.is_empty() {
        return Err(SyncError::framing("empty length header"));
    }
    if header.len() > MAX_HEADER_DIGITS {
        return Err(SyncError::framing(format!(
            "length header has {} digits",
            header.len()
        )));
    }
    if !header.iter().all(u8::is_ascii_digit) {
        return Err(SyncError::framing(format!(
            "length header {:?} is not a decimal number",
            String::from_utf8_lossy(header)
        )));
    }
    // at most 20 ascii digits, so this is valid utf-8
    let text = std::str::from_utf8(header).map_err(|e| SyncError::framing(e.to_string()))?;
    let length: u64 = text
        .parse()
        .map_err(|_| SyncError::framing(format!("length header {text} overflows")))?;
    if length > max_frame as u64 {
        return Err(SyncError::framing(format!(
            "frame of {length} bytes exceeds the {max_frame} byte limit"
        )));
    }
    Ok(length as usize)
}

/// Rejects an incomplete header as soon as it cannot become a valid one.
fn check_partial_header(partial: &[u8]) -> Result<(), SyncError> {
    if partial.len() > MAX_HEADER_DIGITS || !partial.iter().all(u8::is_ascii_digit) {
        return Err(SyncError::framing(format!(
            "malformed length header {:?}",
            String::from_utf8_lossy(&partial[..partial.len().min(32)])
        )));
    }
    Ok(())
}

/// `<decimal length>\n<payload>` frames.
#[derive(Debug)]
pub struct DecimalLengthCodec {
    max_frame: usize,
    pending: Option<usize>,
}

impl Default for DecimalLengthCodec {
    fn default() -> Self {
        Self::with_max_frame(MAX_FRAME_SIZE)
    }
}

impl DecimalLengthCodec {
    #[must_use]
    pub fn with_max_frame(max_frame: usize) -> Self {
        Self {
            max_frame,
            pending: None,
        }
    }
}

impl Decoder for DecimalLengthCodec {
    type Item = BytesMut;
    type Error = SyncError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, SyncError> {
        let length = match self.pending {
            Some(length) => length,
            None => {
                let Some(end) = src.iter().position(|byte| *byte == b'\n') else {
                    check_partial_header(src)?;
                    return Ok(None);
                };
                let length = parse_length(&src[..end], self.max_frame)?;
                src.advance(end + 1);
                self.pending = Some(length);
                length
            }
        };
        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }
        self.pending = None;
        Ok(Some(src.split_to(length)))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, SyncError> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if src.is_empty() && self.pending.is_none() {
            return Ok(None);
        }
        Err(SyncError::framing(match self.pending {
            Some(length) => format!(
                "stream ended after {} of {length} payload bytes",
                src.len()
            ),
            None => "stream ended inside a length header".to_string(),
        }))
    }
}

impl Encoder<Bytes> for DecimalLengthCodec {
    type Error = SyncError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), SyncError> {
        if item.len() > self.max_frame {
            return Err(SyncError::framing(format!(
                "refusing to send a {} byte frame",
                item.len()
            )));
        }
        let header = format!("{}\n", item.len());
        dst.reserve(header.len() + item.len());
        dst.put_slice(header.as_bytes());
        dst.put(item);
        Ok(())
    }
}

/// Strictly synchronous message channel over a pair of byte streams.
#[derive(Debug)]
pub struct CommandChannel<R, W> {
    reader: FramedRead<R, DecimalLengthCodec>,
    writer: FramedWrite<W, DecimalLengthCodec>,
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> CommandChannel<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: FramedRead::new(reader, DecimalLengthCodec::default()),
            writer: FramedWrite::new(writer, DecimalLengthCodec::default()),
        }
    }

    /// Serializes and sends one message, flushing the writer.
    #[instrument(level = "trace", skip_all)]
    pub async fn send<T: serde::Serialize>(&mut self, message: &T) -> Result<(), SyncError> {
        let bytes = bincode::serialize(message)
            .map_err(|error| SyncError::framing(format!("cannot serialize message: {error}")))?;
        self.writer.send(Bytes::from(bytes)).await
    }

    /// Receives one message; `None` on a clean end-of-stream between frames.
    #[instrument(level = "trace", skip_all)]
    pub async fn receive<T: serde::de::DeserializeOwned>(
        &mut self,
    ) -> Result<Option<T>, SyncError> {
        match self.reader.next().await {
            Some(frame) => {
                let frame = frame?;
                let message = bincode::deserialize(&frame).map_err(|error| {
                    SyncError::framing(format!("cannot decode {} byte message: {error}", frame.len()))
                })?;
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }

    /// Like [`receive`](Self::receive), but end-of-stream is an error.
    pub async fn expect<T: serde::de::DeserializeOwned>(&mut self) -> Result<T, SyncError> {
        self.receive().await?.ok_or(SyncError::UnexpectedEof)
    }
}

/// One unit of relay output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxItem {
    Line(String),
    /// Payload of a `pKl:` event, still serialized.
    Event(BytesMut),
}

/// Splits relay output into plain lines and marker-prefixed events.
#[derive(Debug, Default)]
pub struct MuxCodec {
    pending_event: Option<usize>,
}

impl Decoder for MuxCodec {
    type Item = MuxItem;
    type Error = SyncError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<MuxItem>, SyncError> {
        if let Some(length) = self.pending_event {
            if src.len() < length {
                src.reserve(length - src.len());
                return Ok(None);
            }
            self.pending_event = None;
            return Ok(Some(MuxItem::Event(src.split_to(length))));
        }
        let Some(end) = src.iter().position(|byte| *byte == b'\n') else {
            return Ok(None);
        };
        let line = src.split_to(end + 1);
        let line = &line[..end];
        if let Some(header) = line.strip_prefix(RELAY_MARKER) {
            self.pending_event = Some(parse_length(header, MAX_FRAME_SIZE)?);
            return self.decode(src);
        }
        Ok(Some(MuxItem::Line(String::from_utf8_lossy(line).into_owned())))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<MuxItem>, SyncError> {
        if let Some(item) = self.decode(src)? {
            return Ok(Some(item));
        }
        if let Some(length) = self.pending_event {
            return Err(SyncError::framing(format!(
                "relay output ended after {} of {length} event bytes",
                src.len()
            )));
        }
        if src.is_empty() {
            return Ok(None);
        }
        // unterminated last line
        let line = src.split();
        Ok(Some(MuxItem::Line(String::from_utf8_lossy(&line).into_owned())))
    }
}

/// Encodes `event` in the relay multiplex form.
pub fn encode_event(event: &RelayEvent) -> Result<Vec<u8>, SyncError> {
    let payload = bincode::serialize(event)
        .map_err(|error| SyncError::framing(format!("cannot serialize relay event: {error}")))?;
    let mut frame = Vec::with_capacity(payload.len() + 32);
    frame.extend_from_slice(RELAY_MARKER);
    frame.extend_from_slice(format!("{}\n", payload.len()).as_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

pub fn decode_event(payload: &[u8]) -> Result<RelayEvent, SyncError> {
    bincode::deserialize(payload)
        .map_err(|error| SyncError::framing(format!("cannot decode relay event: {error}")))
}

/// Writes relay events to a shared output; each event is emitted with a single write.
#[derive(Debug)]
pub struct RelayWriter<W = std::io::Stdout> {
    out: std::sync::Mutex<W>,
}

impl RelayWriter<std::io::Stdout> {
    #[must_use]
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: std::io::Write> RelayWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: std::sync::Mutex::new(out),
        }
    }

    pub fn emit(&self, event: &RelayEvent) -> Result<(), SyncError> {
        let frame = encode_event(event)?;
        let mut out = self
            .out
            .lock()
            .map_err(|_| SyncError::transport("relay output lock poisoned"))?;
        out.write_all(&frame)?;
        out.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        match self.out.into_inner() {
            Ok(out) => out,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
