//! Framed wire protocol shared by master, slaves and discovery.
//!
//! Every frame is `[u32 length BE][u8 tag][u8 flag][payload]` where the
//! length covers tag, flag and payload. The flag selects the payload
//! encoding: plain JSON or zlib-compressed JSON. TCP streams carry frames
//! back to back; one UDP datagram carries exactly one frame.

use std::io::{Read, Write};

use bytes::{Buf, BufMut, BytesMut};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use cascade_core::{ComputationResult, ModelId, ModelSpec, PopulationState, SampleSet};

use crate::NetworkError;
use crate::discovery::Announcement;

/// Frames larger than this are rejected before allocation.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Payloads at or above this many bytes are zlib-compressed by default.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

const HEADER_SIZE: usize = 4;

const FLAG_PLAIN: u8 = 0;
const FLAG_ZLIB: u8 = 1;

const TAG_PING: u8 = 0x01;
const TAG_PONG: u8 = 0x02;
const TAG_SUBMIT: u8 = 0x03;
const TAG_RESULT: u8 = 0x04;
const TAG_MODEL_REQUEST: u8 = 0x05;
const TAG_MODEL_RESPONSE: u8 = 0x06;
const TAG_CANCEL: u8 = 0x07;
const TAG_SHUTDOWN: u8 = 0x08;
const TAG_DISCOVERY_ANNOUNCE: u8 = 0x10;
const TAG_DISCOVERY_QUERY: u8 = 0x11;
const TAG_DISCOVERY_REPLY: u8 = 0x12;

/// One batch of replications as dispatched to a slave.
///
/// References the model by content hash; a slave that has not seen the
/// model yet answers with `ModelRequest` before executing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkTask {
    pub model: ModelId,
    pub initial: PopulationState,
    pub sampling: SampleSet,
    pub deadline: f64,
    pub seed: u64,
    pub first_replication: u64,
    pub replications: u32,
}

/// Protocol vocabulary. Tags are part of the wire format and never reused.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Ping,
    Pong,
    Submit(NetworkTask),
    Result(ComputationResult),
    ModelRequest(ModelId),
    ModelResponse(ModelSpec),
    Cancel,
    Shutdown,
    DiscoveryAnnounce(Announcement),
    DiscoveryQuery,
    DiscoveryReply(Announcement),
}

impl Message {
    pub fn tag(&self) -> u8 {
        match self {
            Message::Ping => TAG_PING,
            Message::Pong => TAG_PONG,
            Message::Submit(_) => TAG_SUBMIT,
            Message::Result(_) => TAG_RESULT,
            Message::ModelRequest(_) => TAG_MODEL_REQUEST,
            Message::ModelResponse(_) => TAG_MODEL_RESPONSE,
            Message::Cancel => TAG_CANCEL,
            Message::Shutdown => TAG_SHUTDOWN,
            Message::DiscoveryAnnounce(_) => TAG_DISCOVERY_ANNOUNCE,
            Message::DiscoveryQuery => TAG_DISCOVERY_QUERY,
            Message::DiscoveryReply(_) => TAG_DISCOVERY_REPLY,
        }
    }

    fn payload(&self) -> Result<Vec<u8>, NetworkError> {
        let payload = match self {
            Message::Ping
            | Message::Pong
            | Message::Cancel
            | Message::Shutdown
            | Message::DiscoveryQuery => Vec::new(),
            Message::Submit(task) => serde_json::to_vec(task)?,
            Message::Result(result) => serde_json::to_vec(result)?,
            Message::ModelRequest(id) => serde_json::to_vec(id)?,
            Message::ModelResponse(spec) => serde_json::to_vec(spec)?,
            Message::DiscoveryAnnounce(ann) | Message::DiscoveryReply(ann) => {
                serde_json::to_vec(ann)?
            }
        };
        Ok(payload)
    }

    fn from_parts(tag: u8, payload: &[u8]) -> Result<Self, NetworkError> {
        let message = match tag {
            TAG_PING => Message::Ping,
            TAG_PONG => Message::Pong,
            TAG_SUBMIT => Message::Submit(serde_json::from_slice(payload)?),
            TAG_RESULT => Message::Result(serde_json::from_slice(payload)?),
            TAG_MODEL_REQUEST => Message::ModelRequest(serde_json::from_slice(payload)?),
            TAG_MODEL_RESPONSE => Message::ModelResponse(serde_json::from_slice(payload)?),
            TAG_CANCEL => Message::Cancel,
            TAG_SHUTDOWN => Message::Shutdown,
            TAG_DISCOVERY_ANNOUNCE => Message::DiscoveryAnnounce(serde_json::from_slice(payload)?),
            TAG_DISCOVERY_QUERY => Message::DiscoveryQuery,
            TAG_DISCOVERY_REPLY => Message::DiscoveryReply(serde_json::from_slice(payload)?),
            other => {
                return Err(NetworkError::protocol(format!(
                    "unknown message tag: {other:#04x}"
                )));
            }
        };
        Ok(message)
    }
}

/// Stateless frame codec. Compression kicks in above a size threshold so
/// small control frames stay cheap to inspect.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    compression_threshold: usize,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self {
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
        }
    }
}

impl MessageCodec {
    pub fn new(compression_threshold: usize) -> Self {
        Self {
            compression_threshold,
        }
    }

    /// Appends one encoded frame to `dst`.
    ///
    /// # Errors
    /// - `NetworkError::Serialization` - payload cannot be serialized
    /// - `NetworkError::Protocol` - frame exceeds `MAX_FRAME_SIZE`
    pub fn encode(&self, message: &Message, dst: &mut BytesMut) -> Result<(), NetworkError> {
        let payload = message.payload()?;
        let (flag, payload) = if payload.len() >= self.compression_threshold {
            (FLAG_ZLIB, compress(&payload)?)
        } else {
            (FLAG_PLAIN, payload)
        };

        let length = payload.len() + 2;
        if length > MAX_FRAME_SIZE as usize {
            return Err(NetworkError::protocol(format!(
                "frame of {length} bytes exceeds limit"
            )));
        }

        dst.reserve(HEADER_SIZE + length);
        dst.put_u32(length as u32);
        dst.put_u8(message.tag());
        dst.put_u8(flag);
        dst.put_slice(&payload);
        Ok(())
    }

    /// Decodes one frame from `src`, consuming it. Returns `None` when
    /// the buffer does not yet hold a complete frame.
    ///
    /// # Errors
    /// - `NetworkError::Protocol` - oversized frame, unknown tag or flag
    /// - `NetworkError::Serialization` - payload fails to deserialize
    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<Message>, NetworkError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        if length > MAX_FRAME_SIZE {
            return Err(NetworkError::protocol(format!(
                "frame of {length} bytes exceeds limit"
            )));
        }
        if length < 2 {
            return Err(NetworkError::protocol("frame too short for header"));
        }
        if src.len() < HEADER_SIZE + length as usize {
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let tag = src.get_u8();
        let flag = src.get_u8();
        let payload = src.split_to(length as usize - 2);

        let payload = match flag {
            FLAG_PLAIN => payload.to_vec(),
            FLAG_ZLIB => decompress(&payload)?,
            other => {
                return Err(NetworkError::protocol(format!(
                    "unknown encoding flag: {other}"
                )));
            }
        };

        Message::from_parts(tag, &payload).map(Some)
    }

    /// Encodes `message` into a standalone frame, for datagram transports.
    pub fn encode_frame(&self, message: &Message) -> Result<Vec<u8>, NetworkError> {
        let mut buf = BytesMut::new();
        self.encode(message, &mut buf)?;
        Ok(buf.to_vec())
    }

    /// Decodes a standalone frame, rejecting trailing garbage.
    pub fn decode_frame(&self, frame: &[u8]) -> Result<Message, NetworkError> {
        let mut buf = BytesMut::from(frame);
        let message = self
            .decode(&mut buf)?
            .ok_or_else(|| NetworkError::protocol("truncated frame"))?;
        if !buf.is_empty() {
            return Err(NetworkError::protocol("trailing bytes after frame"));
        }
        Ok(message)
    }
}

fn compress(payload: &[u8]) -> Result<Vec<u8>, NetworkError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(payload)?;
    Ok(encoder.finish()?)
}

fn decompress(payload: &[u8]) -> Result<Vec<u8>, NetworkError> {
    let mut decoder = ZlibDecoder::new(payload);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Writes one frame to an async byte stream.
pub async fn write_message<W>(
    writer: &mut W,
    codec: &MessageCodec,
    message: &Message,
) -> Result<(), NetworkError>
where
    W: AsyncWrite + Unpin,
{
    let frame = codec.encode_frame(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame from an async byte stream. Returns `None` on a clean
/// end of stream at a frame boundary.
pub async fn read_message<R>(
    reader: &mut R,
    codec: &MessageCodec,
) -> Result<Option<Message>, NetworkError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }

    let length = u32::from_be_bytes(header);
    if length > MAX_FRAME_SIZE {
        return Err(NetworkError::protocol(format!(
            "frame of {length} bytes exceeds limit"
        )));
    }

    let mut body = vec![0u8; length as usize];
    reader.read_exact(&mut body).await?;

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + body.len());
    buf.put_slice(&header);
    buf.put_slice(&body);
    codec
        .decode(&mut buf)?
        .ok_or_else(|| NetworkError::protocol("truncated frame"))
        .map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    use cascade_core::{Measure, ModelSpec, Population, ReactionRule, SampleSet};

    use crate::endpoint::Endpoint;

    fn sir_spec() -> ModelSpec {
        ModelSpec::new(
            "sir",
            vec!["S".into(), "I".into(), "R".into()],
            vec![
                ReactionRule::new(
                    "infection",
                    vec![Population::new(0), Population::new(1)],
                    vec![Population::with_count(1, 2)],
                    0.004,
                ),
                ReactionRule::new(
                    "recovery",
                    vec![Population::new(1)],
                    vec![Population::new(2)],
                    1.0 / 15.0,
                ),
            ],
        )
    }

    fn sample_task() -> NetworkTask {
        let spec = sir_spec();
        NetworkTask {
            model: spec.id(),
            initial: cascade_core::PopulationState::new(vec![95, 5, 0]),
            sampling: SampleSet::grid(100, 120.0, vec![Measure::new("I", 1)]),
            deadline: 120.0,
            seed: 42,
            first_replication: 0,
            replications: 10,
        }
    }

    #[test]
    fn control_frames_round_trip() {
        let codec = MessageCodec::default();
        for message in [
            Message::Ping,
            Message::Pong,
            Message::Cancel,
            Message::Shutdown,
            Message::DiscoveryQuery,
        ] {
            let frame = codec.encode_frame(&message).unwrap();
            assert_eq!(codec.decode_frame(&frame).unwrap(), message);
        }
    }

    #[test]
    fn submit_round_trips() {
        let codec = MessageCodec::default();
        let message = Message::Submit(sample_task());
        let frame = codec.encode_frame(&message).unwrap();
        assert_eq!(codec.decode_frame(&frame).unwrap(), message);
    }

    #[test]
    fn model_response_round_trips() {
        let codec = MessageCodec::default();
        let spec = sir_spec();
        let message = Message::ModelResponse(spec.clone());
        let frame = codec.encode_frame(&message).unwrap();
        match codec.decode_frame(&frame).unwrap() {
            Message::ModelResponse(decoded) => assert_eq!(decoded.id(), spec.id()),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn large_payload_is_compressed() {
        let codec = MessageCodec::new(64);
        let message = Message::Submit(sample_task());
        let frame = codec.encode_frame(&message).unwrap();
        assert_eq!(frame[5], FLAG_ZLIB);
        assert_eq!(codec.decode_frame(&frame).unwrap(), message);
    }

    #[test]
    fn small_payload_stays_plain() {
        let codec = MessageCodec::default();
        let frame = codec.encode_frame(&Message::Ping).unwrap();
        assert_eq!(frame[4], TAG_PING);
        assert_eq!(frame[5], FLAG_PLAIN);
        assert_eq!(frame.len(), HEADER_SIZE + 2);
    }

    #[test]
    fn discovery_announce_round_trips() {
        let codec = MessageCodec::default();
        let announcement = Announcement {
            endpoint: Endpoint::tcp(IpAddr::V4(Ipv4Addr::LOCALHOST), 9850),
            free_capacity: 4,
        };
        let frame = codec
            .encode_frame(&Message::DiscoveryAnnounce(announcement.clone()))
            .unwrap();
        assert_eq!(
            codec.decode_frame(&frame).unwrap(),
            Message::DiscoveryAnnounce(announcement)
        );
    }

    #[test]
    fn decode_waits_for_full_frame() {
        let codec = MessageCodec::default();
        let frame = codec.encode_frame(&Message::Submit(sample_task())).unwrap();
        let mut partial = BytesMut::from(&frame[..frame.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.put_u8(frame[frame.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let codec = MessageCodec::default();
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_FRAME_SIZE + 1);
        buf.put_slice(&[TAG_PING, FLAG_PLAIN]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(NetworkError::Protocol { .. })
        ));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let codec = MessageCodec::default();
        let mut buf = BytesMut::new();
        buf.put_u32(2);
        buf.put_slice(&[0xEE, FLAG_PLAIN]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(NetworkError::Protocol { .. })
        ));
    }

    #[tokio::test]
    async fn async_stream_round_trips() {
        let codec = MessageCodec::default();
        let mut writer = std::io::Cursor::new(Vec::new());
        write_message(&mut writer, &codec, &Message::Ping)
            .await
            .unwrap();
        write_message(&mut writer, &codec, &Message::Submit(sample_task()))
            .await
            .unwrap();

        let mut reader = std::io::Cursor::new(writer.into_inner());
        assert_eq!(
            read_message(&mut reader, &codec).await.unwrap(),
            Some(Message::Ping)
        );
        assert!(matches!(
            read_message(&mut reader, &codec).await.unwrap(),
            Some(Message::Submit(_))
        ));
        assert_eq!(read_message(&mut reader, &codec).await.unwrap(), None);
    }
}
