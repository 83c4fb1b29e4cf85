//! Binary frame codec for the upstream recognizer
//!
//! Every frame is a 4-byte header followed by a big-endian `u32` payload size
//! and the payload itself:
//!
//! - byte 0: high nibble protocol version (1), low nibble header size in
//!   32-bit words (1)
//! - byte 1: high nibble message type, low nibble flags
//! - byte 2: high nibble serialization, low nibble compression
//! - byte 3: reserved, zero
//!
//! Client-full payloads are gzipped JSON; client-audio payloads are gzipped
//! PCM with the `last` flag on the final frame. Server-error frames carry a
//! `u32` error code before the sized payload.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

use crate::PipelineError;

pub const PROTOCOL_VERSION: u8 = 0x1;
pub const HEADER_SIZE_WORDS: u8 = 0x1;

/// Message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    ClientFull,
    ClientAudio,
    ServerFull,
    ServerAck,
    ServerError,
}

impl MessageType {
    fn to_nibble(self) -> u8 {
        match self {
            MessageType::ClientFull => 0x1,
            MessageType::ClientAudio => 0x2,
            MessageType::ServerFull => 0x9,
            MessageType::ServerAck => 0xB,
            MessageType::ServerError => 0xF,
        }
    }

    fn from_nibble(nibble: u8) -> Result<Self, PipelineError> {
        match nibble {
            0x1 => Ok(MessageType::ClientFull),
            0x2 => Ok(MessageType::ClientAudio),
            0x9 => Ok(MessageType::ServerFull),
            0xB => Ok(MessageType::ServerAck),
            0xF => Ok(MessageType::ServerError),
            other => Err(PipelineError::Protocol(format!(
                "unknown message type nibble {other:#x}"
            ))),
        }
    }
}

/// Header flag bits.
pub const FLAG_SEQUENCED: u8 = 0b0001;
pub const FLAG_LAST_PACKET: u8 = 0b0010;
pub const FLAG_EVENT: u8 = 0b0100;

/// Serialization nibble.
pub const SERIALIZATION_NONE: u8 = 0x0;
pub const SERIALIZATION_JSON: u8 = 0x1;

/// Compression nibble.
pub const COMPRESSION_NONE: u8 = 0x0;
pub const COMPRESSION_GZIP: u8 = 0x1;
pub const COMPRESSION_CUSTOM: u8 = 0xF;

/// A parsed frame with its payload decompressed.
#[derive(Debug, Clone)]
pub struct Frame {
    pub message_type: MessageType,
    pub flags: u8,
    pub serialization: u8,
    /// Error code, present only on server-error frames
    pub error_code: Option<u32>,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn is_last_packet(&self) -> bool {
        self.flags & FLAG_LAST_PACKET != 0
    }
}

fn gzip(data: &[u8]) -> Result<Vec<u8>, PipelineError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map_err(|e| PipelineError::Protocol(format!("gzip: {e}")))
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>, PipelineError> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| PipelineError::Protocol(format!("gunzip: {e}")))?;
    Ok(out)
}

/// Build a frame. The payload is gzipped when `compression` says so.
pub fn build_frame(
    message_type: MessageType,
    flags: u8,
    serialization: u8,
    compression: u8,
    payload: &[u8],
) -> Result<Vec<u8>, PipelineError> {
    let body = match compression {
        COMPRESSION_GZIP => gzip(payload)?,
        _ => payload.to_vec(),
    };

    let mut frame = Vec::with_capacity(8 + body.len());
    frame.push((PROTOCOL_VERSION << 4) | HEADER_SIZE_WORDS);
    frame.push((message_type.to_nibble() << 4) | (flags & 0x0F));
    frame.push((serialization << 4) | (compression & 0x0F));
    frame.push(0);
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Encode the handshake request.
pub fn encode_client_full(request: &HandshakeRequest) -> Result<Vec<u8>, PipelineError> {
    let json = serde_json::to_vec(request)
        .map_err(|e| PipelineError::Protocol(format!("handshake json: {e}")))?;
    build_frame(
        MessageType::ClientFull,
        FLAG_SEQUENCED,
        SERIALIZATION_JSON,
        COMPRESSION_GZIP,
        &json,
    )
}

/// Encode one audio chunk; `last` sets the last-packet flag.
pub fn encode_client_audio(pcm: &[u8], last: bool) -> Result<Vec<u8>, PipelineError> {
    let mut flags = FLAG_SEQUENCED;
    if last {
        flags |= FLAG_LAST_PACKET;
    }
    build_frame(
        MessageType::ClientAudio,
        flags,
        SERIALIZATION_NONE,
        COMPRESSION_GZIP,
        pcm,
    )
}

/// Parse any frame, decompressing the payload.
pub fn parse_frame(data: &[u8]) -> Result<Frame, PipelineError> {
    if data.len() < 4 {
        return Err(PipelineError::Protocol(format!(
            "frame too short: {} bytes",
            data.len()
        )));
    }

    let version = data[0] >> 4;
    if version != PROTOCOL_VERSION {
        return Err(PipelineError::Protocol(format!(
            "unsupported protocol version {version}"
        )));
    }
    let header_words = (data[0] & 0x0F) as usize;
    let header_len = header_words * 4;
    if data.len() < header_len + 4 {
        return Err(PipelineError::Protocol("truncated header".to_string()));
    }

    let message_type = MessageType::from_nibble(data[1] >> 4)?;
    let flags = data[1] & 0x0F;
    let serialization = data[2] >> 4;
    let compression = data[2] & 0x0F;

    let mut offset = header_len;
    let mut error_code = None;
    if message_type == MessageType::ServerError {
        if data.len() < offset + 4 {
            return Err(PipelineError::Protocol("truncated error code".to_string()));
        }
        error_code = Some(u32::from_be_bytes(
            data[offset..offset + 4].try_into().unwrap(),
        ));
        offset += 4;
    }

    if data.len() < offset + 4 {
        return Err(PipelineError::Protocol("truncated payload size".to_string()));
    }
    let size = u32::from_be_bytes(data[offset..offset + 4].try_into().unwrap()) as usize;
    offset += 4;
    if data.len() < offset + size {
        return Err(PipelineError::Protocol(format!(
            "payload size {size} exceeds frame length"
        )));
    }

    let raw = &data[offset..offset + size];
    let payload = match compression {
        COMPRESSION_GZIP => gunzip(raw)?,
        _ => raw.to_vec(),
    };

    Ok(Frame {
        message_type,
        flags,
        serialization,
        error_code,
        payload,
    })
}

/// Handshake payload sent in the client-full frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandshakeRequest {
    pub user: HandshakeUser,
    pub audio: HandshakeAudio,
    pub request: HandshakeParams,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandshakeUser {
    pub uid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandshakeAudio {
    pub format: String,
    pub rate: u32,
    pub bits: u32,
    pub channel: u32,
    pub language: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandshakeParams {
    pub model_name: String,
    pub end_window_size: u32,
    pub enable_punc: bool,
    pub enable_itn: bool,
    pub enable_ddc: bool,
    pub result_type: String,
    pub show_utterances: bool,
}

/// Recognition payload of a server-full frame.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServerResponse {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub is_last_package: bool,
    #[serde(default)]
    pub result: Option<RecognitionResult>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RecognitionResult {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub utterances: Vec<Utterance>,
}

impl RecognitionResult {
    /// A result is final once the recognizer marks an utterance definite.
    pub fn is_definite(&self) -> bool {
        self.utterances.iter().any(|u| u.definite)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Utterance {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub definite: bool,
}

pub fn parse_server_response(frame: &Frame) -> Result<ServerResponse, PipelineError> {
    serde_json::from_slice(&frame.payload)
        .map_err(|e| PipelineError::Protocol(format!("server response json: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake() -> HandshakeRequest {
        HandshakeRequest {
            user: HandshakeUser { uid: "dev-A".into() },
            audio: HandshakeAudio {
                format: "pcm".into(),
                rate: 16_000,
                bits: 16,
                channel: 1,
                language: "zh-CN".into(),
            },
            request: HandshakeParams {
                model_name: "bigmodel".into(),
                end_window_size: 600,
                enable_punc: true,
                enable_itn: true,
                enable_ddc: false,
                result_type: "single".into(),
                show_utterances: true,
            },
        }
    }

    #[test]
    fn client_full_header_layout() {
        let frame = encode_client_full(&handshake()).unwrap();
        assert_eq!(frame[0], 0x11); // version 1, header size 1 word
        assert_eq!(frame[1] >> 4, 0x1); // client-full
        assert_eq!(frame[1] & 0x0F, FLAG_SEQUENCED);
        assert_eq!(frame[2], (SERIALIZATION_JSON << 4) | COMPRESSION_GZIP);
        assert_eq!(frame[3], 0);

        let size = u32::from_be_bytes(frame[4..8].try_into().unwrap()) as usize;
        assert_eq!(frame.len(), 8 + size);
    }

    #[test]
    fn handshake_roundtrip_through_gzip() {
        let original = handshake();
        let encoded = encode_client_full(&original).unwrap();
        let parsed = parse_frame(&encoded).unwrap();
        assert_eq!(parsed.message_type, MessageType::ClientFull);

        let decoded: HandshakeRequest = serde_json::from_slice(&parsed.payload).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn audio_frame_marks_last_packet() {
        let pcm = vec![1u8, 2, 3, 4];
        let frame = encode_client_audio(&pcm, true).unwrap();
        let parsed = parse_frame(&frame).unwrap();
        assert_eq!(parsed.message_type, MessageType::ClientAudio);
        assert!(parsed.is_last_packet());
        assert_eq!(parsed.payload, pcm);
    }

    #[test]
    fn server_full_roundtrip_recovers_json() {
        let json = serde_json::json!({
            "code": 0,
            "is_last_package": false,
            "result": {
                "text": "几点了",
                "utterances": [{"text": "几点了", "definite": true}]
            }
        });
        let encoded = build_frame(
            MessageType::ServerFull,
            0,
            SERIALIZATION_JSON,
            COMPRESSION_GZIP,
            &serde_json::to_vec(&json).unwrap(),
        )
        .unwrap();

        let frame = parse_frame(&encoded).unwrap();
        let response = parse_server_response(&frame).unwrap();
        assert_eq!(response.code, 0);
        let result = response.result.unwrap();
        assert_eq!(result.text, "几点了");
        assert!(result.is_definite());
    }

    #[test]
    fn server_error_carries_code() {
        let message = b"session timeout";
        let mut raw = build_frame(
            MessageType::ServerError,
            0,
            SERIALIZATION_NONE,
            COMPRESSION_NONE,
            message,
        )
        .unwrap();
        // Splice the error code between header and sized payload, as the
        // server does.
        let mut with_code = raw[..4].to_vec();
        with_code.extend_from_slice(&45_000_081u32.to_be_bytes());
        with_code.extend_from_slice(&raw.split_off(4));

        let frame = parse_frame(&with_code).unwrap();
        assert_eq!(frame.error_code, Some(45_000_081));
        assert_eq!(frame.payload, message);
    }

    #[test]
    fn short_frame_is_rejected() {
        assert!(parse_frame(&[0x11, 0x10]).is_err());
    }

    #[test]
    fn wrong_version_is_rejected() {
        let frame = encode_client_audio(&[0u8; 4], false).unwrap();
        let mut bad = frame.clone();
        bad[0] = 0x21;
        assert!(parse_frame(&bad).is_err());
    }
}
