//! Wire protocol abstraction
//!
//! Every frame leaves this module as
//!
//! ```text
//! [magic: 2 bytes][version length: 1 byte][version: UTF-8][payload]
//! ```
//!
//! where the payload is produced by the selected codec and replaced by its
//! gzip encoding once it reaches the compression threshold. The decoder
//! checks the header before touching the payload and recognises compressed
//! payloads by the gzip magic bytes.
//!
//! Codec payloads carry the Rust type name of the encoded value, so decoding
//! into a different type than the sender used fails with a type mismatch
//! instead of silently reinterpreting bytes.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;
use thiserror::Error;

pub const FRAME_MAGIC: [u8; 2] = [0xCB, 0x5C];
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
pub const COMPRESSION_THRESHOLD: usize = 1024;
/// Upper bound on an inflated payload; a single datagram may not expand past it.
pub const MAX_INFLATED_SIZE: usize = 4 * 1024 * 1024;

pub const JSON_PROTOCOL: &str = "json";
pub const BINCODE_PROTOCOL: &str = "bincode";
pub const PROTOCOL_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Serialize,
    Deserialize,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Serialize => write!(f, "serialize"),
            Operation::Deserialize => write!(f, "deserialize"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SerializationErrorKind {
    #[error("empty input")]
    EmptyInput,
    #[error("frame header magic mismatch")]
    HeaderMismatch,
    #[error("truncated frame header")]
    TruncatedHeader,
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(String),
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },
    #[error("compression failed: {0}")]
    Compression(String),
    #[error("inflated payload exceeds {limit} bytes")]
    InflatedTooLarge { limit: usize },
    #[error("codec failure: {0}")]
    Codec(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{protocol} protocol failed to {operation}: {kind}")]
pub struct SerializationError {
    pub protocol: &'static str,
    pub operation: Operation,
    pub kind: SerializationErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Codec {
    Json,
    Bincode,
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    #[serde(rename = "type")]
    type_tag: &'a str,
    value: &'a T,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    type_tag: String,
    value: serde_json::Value,
}

impl Codec {
    fn name(&self) -> &'static str {
        match self {
            Codec::Json => JSON_PROTOCOL,
            Codec::Bincode => BINCODE_PROTOCOL,
        }
    }

    fn encode<T: Serialize>(&self, type_tag: &str, value: &T) -> Result<Vec<u8>, String> {
        match self {
            Codec::Json => {
                serde_json::to_vec(&EnvelopeRef { type_tag, value }).map_err(|e| e.to_string())
            }
            Codec::Bincode => bincode::serialize(&(type_tag, value)).map_err(|e| e.to_string()),
        }
    }

    fn decode<T: DeserializeOwned>(
        &self,
        expected: &str,
        payload: &[u8],
    ) -> Result<T, SerializationErrorKind> {
        match self {
            Codec::Json => {
                let envelope: Envelope =
                    serde_json::from_slice(payload).map_err(codec_failure)?;
                check_type(expected, &envelope.type_tag)?;
                serde_json::from_value(envelope.value).map_err(codec_failure)
            }
            Codec::Bincode => {
                let mut reader = payload;
                let type_tag: String =
                    bincode::deserialize_from(&mut reader).map_err(codec_failure)?;
                check_type(expected, &type_tag)?;
                bincode::deserialize_from(&mut reader).map_err(codec_failure)
            }
        }
    }
}

fn codec_failure<E: fmt::Display>(err: E) -> SerializationErrorKind {
    SerializationErrorKind::Codec(err.to_string())
}

fn check_type(expected: &str, found: &str) -> Result<(), SerializationErrorKind> {
    if expected == found {
        Ok(())
    } else {
        Err(SerializationErrorKind::TypeMismatch {
            expected: expected.to_string(),
            found: found.to_string(),
        })
    }
}

fn major(version: &str) -> Option<&str> {
    version.split('.').next().filter(|m| !m.is_empty())
}

/// Splits a frame into its version string and payload.
pub fn split_frame(bytes: &[u8]) -> Result<(&str, &[u8]), SerializationErrorKind> {
    if bytes.is_empty() {
        return Err(SerializationErrorKind::EmptyInput);
    }
    if bytes.len() < 3 {
        return Err(SerializationErrorKind::TruncatedHeader);
    }
    if bytes[..2] != FRAME_MAGIC {
        return Err(SerializationErrorKind::HeaderMismatch);
    }

    let version_len = bytes[2] as usize;
    let payload_start = 3 + version_len;
    if bytes.len() < payload_start {
        return Err(SerializationErrorKind::TruncatedHeader);
    }

    let version = std::str::from_utf8(&bytes[3..payload_start])
        .map_err(|_| SerializationErrorKind::HeaderMismatch)?;
    Ok((version, &bytes[payload_start..]))
}

fn gzip(payload: &[u8]) -> Result<Vec<u8>, SerializationErrorKind> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(payload.len() / 2), Compression::default());
    encoder
        .write_all(payload)
        .and_then(|_| encoder.finish())
        .map_err(|e| SerializationErrorKind::Compression(e.to_string()))
}

fn gunzip(payload: &[u8], limit: usize) -> Result<Vec<u8>, SerializationErrorKind> {
    let mut decoded = Vec::with_capacity((payload.len() * 4).min(limit));
    GzDecoder::new(payload)
        .take(limit as u64 + 1)
        .read_to_end(&mut decoded)
        .map_err(|e| SerializationErrorKind::Compression(e.to_string()))?;
    if decoded.len() > limit {
        return Err(SerializationErrorKind::InflatedTooLarge { limit });
    }
    Ok(decoded)
}

/// A concrete wire protocol: one codec plus the shared framing rules.
///
/// Instances are stateless and can be shared freely between sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireProtocol {
    codec: Codec,
    compression_threshold: usize,
    max_inflated_size: usize,
}

impl WireProtocol {
    pub fn json() -> Self {
        Self {
            codec: Codec::Json,
            compression_threshold: COMPRESSION_THRESHOLD,
            max_inflated_size: MAX_INFLATED_SIZE,
        }
    }

    pub fn bincode() -> Self {
        Self {
            codec: Codec::Bincode,
            compression_threshold: COMPRESSION_THRESHOLD,
            max_inflated_size: MAX_INFLATED_SIZE,
        }
    }

    pub fn by_id(id: &str) -> Option<Self> {
        match id {
            JSON_PROTOCOL => Some(Self::json()),
            BINCODE_PROTOCOL => Some(Self::bincode()),
            _ => None,
        }
    }

    pub fn with_compression_threshold(mut self, threshold: usize) -> Self {
        self.compression_threshold = threshold;
        self
    }

    pub fn with_max_inflated_size(mut self, limit: usize) -> Self {
        self.max_inflated_size = limit;
        self
    }

    pub fn protocol_name(&self) -> &'static str {
        self.codec.name()
    }

    pub fn protocol_version(&self) -> &'static str {
        PROTOCOL_VERSION
    }

    /// Versions sharing our major number are wire compatible.
    pub fn supports_version(&self, version: &str) -> bool {
        match (major(version), major(self.protocol_version())) {
            (Some(theirs), Some(ours)) => theirs == ours,
            _ => false,
        }
    }

    fn error(&self, operation: Operation, kind: SerializationErrorKind) -> SerializationError {
        SerializationError {
            protocol: self.protocol_name(),
            operation,
            kind,
        }
    }

    pub fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, SerializationError> {
        let mut payload = self
            .codec
            .encode(std::any::type_name::<T>(), value)
            .map_err(|e| self.error(Operation::Serialize, SerializationErrorKind::Codec(e)))?;

        if payload.len() >= self.compression_threshold {
            payload = gzip(&payload).map_err(|kind| self.error(Operation::Serialize, kind))?;
        }

        let version = self.protocol_version().as_bytes();
        let mut frame = Vec::with_capacity(3 + version.len() + payload.len());
        frame.extend_from_slice(&FRAME_MAGIC);
        frame.push(version.len() as u8);
        frame.extend_from_slice(version);
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    pub fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, SerializationError> {
        let fail = |kind| self.error(Operation::Deserialize, kind);

        let (version, payload) = split_frame(bytes).map_err(fail)?;
        if !self.supports_version(version) {
            return Err(fail(SerializationErrorKind::UnsupportedVersion(
                version.to_string(),
            )));
        }
        if payload.is_empty() {
            return Err(fail(SerializationErrorKind::EmptyInput));
        }

        let expected = std::any::type_name::<T>();
        if payload.starts_with(&GZIP_MAGIC) {
            let inflated = gunzip(payload, self.max_inflated_size).map_err(fail)?;
            self.codec.decode(expected, &inflated).map_err(fail)
        } else {
            self.codec.decode(expected, payload).map_err(fail)
        }
    }

    pub fn is_compressed(&self, bytes: &[u8]) -> bool {
        split_frame(bytes)
            .map(|(_, payload)| payload.starts_with(&GZIP_MAGIC))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Identifier of the protocol handed out by `default_protocol`. Default: bincode.
    pub default_protocol: String,
    /// Payload size at which gzip kicks in. Default: 1024 bytes.
    pub compression_threshold: usize,
    /// Largest payload a compressed frame may inflate to. Default: 4 MiB.
    pub max_inflated_size: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            default_protocol: BINCODE_PROTOCOL.to_string(),
            compression_threshold: COMPRESSION_THRESHOLD,
            max_inflated_size: MAX_INFLATED_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown wire protocol '{0}'")]
pub struct UnknownProtocol(pub String);

/// Selects protocols by identifier, caching one instance per identifier.
///
/// The default selection belongs to the registry instance it was configured
/// on, so concurrent games can run different protocols side by side.
pub struct ProtocolRegistry {
    instances: Mutex<HashMap<String, Arc<WireProtocol>>>,
    default_id: RwLock<String>,
    compression_threshold: usize,
    max_inflated_size: usize,
}

impl ProtocolRegistry {
    pub const AVAILABLE: [&'static str; 2] = [JSON_PROTOCOL, BINCODE_PROTOCOL];

    pub fn new(config: ProtocolConfig) -> Result<Self, UnknownProtocol> {
        if WireProtocol::by_id(&config.default_protocol).is_none() {
            return Err(UnknownProtocol(config.default_protocol));
        }
        Ok(Self {
            instances: Mutex::new(HashMap::new()),
            default_id: RwLock::new(config.default_protocol),
            compression_threshold: config.compression_threshold,
            max_inflated_size: config.max_inflated_size,
        })
    }

    pub fn get(&self, id: &str) -> Option<Arc<WireProtocol>> {
        let mut instances = self.instances.lock();
        if let Some(protocol) = instances.get(id) {
            return Some(Arc::clone(protocol));
        }

        let protocol = Arc::new(
            WireProtocol::by_id(id)?
                .with_compression_threshold(self.compression_threshold)
                .with_max_inflated_size(self.max_inflated_size),
        );
        instances.insert(id.to_string(), Arc::clone(&protocol));
        Some(protocol)
    }

    pub fn default_protocol(&self) -> Arc<WireProtocol> {
        let id = self.default_id.read().clone();
        // The default id is validated on every write.
        self.get(&id).unwrap_or_else(|| Arc::new(WireProtocol::bincode()))
    }

    pub fn default_id(&self) -> String {
        self.default_id.read().clone()
    }

    pub fn set_default(&self, id: &str) -> Result<(), UnknownProtocol> {
        if WireProtocol::by_id(id).is_none() {
            return Err(UnknownProtocol(id.to_string()));
        }
        *self.default_id.write() = id.to_string();
        Ok(())
    }
}
