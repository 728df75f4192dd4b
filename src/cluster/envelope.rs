//! Cluster message envelope.
//!
//! A variable-length binary record carrying sender identity, destination
//! filtering fields, a monotonically increasing id and the payload. Payloads
//! above [`COMPRESS_THRESHOLD`] bytes travel compressed; the receive path
//! decompresses into a buffer of the declared uncompressed size and treats a
//! size mismatch as a malformed message.

use std::fmt;
use std::io::{Read, Write};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

/// Payloads above this many bytes are compressed on the wire.
pub const COMPRESS_THRESHOLD: usize = 128;

/// Which subsystem a message is addressed to or originates from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    None = 0,
    Membership = 1,
    Executor = 2,
    ConfigStore = 3,
    Controller = 4,
    AttrStore = 5,
    TransitionEngine = 6,
    PolicyEngine = 7,
    Fencer = 8,
}

impl MsgType {
    fn from_u8(value: u8) -> Result<Self, EnvelopeError> {
        match value {
            0 => Ok(MsgType::None),
            1 => Ok(MsgType::Membership),
            2 => Ok(MsgType::Executor),
            3 => Ok(MsgType::ConfigStore),
            4 => Ok(MsgType::Controller),
            5 => Ok(MsgType::AttrStore),
            6 => Ok(MsgType::TransitionEngine),
            7 => Ok(MsgType::PolicyEngine),
            8 => Ok(MsgType::Fencer),
            other => Err(EnvelopeError::UnknownMsgType(other)),
        }
    }
}

/// Errors from envelope encoding/decoding.
#[derive(Debug, Clone)]
pub enum EnvelopeError {
    /// The buffer ended before the declared record did.
    Truncated,
    /// Decompressed payload did not match the declared uncompressed size.
    SizeMismatch { declared: u32, actual: u32 },
    /// Payload failed to (de)compress.
    Compression(String),
    UnknownMsgType(u8),
    BadUtf8,
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvelopeError::Truncated => write!(f, "Truncated cluster message"),
            EnvelopeError::SizeMismatch { declared, actual } => write!(
                f,
                "Payload size mismatch: declared {} bytes, got {}",
                declared, actual
            ),
            EnvelopeError::Compression(msg) => write!(f, "Compression failure: {}", msg),
            EnvelopeError::UnknownMsgType(value) => {
                write!(f, "Unknown message type {}", value)
            }
            EnvelopeError::BadUtf8 => write!(f, "Invalid UTF-8 in envelope field"),
        }
    }
}

impl std::error::Error for EnvelopeError {}

/// Sender identity stamped on every envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MsgSender {
    pub id: u32,
    pub uname: String,
    pub pid: u32,
    pub kind: MsgType,
}

/// Destination filter. An id of 0 and an empty name address the whole group.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct MsgRecipient {
    pub id: u32,
    pub uname: Option<String>,
    pub kind: MsgType,
    pub is_local: bool,
}

impl Default for MsgType {
    fn default() -> Self {
        MsgType::None
    }
}

impl MsgRecipient {
    pub fn broadcast(kind: MsgType) -> Self {
        MsgRecipient { id: 0, uname: None, kind, is_local: false }
    }

    pub fn node(id: u32, uname: &str, kind: MsgType) -> Self {
        MsgRecipient {
            id,
            uname: Some(uname.to_string()),
            kind,
            is_local: false,
        }
    }
}

/// One message on the cluster bus.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub sender: MsgSender,
    pub host: MsgRecipient,
    pub class: u8,
    pub id: u64,
    /// Uncompressed payload length.
    pub size: u32,
    pub is_compressed: bool,
    pub compressed_size: u32,
    payload: Bytes,
}

impl Envelope {
    /// Build an envelope, compressing the payload when it is large enough
    /// to be worth it. The id is assigned later by the outbound queue.
    pub fn new(
        sender: MsgSender,
        host: MsgRecipient,
        class: u8,
        payload: &[u8],
    ) -> Result<Self, EnvelopeError> {
        let size = payload.len() as u32;
        if payload.len() > COMPRESS_THRESHOLD {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(payload)
                .map_err(|e| EnvelopeError::Compression(e.to_string()))?;
            let compressed = encoder
                .finish()
                .map_err(|e| EnvelopeError::Compression(e.to_string()))?;
            let compressed_size = compressed.len() as u32;
            Ok(Envelope {
                sender,
                host,
                class,
                id: 0,
                size,
                is_compressed: true,
                compressed_size,
                payload: Bytes::from(compressed),
            })
        } else {
            Ok(Envelope {
                sender,
                host,
                class,
                id: 0,
                size,
                is_compressed: false,
                compressed_size: 0,
                payload: Bytes::copy_from_slice(payload),
            })
        }
    }

    pub(crate) fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    /// Should the local node process this message? Messages whose host id is
    /// set and differs from ours, or whose host name is set and differs from
    /// ours, are not for us.
    pub fn accepted_by(&self, local_id: u32, local_uname: &str) -> bool {
        if self.host.id != 0 && self.host.id != local_id {
            return false;
        }
        if let Some(uname) = &self.host.uname {
            if !uname.is_empty() && uname != local_uname {
                return false;
            }
        }
        true
    }

    /// Return the payload, decompressing if necessary and checking the
    /// result against the declared uncompressed size.
    pub fn payload(&self) -> Result<Bytes, EnvelopeError> {
        if !self.is_compressed {
            return Ok(self.payload.clone());
        }
        let mut decoder = ZlibDecoder::new(&self.payload[..]);
        let mut out = Vec::with_capacity(self.size as usize);
        decoder
            .read_to_end(&mut out)
            .map_err(|e| EnvelopeError::Compression(e.to_string()))?;
        if out.len() as u32 != self.size {
            return Err(EnvelopeError::SizeMismatch {
                declared: self.size,
                actual: out.len() as u32,
            });
        }
        Ok(Bytes::from(out))
    }

    /// Length of the wire form of the payload.
    pub fn wire_payload_len(&self) -> usize {
        self.payload.len()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64 + self.payload.len());
        buf.put_u32(self.sender.id);
        buf.put_u32(self.sender.pid);
        buf.put_u8(self.sender.kind as u8);
        put_string(&mut buf, &self.sender.uname);

        buf.put_u32(self.host.id);
        buf.put_u8(self.host.kind as u8);
        buf.put_u8(self.host.is_local as u8);
        put_string(&mut buf, self.host.uname.as_deref().unwrap_or(""));

        buf.put_u8(self.class);
        buf.put_u64(self.id);
        buf.put_u32(self.size);
        buf.put_u8(self.is_compressed as u8);
        buf.put_u32(self.compressed_size);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, EnvelopeError> {
        let sender_id = get_u32(&mut buf)?;
        let sender_pid = get_u32(&mut buf)?;
        let sender_kind = MsgType::from_u8(get_u8(&mut buf)?)?;
        let sender_uname = get_string(&mut buf)?;

        let host_id = get_u32(&mut buf)?;
        let host_kind = MsgType::from_u8(get_u8(&mut buf)?)?;
        let is_local = get_u8(&mut buf)? != 0;
        let host_uname = get_string(&mut buf)?;

        let class = get_u8(&mut buf)?;
        let id = get_u64(&mut buf)?;
        let size = get_u32(&mut buf)?;
        let is_compressed = get_u8(&mut buf)? != 0;
        let compressed_size = get_u32(&mut buf)?;
        let payload_len = get_u32(&mut buf)? as usize;
        if buf.remaining() < payload_len {
            return Err(EnvelopeError::Truncated);
        }
        let payload = buf.copy_to_bytes(payload_len);

        Ok(Envelope {
            sender: MsgSender {
                id: sender_id,
                uname: sender_uname,
                pid: sender_pid,
                kind: sender_kind,
            },
            host: MsgRecipient {
                id: host_id,
                uname: if host_uname.is_empty() { None } else { Some(host_uname) },
                kind: host_kind,
                is_local,
            },
            class,
            id,
            size,
            is_compressed,
            compressed_size,
            payload,
        })
    }
}

fn put_string(buf: &mut BytesMut, value: &str) {
    buf.put_u16(value.len() as u16);
    buf.put_slice(value.as_bytes());
}

fn get_u8(buf: &mut Bytes) -> Result<u8, EnvelopeError> {
    if buf.remaining() < 1 {
        return Err(EnvelopeError::Truncated);
    }
    Ok(buf.get_u8())
}

fn get_u32(buf: &mut Bytes) -> Result<u32, EnvelopeError> {
    if buf.remaining() < 4 {
        return Err(EnvelopeError::Truncated);
    }
    Ok(buf.get_u32())
}

fn get_u64(buf: &mut Bytes) -> Result<u64, EnvelopeError> {
    if buf.remaining() < 8 {
        return Err(EnvelopeError::Truncated);
    }
    Ok(buf.get_u64())
}

fn get_string(buf: &mut Bytes) -> Result<String, EnvelopeError> {
    if buf.remaining() < 2 {
        return Err(EnvelopeError::Truncated);
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(EnvelopeError::Truncated);
    }
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec()).map_err(|_| EnvelopeError::BadUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> MsgSender {
        MsgSender {
            id: 1,
            uname: "node1".to_string(),
            pid: 4242,
            kind: MsgType::Controller,
        }
    }

    #[test]
    fn test_small_payload_uncompressed_roundtrip() {
        let env = Envelope::new(
            sender(),
            MsgRecipient::broadcast(MsgType::Fencer),
            0,
            b"hello",
        )
        .unwrap();
        assert!(!env.is_compressed);

        let decoded = Envelope::decode(env.encode()).unwrap();
        assert_eq!(decoded.sender, env.sender);
        assert_eq!(decoded.host, env.host);
        assert_eq!(&decoded.payload().unwrap()[..], b"hello");
    }

    #[test]
    fn test_large_payload_compressed_roundtrip() {
        let payload = vec![b'x'; 4096];
        let env = Envelope::new(
            sender(),
            MsgRecipient::broadcast(MsgType::TransitionEngine),
            0,
            &payload,
        )
        .unwrap();
        assert!(env.is_compressed);
        assert!(env.wire_payload_len() < payload.len());
        assert_eq!(env.size, 4096);

        let decoded = Envelope::decode(env.encode()).unwrap();
        assert!(decoded.is_compressed);
        assert_eq!(&decoded.payload().unwrap()[..], &payload[..]);
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let payload = vec![b'y'; 1024];
        let mut env = Envelope::new(
            sender(),
            MsgRecipient::broadcast(MsgType::Executor),
            0,
            &payload,
        )
        .unwrap();
        env.size = 1;

        match env.payload() {
            Err(EnvelopeError::SizeMismatch { declared: 1, actual: 1024 }) => {}
            other => panic!("expected size mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_host_id_filtering() {
        let env = Envelope::new(
            sender(),
            MsgRecipient::node(7, "node7", MsgType::Controller),
            0,
            b"direct",
        )
        .unwrap();

        assert!(env.accepted_by(7, "node7"));
        assert!(!env.accepted_by(3, "node3"));
    }

    #[test]
    fn test_broadcast_accepted_by_all() {
        let env = Envelope::new(
            sender(),
            MsgRecipient::broadcast(MsgType::Controller),
            0,
            b"all",
        )
        .unwrap();
        assert!(env.accepted_by(1, "node1"));
        assert!(env.accepted_by(9, "node9"));
    }

    #[test]
    fn test_truncated_buffer_rejected() {
        let env = Envelope::new(
            sender(),
            MsgRecipient::broadcast(MsgType::Controller),
            0,
            b"payload",
        )
        .unwrap();
        let encoded = env.encode();
        let truncated = encoded.slice(0..encoded.len() - 3);

        match Envelope::decode(truncated) {
            Err(EnvelopeError::Truncated) => {}
            other => panic!("expected truncation error, got {:?}", other),
        }
    }
}
