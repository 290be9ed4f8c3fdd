//! The framed request/response wire protocol.
//!
//! Layout, all integers big-endian:
//!
//! ```text
//! magic:      4 bytes, ASCII "PYRO"
//! version:    u16, must equal PROTOCOL_VERSION
//! flags:      u16, bit 0 = oneway request
//! seq:        u32, request sequence number
//! object_id:  u16 length prefix + UTF-8 bytes   (request only)
//! method:     u16 length prefix + UTF-8 bytes   (request only)
//! status:     u8                                 (reply only)
//! traceback:  u32 length prefix + UTF-8 bytes    (reply, error status only)
//! payload_len: u32
//! payload:    opaque bytes, serialization of the argument tuple / result
//! ```
//!
//! Object serialization of the payload is out of scope; this module
//! treats it as an opaque `Bytes` blob.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::CommunicationError;

pub const MAGIC: [u8; 4] = *b"PYRO";
pub const PROTOCOL_VERSION: u16 = 1;

/// Bit 0 of the flags field: the caller does not want a reply.
pub const FLAG_ONEWAY: u16 = 0b0000_0001;

const MAX_PAYLOAD_LEN: u32 = 64 * 1024 * 1024;
const MAX_STRING_LEN: u16 = u16::MAX;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub seq: u32,
    pub oneway: bool,
    pub object_id: String,
    pub method: String,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Success,
    Error,
    OnewayAck,
}

impl ReplyStatus {
    fn to_u8(self) -> u8 {
        match self {
            ReplyStatus::Success => 0,
            ReplyStatus::Error => 1,
            ReplyStatus::OnewayAck => 2,
        }
    }

    fn from_u8(v: u8) -> Result<Self, CommunicationError> {
        match v {
            0 => Ok(ReplyStatus::Success),
            1 => Ok(ReplyStatus::Error),
            2 => Ok(ReplyStatus::OnewayAck),
            other => Err(CommunicationError::Protocol(format!(
                "unknown reply status byte {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyFrame {
    pub seq: u32,
    pub status: ReplyStatus,
    /// Populated only when `status == Error`; the reserved
    /// `_pyroTraceback` attribute.
    pub traceback: Option<String>,
    pub payload: Bytes,
}

impl ReplyFrame {
    pub fn success(seq: u32, payload: Bytes) -> Self {
        ReplyFrame {
            seq,
            status: ReplyStatus::Success,
            traceback: None,
            payload,
        }
    }

    pub fn oneway_ack(seq: u32) -> Self {
        ReplyFrame {
            seq,
            status: ReplyStatus::OnewayAck,
            traceback: None,
            payload: Bytes::new(),
        }
    }

    pub fn error(seq: u32, traceback: String, payload: Bytes) -> Self {
        ReplyFrame {
            seq,
            status: ReplyStatus::Error,
            traceback: Some(traceback),
            payload,
        }
    }
}

fn put_string(buf: &mut BytesMut, s: &str) -> Result<(), CommunicationError> {
    if s.len() > MAX_STRING_LEN as usize {
        return Err(CommunicationError::Protocol(format!(
            "string field too long: {} bytes",
            s.len()
        )));
    }
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
    Ok(())
}

async fn read_string<R: AsyncRead + Unpin>(r: &mut R) -> Result<String, CommunicationError> {
    let len = r.read_u16().await? as usize;
    let mut bytes = vec![0u8; len];
    r.read_exact(&mut bytes).await?;
    String::from_utf8(bytes)
        .map_err(|err| CommunicationError::Protocol(format!("non-utf8 string field: {err}")))
}

fn check_header(magic: [u8; 4], version: u16) -> Result<(), CommunicationError> {
    if magic != MAGIC {
        return Err(CommunicationError::Protocol("bad magic".to_string()));
    }
    if version != PROTOCOL_VERSION {
        return Err(CommunicationError::Protocol(format!(
            "unsupported protocol version {version}"
        )));
    }
    Ok(())
}

pub async fn write_request<W: AsyncWrite + Unpin>(
    w: &mut W,
    frame: &RequestFrame,
) -> Result<(), CommunicationError> {
    if frame.payload.len() as u64 > MAX_PAYLOAD_LEN as u64 {
        return Err(CommunicationError::Protocol(
            "payload exceeds maximum frame size".to_string(),
        ));
    }

    let mut head = BytesMut::new();
    head.put_slice(&MAGIC);
    head.put_u16(PROTOCOL_VERSION);
    head.put_u16(if frame.oneway { FLAG_ONEWAY } else { 0 });
    head.put_u32(frame.seq);
    put_string(&mut head, &frame.object_id)?;
    put_string(&mut head, &frame.method)?;
    head.put_u32(frame.payload.len() as u32);

    w.write_all(&head).await?;
    w.write_all(&frame.payload).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_request<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<RequestFrame, CommunicationError> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic).await?;
    let version = r.read_u16().await?;
    check_header(magic, version)?;

    let flags = r.read_u16().await?;
    let seq = r.read_u32().await?;
    let object_id = read_string(r).await?;
    let method = read_string(r).await?;
    let payload_len = r.read_u32().await?;
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(CommunicationError::Protocol(
            "payload exceeds maximum frame size".to_string(),
        ));
    }
    let mut payload = vec![0u8; payload_len as usize];
    r.read_exact(&mut payload).await?;

    Ok(RequestFrame {
        seq,
        oneway: flags & FLAG_ONEWAY != 0,
        object_id,
        method,
        payload: Bytes::from(payload),
    })
}

pub async fn write_reply<W: AsyncWrite + Unpin>(
    w: &mut W,
    frame: &ReplyFrame,
) -> Result<(), CommunicationError> {
    let mut head = BytesMut::new();
    head.put_slice(&MAGIC);
    head.put_u16(PROTOCOL_VERSION);
    head.put_u16(0); // reply frames carry no request flags
    head.put_u32(frame.seq);
    head.put_u8(frame.status.to_u8());
    match &frame.traceback {
        Some(tb) => {
            head.put_u32(tb.len() as u32);
            head.put_slice(tb.as_bytes());
        }
        None => head.put_u32(0),
    }
    head.put_u32(frame.payload.len() as u32);

    w.write_all(&head).await?;
    w.write_all(&frame.payload).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_reply<R: AsyncRead + Unpin>(r: &mut R) -> Result<ReplyFrame, CommunicationError> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic).await?;
    let version = r.read_u16().await?;
    check_header(magic, version)?;

    let _flags = r.read_u16().await?;
    let seq = r.read_u32().await?;
    let status = ReplyStatus::from_u8(r.read_u8().await?)?;
    let tb_len = r.read_u32().await?;
    let traceback = if tb_len == 0 {
        None
    } else {
        let mut bytes = vec![0u8; tb_len as usize];
        r.read_exact(&mut bytes).await?;
        Some(String::from_utf8(bytes).map_err(|err| {
            CommunicationError::Protocol(format!("non-utf8 traceback field: {err}"))
        })?)
    };
    let payload_len = r.read_u32().await?;
    let mut payload = vec![0u8; payload_len as usize];
    r.read_exact(&mut payload).await?;

    Ok(ReplyFrame {
        seq,
        status,
        traceback,
        payload: Bytes::from(payload),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_roundtrips() {
        let frame = RequestFrame {
            seq: 42,
            oneway: false,
            object_id: "Pyro.Daemon".to_string(),
            method: "ping".to_string(),
            payload: Bytes::from_static(b"args"),
        };
        let mut buf = Vec::new();
        write_request(&mut buf, &frame).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let decoded = read_request(&mut cursor).await.unwrap();
        assert_eq!(decoded, frame);
    }

    #[tokio::test]
    async fn reply_roundtrips_error_status() {
        let frame = ReplyFrame::error(7, "Traceback (most recent call last)".to_string(), Bytes::from_static(b"err"));
        let mut buf = Vec::new();
        write_reply(&mut buf, &frame).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let decoded = read_reply(&mut cursor).await.unwrap();
        assert_eq!(decoded, frame);
    }

    #[tokio::test]
    async fn rejects_bad_magic() {
        let mut buf = vec![b'X', b'X', b'X', b'X'];
        buf.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_request(&mut cursor).await.unwrap_err();
        assert!(matches!(err, CommunicationError::Protocol(_)));
    }

    #[tokio::test]
    async fn rejects_version_mismatch() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&MAGIC);
        buf.extend_from_slice(&(PROTOCOL_VERSION + 1).to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_request(&mut cursor).await.unwrap_err();
        assert!(matches!(err, CommunicationError::Protocol(_)));
    }
}
