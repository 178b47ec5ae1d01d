//! Framing of libvirt RPC messages.
//!
//! ```text
//! ┌────────────┬──────────────────────────────────────────────┬─────────┐
//! │ len (u32)  │ prog │ vers │ proc │ type │ serial │ status  │ payload │
//! └────────────┴──────────────────────────────────────────────┴─────────┘
//! ```
//!
//! `len` counts the whole packet, itself included. All fields are big-endian.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::xdr::{XdrError, XdrReader, XdrWriter};

pub const REMOTE_PROGRAM: u32 = 0x2000_8086;
pub const REMOTE_PROTOCOL_VERSION: u32 = 1;

const LEN_SIZE: usize = 4;
const HEADER_SIZE: usize = 24;
/// Upper bound libvirtd itself enforces on a single message.
pub const MAX_PACKET_SIZE: usize = 32 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum PacketError {
    #[error("libvirt socket i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("libvirt packet length {0} out of range")]
    Length(usize),

    #[error(transparent)]
    Xdr(#[from] XdrError),

    #[error("unknown message type {0}")]
    UnknownType(i32),

    #[error("unknown reply status {0}")]
    UnknownStatus(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Procedure {
    ConnectOpen = 1,
    ConnectClose = 2,
    DomainCreateXml = 10,
    AuthPolkit = 70,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 0,
    Reply = 1,
    Message = 2,
    Stream = 3,
}

impl TryFrom<i32> for MessageType {
    type Error = PacketError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageType::Call),
            1 => Ok(MessageType::Reply),
            2 => Ok(MessageType::Message),
            3 => Ok(MessageType::Stream),
            other => Err(PacketError::UnknownType(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok = 0,
    Error = 1,
    Continue = 2,
}

impl Status {
    fn from_wire(value: i32) -> Result<Self, PacketError> {
        match value {
            0 => Ok(Status::Ok),
            1 => Ok(Status::Error),
            2 => Ok(Status::Continue),
            other => Err(PacketError::UnknownStatus(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub program: u32,
    pub version: u32,
    pub procedure: i32,
    pub kind: MessageType,
    pub serial: u32,
    pub status: Status,
}

impl Header {
    pub fn call(procedure: Procedure, serial: u32) -> Self {
        Self {
            program: REMOTE_PROGRAM,
            version: REMOTE_PROTOCOL_VERSION,
            procedure: procedure as i32,
            kind: MessageType::Call,
            serial,
            status: Status::Ok,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub payload: Bytes,
}

impl Packet {
    pub fn encode(&self) -> BytesMut {
        let Header {
            program,
            version,
            procedure,
            kind,
            serial,
            status,
        } = self.header;

        let mut w = XdrWriter::new();
        w.put_u32((LEN_SIZE + HEADER_SIZE + self.payload.len()) as u32)
            .put_u32(program)
            .put_u32(version)
            .put_i32(procedure)
            .put_i32(kind as i32)
            .put_u32(serial)
            .put_i32(status as i32);
        let mut buf = w.finish();
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode a packet body, i.e. everything after the length word.
    pub fn decode(mut body: Bytes) -> Result<Self, PacketError> {
        let mut r = XdrReader::new(&mut body);
        let header = Header {
            program: r.get_u32()?,
            version: r.get_u32()?,
            procedure: r.get_i32()?,
            kind: MessageType::try_from(r.get_i32()?)?,
            serial: r.get_u32()?,
            status: Status::from_wire(r.get_i32()?)?,
        };
        Ok(Packet {
            header,
            payload: body,
        })
    }
}

pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> Result<(), PacketError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&packet.encode()).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_packet<R>(reader: &mut R) -> Result<Packet, PacketError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await? as usize;
    if !(LEN_SIZE + HEADER_SIZE..=MAX_PACKET_SIZE).contains(&len) {
        return Err(PacketError::Length(len));
    }
    let mut body = BytesMut::zeroed(len - LEN_SIZE);
    reader.read_exact(&mut body).await?;
    let packet = Packet::decode(body.freeze())?;
    Ok(packet)
}

/// `remote_error`, as sent in the payload of a reply with [`Status::Error`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub code: i32,
    pub domain: i32,
    pub message: Option<String>,
    pub level: i32,
}

impl RemoteError {
    /// Only the leading fields are decoded; the trailing domain/network
    /// references are not needed and the frame length bounds the rest.
    pub fn decode<B: Buf>(payload: B) -> Result<Self, XdrError> {
        let mut r = XdrReader::new(payload);
        Ok(Self {
            code: r.get_i32()?,
            domain: r.get_i32()?,
            message: r.get_optional_string()?,
            level: r.get_i32()?,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut w = XdrWriter::new();
        w.put_i32(self.code)
            .put_i32(self.domain)
            .put_optional_string(self.message.as_deref())
            .put_i32(self.level)
            // dom
            .put_u32(0)
            // str1, str2, str3
            .put_optional_string(None)
            .put_optional_string(None)
            .put_optional_string(None)
            // int1, int2
            .put_i32(-1)
            .put_i32(-1)
            // net
            .put_u32(0);
        w.finish().freeze()
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.message {
            Some(message) => f.write_str(message),
            None => write!(f, "libvirt error code {} (domain {})", self.code, self.domain),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_header_layout() {
        let packet = Packet {
            header: Header::call(Procedure::AuthPolkit, 3),
            payload: Bytes::new(),
        };
        let bytes = packet.encode();
        assert_eq!(bytes.len(), 28);
        assert_eq!(&bytes[0..4], &28u32.to_be_bytes());
        assert_eq!(&bytes[4..8], &REMOTE_PROGRAM.to_be_bytes());
        assert_eq!(&bytes[12..16], &70i32.to_be_bytes());
        assert_eq!(&bytes[20..24], &3u32.to_be_bytes());
    }

    #[tokio::test]
    async fn framed_roundtrip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let packet = Packet {
            header: Header::call(Procedure::ConnectOpen, 1),
            payload: Bytes::from_static(&[0, 0, 0, 0, 0, 0, 0, 0]),
        };
        write_packet(&mut a, &packet).await.unwrap();
        let received = read_packet(&mut b).await.unwrap();
        assert_eq!(received, packet);
    }

    #[tokio::test]
    async fn rejects_short_length() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&8u32.to_be_bytes()).await.unwrap();
        let err = read_packet(&mut b).await.unwrap_err();
        assert!(matches!(err, PacketError::Length(8)));
    }

    #[test]
    fn remote_error_keeps_message_verbatim() {
        let err = RemoteError {
            code: 9,
            domain: 10,
            message: Some("operation failed: domain 'test1' already exists".into()),
            level: 2,
        };
        let decoded = RemoteError::decode(err.encode()).unwrap();
        assert_eq!(decoded, err);
        assert_eq!(
            decoded.to_string(),
            "operation failed: domain 'test1' already exists"
        );
    }
}
