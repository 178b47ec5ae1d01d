use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tracing::{debug, instrument};

use crate::packet::{
    Header, MessageType, Packet, PacketError, Procedure, RemoteError, Status, read_packet,
    write_packet,
};
use crate::xdr::{XdrError, XdrReader, XdrWriter};

pub const DEFAULT_SOCKET: &str = "/var/run/libvirt/libvirt-sock";
pub const DEFAULT_URI: &str = "qemu:///system";

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("timed out after {timeout:?} dialing libvirt at {path}")]
    DialTimeout { path: PathBuf, timeout: Duration },

    #[error("can't dial libvirt at {path}: {source}")]
    Dial {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error("malformed reply to {procedure:?}: {source}")]
    Decode {
        procedure: Procedure,
        #[source]
        source: XdrError,
    },

    #[error("unexpected reply to {procedure:?}: {reason}")]
    Protocol {
        procedure: Procedure,
        reason: String,
    },

    #[error("{procedure:?} failed: {error}")]
    Remote {
        procedure: Procedure,
        error: RemoteError,
    },
}

impl ClientError {
    /// The daemon's own diagnostic, when the failure came from the daemon.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            ClientError::Remote { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// A domain as returned by the daemon (`remote_nonnull_domain`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Domain {
    pub name: String,
    pub uuid: [u8; 16],
    pub id: i32,
}

/// Bit flags for `DomainCreateXML`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DomainCreateFlags(u32);

impl DomainCreateFlags {
    pub const NONE: Self = Self(0);

    pub fn bits(self) -> u32 {
        self.0
    }
}

/// Speaks the libvirt remote protocol over any byte stream.
#[derive(Debug)]
pub struct Client<S> {
    stream: S,
    serial: u32,
}

impl Client<UnixStream> {
    /// Dial the daemon's unix socket, giving up after `timeout`.
    #[instrument]
    pub async fn dial(path: &Path, timeout: Duration) -> Result<Self, ClientError> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| ClientError::DialTimeout {
                path: path.to_owned(),
                timeout,
            })?
            .map_err(|source| ClientError::Dial {
                path: path.to_owned(),
                source,
            })?;
        Ok(Self::new(stream))
    }
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self { stream, serial: 0 }
    }

    /// Ask the daemon to authorize this connection through polkit.
    pub async fn auth_polkit(&mut self) -> Result<bool, ClientError> {
        let procedure = Procedure::AuthPolkit;
        let reply = self.call(procedure, Bytes::new()).await?;
        let mut r = XdrReader::new(reply);
        let complete = r
            .get_i32()
            .map_err(|source| ClientError::Decode { procedure, source })?;
        Ok(complete != 0)
    }

    pub async fn connect_open(&mut self, uri: Option<&str>) -> Result<(), ClientError> {
        let mut args = XdrWriter::new();
        args.put_optional_string(uri).put_u32(0);
        self.call(Procedure::ConnectOpen, args.finish().freeze())
            .await?;
        Ok(())
    }

    /// Define and boot a transient domain from its XML description.
    pub async fn domain_create_xml(
        &mut self,
        xml: &str,
        flags: DomainCreateFlags,
    ) -> Result<Domain, ClientError> {
        let procedure = Procedure::DomainCreateXml;
        let mut args = XdrWriter::new();
        args.put_string(xml).put_u32(flags.bits());
        let reply = self.call(procedure, args.finish().freeze()).await?;

        let decode = || -> Result<Domain, XdrError> {
            let mut r = XdrReader::new(reply);
            Ok(Domain {
                name: r.get_string()?,
                uuid: r.get_fixed_opaque::<16>()?,
                id: r.get_i32()?,
            })
        };
        decode().map_err(|source| ClientError::Decode { procedure, source })
    }

    pub async fn connect_close(&mut self) -> Result<(), ClientError> {
        self.call(Procedure::ConnectClose, Bytes::new()).await?;
        Ok(())
    }

    async fn call(&mut self, procedure: Procedure, args: Bytes) -> Result<Bytes, ClientError> {
        self.serial = self.serial.wrapping_add(1);
        let serial = self.serial;

        debug!(?procedure, serial, "libvirt call");

        let request = Packet {
            header: Header::call(procedure, serial),
            payload: args,
        };
        write_packet(&mut self.stream, &request).await?;

        loop {
            let reply = read_packet(&mut self.stream).await?;
            let header = reply.header;

            // Asynchronous events may be interleaved with replies.
            if header.kind == MessageType::Message {
                debug!(procedure = header.procedure, "skipping libvirt event");
                continue;
            }

            if header.kind != MessageType::Reply
                || header.serial != serial
                || header.procedure != procedure as i32
            {
                return Err(ClientError::Protocol {
                    procedure,
                    reason: format!(
                        "got {:?} for procedure {} serial {}",
                        header.kind, header.procedure, header.serial
                    ),
                });
            }

            return match header.status {
                Status::Ok => Ok(reply.payload),
                Status::Error => {
                    let error = RemoteError::decode(reply.payload)
                        .map_err(|source| ClientError::Decode { procedure, source })?;
                    Err(ClientError::Remote { procedure, error })
                }
                Status::Continue => Err(ClientError::Protocol {
                    procedure,
                    reason: "unexpected stream continuation".to_owned(),
                }),
            };
        }
    }
}
