use async_trait::async_trait;
use mkvm_libvirt::{Client, ClientError, DEFAULT_SOCKET, DEFAULT_URI, DomainCreateFlags};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tracing::{debug, info, instrument};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum HypervisorError {
    #[error("timed out after {timeout:?} connecting to {socket}")]
    DialTimeout { socket: PathBuf, timeout: Duration },

    #[error("can't connect to libvirt: {0}")]
    Unreachable(#[source] ClientError),

    #[error("not authorized to manage virtual machines: {message}")]
    AuthorizationDenied { message: String },

    #[error("libvirt refused the connection: {message}")]
    ConnectRejected { message: String },

    /// `message` is the daemon's diagnostic, unmodified.
    #[error("{message}")]
    CreateError { message: String },

    #[error("not connected to libvirt")]
    NotConnected,
}

/// A domain the hypervisor has accepted and started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainHandle {
    pub name: String,
    pub id: i32,
}

/// A session with the hypervisor.
#[async_trait]
pub trait Hypervisor: Send {
    async fn connect(&mut self) -> Result<(), HypervisorError>;

    /// Create and immediately start a domain from its XML description.
    async fn create_domain(&mut self, xml: &str) -> Result<DomainHandle, HypervisorError>;

    /// End the session. Domains created through it keep running.
    async fn close(&mut self) -> Result<(), HypervisorError> {
        Ok(())
    }
}

fn dial_error(error: ClientError) -> HypervisorError {
    match error {
        ClientError::DialTimeout { path, timeout } => HypervisorError::DialTimeout {
            socket: path,
            timeout,
        },
        other => HypervisorError::Unreachable(other),
    }
}

fn diagnostic(error: &ClientError) -> String {
    match error.remote() {
        Some(remote) => remote.to_string(),
        None => error.to_string(),
    }
}

/// Handshake on an already open byte stream: polkit, then connect.
async fn handshake<S>(client: &mut Client<S>, uri: &str) -> Result<(), HypervisorError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match client.auth_polkit().await {
        Ok(true) => {}
        Ok(false) => {
            return Err(HypervisorError::AuthorizationDenied {
                message: "polkit authorization incomplete".to_owned(),
            });
        }
        Err(error) => {
            return Err(HypervisorError::AuthorizationDenied {
                message: diagnostic(&error),
            });
        }
    }

    client
        .connect_open(Some(uri))
        .await
        .map_err(|error| HypervisorError::ConnectRejected {
            message: diagnostic(&error),
        })
}

async fn create<S>(client: &mut Client<S>, xml: &str) -> Result<DomainHandle, HypervisorError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let domain = client
        .domain_create_xml(xml, DomainCreateFlags::NONE)
        .await
        .map_err(|error| HypervisorError::CreateError {
            message: diagnostic(&error),
        })?;
    Ok(DomainHandle {
        name: domain.name,
        id: domain.id,
    })
}

/// The local libvirt daemon, over its unix socket.
#[derive(Debug)]
pub struct LibvirtHypervisor {
    socket: PathBuf,
    uri: String,
    timeout: Duration,
    client: Option<Client<UnixStream>>,
}

impl Default for LibvirtHypervisor {
    fn default() -> Self {
        Self::new(DEFAULT_SOCKET, DEFAULT_URI, DEFAULT_CONNECT_TIMEOUT)
    }
}

impl LibvirtHypervisor {
    pub fn new(socket: impl Into<PathBuf>, uri: impl Into<String>, timeout: Duration) -> Self {
        Self {
            socket: socket.into(),
            uri: uri.into(),
            timeout,
            client: None,
        }
    }
}

#[async_trait]
impl Hypervisor for LibvirtHypervisor {
    #[instrument(skip(self), fields(socket = %self.socket.display(), uri = %self.uri))]
    async fn connect(&mut self) -> Result<(), HypervisorError> {
        let mut client = Client::dial(&self.socket, self.timeout)
            .await
            .map_err(dial_error)?;

        handshake(&mut client, &self.uri).await?;
        debug!("connected to libvirt");

        self.client = Some(client);
        Ok(())
    }

    async fn create_domain(&mut self, xml: &str) -> Result<DomainHandle, HypervisorError> {
        let client = self.client.as_mut().ok_or(HypervisorError::NotConnected)?;
        let domain = create(client, xml).await?;
        info!("libvirt started domain {} (id {})", domain.name, domain.id);
        Ok(domain)
    }

    async fn close(&mut self) -> Result<(), HypervisorError> {
        if let Some(mut client) = self.client.take() {
            client
                .connect_close()
                .await
                .map_err(HypervisorError::Unreachable)?;
        }
        Ok(())
    }
}
