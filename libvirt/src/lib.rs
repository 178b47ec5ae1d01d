//! A small client for the libvirt remote protocol: just enough to authorize,
//! open a connection and boot a domain from XML.
//!
//! This speaks the wire protocol directly instead of binding `libvirt.so`
//! through the `virt` crate. `virConnectOpen` dials and handshakes in one
//! blocking call with no way to bound the dial, while [`Client::dial`] puts a
//! timeout on reaching the socket alone and reports it apart from handshake
//! failures. Building also needs no libvirt headers.

mod client;
mod packet;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
mod xdr;

pub use crate::client::{
    Client, ClientError, DEFAULT_SOCKET, DEFAULT_URI, Domain, DomainCreateFlags,
};
pub use crate::packet::{PacketError, Procedure, RemoteError};
pub use crate::xdr::XdrError;
