//! A scripted in-memory daemon for exercising code built on [`Client`].

use bytes::Bytes;
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;

use crate::client::Client;
use crate::packet::{Header, MessageType, Packet, RemoteError, Status, read_packet, write_packet};
use crate::xdr::XdrWriter;

/// One canned answer, sent in order to each incoming call.
#[derive(Debug, Clone)]
pub struct Reply {
    status: Status,
    payload: Bytes,
}

impl Reply {
    pub fn ok(payload: Bytes) -> Self {
        Self {
            status: Status::Ok,
            payload,
        }
    }

    pub fn polkit(complete: bool) -> Self {
        let mut w = XdrWriter::new();
        w.put_i32(complete as i32);
        Self::ok(w.finish().freeze())
    }

    pub fn domain(name: &str, id: i32) -> Self {
        let mut w = XdrWriter::new();
        w.put_string(name).put_fixed_opaque(&[0x6d; 16]).put_i32(id);
        Self::ok(w.finish().freeze())
    }

    pub fn error(message: &str) -> Self {
        let error = RemoteError {
            code: 1,
            domain: 0,
            message: Some(message.to_owned()),
            level: 2,
        };
        Self {
            status: Status::Error,
            payload: error.encode(),
        }
    }
}

pub struct FakeDaemon {
    task: JoinHandle<Vec<i32>>,
}

impl FakeDaemon {
    /// A client wired to a daemon that answers with `replies`, one per call.
    pub fn spawn(replies: Vec<Reply>) -> (Client<DuplexStream>, FakeDaemon) {
        let (client_side, mut daemon) = tokio::io::duplex(64 * 1024);

        let task = tokio::spawn(async move {
            let mut procedures = Vec::new();
            for reply in replies {
                let Ok(call) = read_packet(&mut daemon).await else {
                    break;
                };
                procedures.push(call.header.procedure);
                let packet = Packet {
                    header: Header {
                        kind: MessageType::Reply,
                        status: reply.status,
                        ..call.header
                    },
                    payload: reply.payload,
                };
                if write_packet(&mut daemon, &packet).await.is_err() {
                    break;
                }
            }
            procedures
        });

        (Client::new(client_side), FakeDaemon { task })
    }

    /// Wait for the script to run out, returning the procedure numbers called.
    pub async fn finish(self) -> Vec<i32> {
        match self.task.await {
            Ok(procedures) => procedures,
            Err(error) => panic!("fake daemon panicked: {error}"),
        }
    }
}
