//! DNS exchange with a peer datacenter's resolver.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, Record, RecordType};
use tokio::net::UdpSocket;
use tracing::{debug, trace};

use crate::error::BinderError;

/// Largest UDP response accepted from an upstream.
const MAX_RESPONSE: usize = 4096;

/// Sends one query to one upstream resolver.
///
/// Implementations do not enforce a deadline; the caller wraps the call in
/// its own timeout.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Ask `server` for `name`/`rtype` and return its answer section.
    async fn query(
        &self,
        server: SocketAddr,
        name: &Name,
        rtype: RecordType,
    ) -> Result<Vec<Record>, BinderError>;
}

/// Plain DNS over UDP, one ephemeral socket per query.
#[derive(Debug, Clone, Default)]
pub struct UdpUpstream;

impl UdpUpstream {
    /// Create a new UDP upstream.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Upstream for UdpUpstream {
    async fn query(
        &self,
        server: SocketAddr,
        name: &Name,
        rtype: RecordType,
    ) -> Result<Vec<Record>, BinderError> {
        let local: SocketAddr = match server {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(server).await?;

        let id: u16 = rand::random();
        let mut msg = Message::new();
        msg.set_id(id);
        msg.set_message_type(MessageType::Query);
        msg.set_op_code(OpCode::Query);
        msg.set_recursion_desired(true);
        msg.add_query(Query::query(name.clone(), rtype));
        socket.send(&msg.to_vec()?).await?;
        trace!(%server, %name, ?rtype, id, "sent upstream query");

        let mut buf = vec![0u8; MAX_RESPONSE];
        loop {
            let len = socket.recv(&mut buf).await?;
            let response = match Message::from_vec(&buf[..len]) {
                Ok(response) => response,
                Err(e) => {
                    debug!(%server, error = %e, "discarding undecodable upstream datagram");
                    continue;
                }
            };
            if response.id() != id || response.message_type() != MessageType::Response {
                trace!(%server, got = response.id(), want = id, "discarding unrelated datagram");
                continue;
            }
            if response.response_code() != ResponseCode::NoError {
                debug!(%server, %name, rcode = ?response.response_code(), "upstream answered negatively");
                return Ok(Vec::new());
            }
            return Ok(response.answers().to_vec());
        }
    }
}
