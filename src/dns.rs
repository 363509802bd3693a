//! Multicast DNS responder
//! Answers A/AAAA questions for registered domains with the loopback address

use crate::mappings::MappingStore;
use anyhow::{Context, Result};
use hickory_proto::op::{Message, MessageType, OpCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{RData, Record, RecordType};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

pub const MDNS_PORT: u16 = 5353;
pub const MDNS_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);

/// TTL of every answer, in seconds
pub const ANSWER_TTL: u32 = 300;

const MAX_PACKET: usize = 9000;

/// Socket parameters for the responder
#[derive(Debug, Clone)]
pub struct ResponderConfig {
    pub bind_addr: Ipv4Addr,
    pub port: u16,
    /// Join the mDNS group and send multicast answers
    pub multicast: bool,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            bind_addr: Ipv4Addr::UNSPECIFIED,
            port: MDNS_PORT,
            multicast: true,
        }
    }
}

/// Build the answer for `query`, or `None` when no question names a registered domain
///
/// Unknown names are skipped rather than answered with NXDOMAIN so other responders
/// on the link can still answer them. A `legacy_unicast` answer echoes the id and the
/// questions; a multicast answer uses id 0 and carries answers only.
pub fn build_response(query: &Message, store: &MappingStore, legacy_unicast: bool) -> Option<Message> {
    if query.message_type() != MessageType::Query || query.op_code() != OpCode::Query {
        return None;
    }

    let mut answers = Vec::new();
    for question in query.queries() {
        let name = question.name().to_utf8();
        let domain = name.trim_end_matches('.');
        let record_type = question.query_type();

        debug!("DNS query: {} ({})", domain, record_type);

        if !store.resolves(domain) {
            debug!("DNS not found: {}", domain);
            continue;
        }

        let data = match record_type {
            RecordType::A => RData::A(A(Ipv4Addr::LOCALHOST)),
            RecordType::AAAA => RData::AAAA(AAAA(Ipv6Addr::LOCALHOST)),
            _ => continue,
        };

        info!("DNS resolved: {} ({}) -> loopback", domain, record_type);
        answers.push(Record::from_rdata(question.name().clone(), ANSWER_TTL, data));
    }

    if answers.is_empty() {
        return None;
    }

    let mut response = Message::new();
    response
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_authoritative(true);

    if legacy_unicast {
        response
            .set_id(query.id())
            .add_queries(query.queries().to_vec());
    }
    response.add_answers(answers);

    Some(response)
}

/// mDNS responder bound to a UDP socket
pub struct NameResponder {
    socket: UdpSocket,
    store: Arc<MappingStore>,
    config: ResponderConfig,
}

impl NameResponder {
    /// Bind the responder socket
    ///
    /// The port is shared with other responders on the host (`SO_REUSEADDR`, and
    /// `SO_REUSEPORT` on unix).
    pub fn bind(config: ResponderConfig, store: Arc<MappingStore>) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .context("Failed to create mDNS socket")?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;

        let addr = SocketAddrV4::new(config.bind_addr, config.port);
        socket
            .bind(&SocketAddr::V4(addr).into())
            .with_context(|| format!("Failed to bind mDNS socket on {}", addr))?;

        if config.multicast {
            socket
                .join_multicast_v4(&MDNS_GROUP, &Ipv4Addr::UNSPECIFIED)
                .context("Failed to join the mDNS multicast group")?;
            socket.set_multicast_loop_v4(true)?;
            socket.set_multicast_ttl_v4(255)?;
        }

        socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(socket.into())?;

        Ok(Self {
            socket,
            store,
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Serve queries until the task is dropped
    pub async fn run(self) -> Result<()> {
        info!(
            "DNS responder listening on {} for all configured domains",
            self.local_addr()?
        );

        let mut buf = vec![0u8; MAX_PACKET];
        loop {
            let (len, src) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!("mDNS receive error: {}", e);
                    continue;
                }
            };

            if let Err(e) = self.handle_packet(&buf[..len], src).await {
                debug!("Dropped mDNS packet from {}: {:#}", src, e);
            }
        }
    }

    async fn handle_packet(&self, packet: &[u8], src: SocketAddr) -> Result<()> {
        let query = Message::from_vec(packet).context("malformed DNS message")?;

        let legacy_unicast = src.port() != MDNS_PORT || !self.config.multicast;
        let Some(response) = build_response(&query, &self.store, legacy_unicast) else {
            return Ok(());
        };

        let target = if legacy_unicast {
            src
        } else {
            SocketAddr::V4(SocketAddrV4::new(MDNS_GROUP, MDNS_PORT))
        };

        let bytes = response.to_vec().context("failed to encode DNS response")?;
        self.socket
            .send_to(&bytes, target)
            .await
            .with_context(|| format!("failed to send DNS response to {}", target))?;
        Ok(())
    }
}
