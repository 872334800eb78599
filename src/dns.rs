//! Out-of-band DNS resolution.
//!
//! Domain-name destinations are resolved over one long-lived UDP socket
//! connected to an upstream recursive resolver. A query is fired and
//! forgotten; the event loop later reads the reply and correlates it to
//! the waiting client through the DNS transaction id.

use crate::error::DnsError;
use crate::protocol::MAX_DGRAM;
use crate::session::{ConnId, PendingQuery, SessionTable};
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use std::collections::VecDeque;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

/// Outcome of a single A lookup
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResolveOutcome {
    Resolved(Ipv4Addr),
    NotFound,
}

/// Resolution is one decoded resolver reply
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resolution {
    pub query_id: u16,
    pub outcome: ResolveOutcome,
}

/// build_query encodes a standard A query for hostname
pub fn build_query(query_id: u16, hostname: &str) -> Result<Vec<u8>, DnsError> {
    let mut name = Name::from_ascii(hostname)?;
    name.set_fqdn(true);

    let mut message = Message::new();
    message
        .set_id(query_id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .set_checking_disabled(true)
        .set_authentic_data(true)
        .add_query(Query::query(name, RecordType::A));

    Ok(message.to_vec()?)
}

/// parse_response extracts the transaction id and the first A record of a
/// resolver reply. A reply that cannot be decoded past its header still
/// reports its id, as NotFound
pub fn parse_response(datagram: &[u8]) -> Result<Resolution, DnsError> {
    let message = match Message::from_vec(datagram) {
        Ok(message) => message,
        Err(e) if datagram.len() >= 2 => {
            let query_id = u16::from_be_bytes([datagram[0], datagram[1]]);
            warn!("undecodable dns reply for query {query_id}: {e}");
            return Ok(Resolution {
                query_id,
                outcome: ResolveOutcome::NotFound,
            });
        }
        Err(_) => return Err(DnsError::Malformed(datagram.len())),
    };

    let address = message
        .answers()
        .iter()
        .find_map(|record| match record.data() {
            Some(RData::A(a)) => Some(a.0),
            _ => None,
        });

    Ok(Resolution {
        query_id: message.id(),
        outcome: match address {
            Some(ip) => ResolveOutcome::Resolved(ip),
            None => ResolveOutcome::NotFound,
        },
    })
}

/// DnsResolver owns the socket to the upstream resolver
pub struct DnsResolver {
    socket: UdpSocket,
    upstream: SocketAddr,
    /// Queries the socket could not take yet, oldest first
    queued: VecDeque<Vec<u8>>,
}

impl DnsResolver {
    /// connect binds an ephemeral UDP socket and connects it to upstream
    pub async fn connect(upstream: SocketAddr) -> io::Result<Self> {
        let local: SocketAddr = match upstream {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(upstream).await?;

        Ok(Self {
            socket,
            upstream,
            queued: VecDeque::new(),
        })
    }

    pub fn upstream(&self) -> SocketAddr {
        self.upstream
    }

    pub fn poll_recv_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.socket.poll_recv_ready(cx)
    }

    pub fn poll_send_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.socket.poll_send_ready(cx)
    }

    pub fn has_queued(&self) -> bool {
        !self.queued.is_empty()
    }

    /// flush_queries sends queued queries until the socket would block. A
    /// query that fails outright is dropped and its client left to time out
    pub fn flush_queries(&mut self) -> io::Result<()> {
        while let Some(query) = self.queued.front() {
            match self.socket.try_send(query) {
                Ok(_) => {
                    self.queued.pop_front();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.queued.pop_front();
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// resolve sends an A query for hostname and records the client waiting
    /// on it. A query the socket cannot take right now is queued for the
    /// next write readiness. Returns the query id
    pub fn resolve<E>(
        &mut self,
        sessions: &mut SessionTable<E>,
        hostname: &str,
        client: ConnId,
        port: u16,
    ) -> Result<u16, DnsError> {
        let query_id = fresh_query_id(sessions)?;
        let query = build_query(query_id, hostname)?;

        if self.queued.is_empty() {
            match self.socket.try_send(&query) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.queued.push_back(query),
                Err(e) => return Err(e.into()),
            }
        } else {
            self.queued.push_back(query);
        }

        // Id was checked free above; nothing else can claim it in between
        sessions
            .register_pending_dns(
                query_id,
                PendingQuery {
                    client,
                    port,
                    hostname: hostname.to_string(),
                    issued_at: Instant::now(),
                },
            )
            .map_err(|_| DnsError::Exhausted)?;

        debug!("dns query {query_id} sent for {hostname}");
        Ok(query_id)
    }

    /// recv_resolution reads one datagram without blocking. Ok(None) means the
    /// datagram was unusable and has been dropped
    pub fn recv_resolution(&self) -> io::Result<Option<Resolution>> {
        let mut buf = [0u8; MAX_DGRAM];
        let len = self.socket.try_recv(&mut buf)?;

        match parse_response(&buf[..len]) {
            Ok(resolution) => Ok(Some(resolution)),
            Err(e) => {
                warn!("dropping dns datagram from {}: {e}", self.upstream);
                Ok(None)
            }
        }
    }
}

fn fresh_query_id<E>(sessions: &SessionTable<E>) -> Result<u16, DnsError> {
    if sessions.pending_dns_count() > u16::MAX as usize {
        return Err(DnsError::Exhausted);
    }

    loop {
        let query_id = rand::random::<u16>();
        if !sessions.has_pending_dns(query_id) {
            return Ok(query_id);
        }
    }
}
