//! Per-client protocol state machine.
//!
//! A client walks AwaitingGreeting -> AwaitingRequest -> (AwaitingResolution)
//! -> Connecting -> Relaying. Rejected and closed are terminal: a rejected
//! client only lingers until its last reply is flushed.

use crate::address::Destination;
use crate::auth::{decode_greeting, encode_method_reply};
use crate::commands::{ConnectRequest, decode_connect_request, encode_failure, encode_reply};
use crate::dns::{Resolution, ResolveOutcome};
use crate::error::DecodeError;
use crate::protocol::{AuthMethod, ReplyCode};
use crate::server::Proxy;
use crate::session::ConnId;
use bytes::{Buf, BytesMut};
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::pin::Pin;
use std::time::Instant;
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

/// ConnectFuture is an in-flight, non-blocking connect to a destination
pub type ConnectFuture = Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>>;

/// ClientState tracks where a client is in the SOCKS5 exchange
pub enum ClientState {
    AwaitingGreeting,
    AwaitingRequest,
    AwaitingResolution {
        query_id: u16,
    },
    Connecting {
        target: SocketAddrV4,
        connect: ConnectFuture,
    },
    Relaying,
    Rejected,
}

impl ClientState {
    pub fn name(&self) -> &'static str {
        match self {
            ClientState::AwaitingGreeting => "awaiting-greeting",
            ClientState::AwaitingRequest => "awaiting-request",
            ClientState::AwaitingResolution { .. } => "awaiting-resolution",
            ClientState::Connecting { .. } => "connecting",
            ClientState::Relaying => "relaying",
            ClientState::Rejected => "rejected",
        }
    }

    /// reads_client reports whether client bytes are consumed in this state
    pub fn reads_client(&self) -> bool {
        matches!(
            self,
            ClientState::AwaitingGreeting | ClientState::AwaitingRequest | ClientState::Relaying
        )
    }
}

impl fmt::Debug for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientState::AwaitingResolution { query_id } => {
                write!(f, "{}(query {query_id})", self.name())
            }
            ClientState::Connecting { target, .. } => write!(f, "{}({target})", self.name()),
            _ => f.write_str(self.name()),
        }
    }
}

/// Channel is the socket half shared by clients and destinations
pub struct Channel {
    pub stream: TcpStream,
    pub peer_addr: SocketAddr,
    pub outbox: BytesMut,
    pub last_activity: Instant,
    /// No longer read; closed once outbox is written out
    pub draining: bool,
}

impl Channel {
    pub fn new(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Self {
            stream,
            peer_addr,
            outbox: BytesMut::new(),
            last_activity: Instant::now(),
            draining: false,
        }
    }
}

/// ClientConn is an accepted SOCKS client
pub struct ClientConn {
    pub channel: Channel,
    pub state: ClientState,
    /// Handshake bytes not yet decoded
    pub inbox: BytesMut,
}

/// DestinationConn is the outbound leg of a relayed session
pub struct DestinationConn {
    pub channel: Channel,
}

/// Endpoint tags every polled connection with its role
pub enum Endpoint {
    Client(ClientConn),
    Destination(DestinationConn),
}

impl Endpoint {
    pub fn client(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Endpoint::Client(ClientConn {
            channel: Channel::new(stream, peer_addr),
            state: ClientState::AwaitingGreeting,
            inbox: BytesMut::new(),
        })
    }

    pub fn destination(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Endpoint::Destination(DestinationConn {
            channel: Channel::new(stream, peer_addr),
        })
    }

    pub fn channel(&self) -> &Channel {
        match self {
            Endpoint::Client(client) => &client.channel,
            Endpoint::Destination(destination) => &destination.channel,
        }
    }

    pub fn channel_mut(&mut self) -> &mut Channel {
        match self {
            Endpoint::Client(client) => &mut client.channel,
            Endpoint::Destination(destination) => &mut destination.channel,
        }
    }

    /// lingers reports whether the connection stays open only to flush
    /// what is already queued for it
    pub fn lingers(&self) -> bool {
        match self {
            Endpoint::Client(client) => {
                client.channel.draining || matches!(client.state, ClientState::Rejected)
            }
            Endpoint::Destination(destination) => destination.channel.draining,
        }
    }

    pub fn role(&self) -> &'static str {
        match self {
            Endpoint::Client(_) => "client",
            Endpoint::Destination(_) => "destination",
        }
    }
}

impl Proxy {
    /// on_client_data feeds bytes read from a client into its state machine
    pub(crate) fn on_client_data(&mut self, id: ConnId, data: &[u8]) {
        let Some(Endpoint::Client(client)) = self.sessions.get_mut(id) else {
            return;
        };

        match client.state {
            ClientState::Relaying => self.forward(id, data),
            ClientState::AwaitingGreeting | ClientState::AwaitingRequest => {
                client.inbox.extend_from_slice(data);
                self.advance_handshake(id);
            }
            _ => debug!(
                "ignoring {} bytes from client {id} in state {:?}",
                data.len(),
                client.state
            ),
        }
    }

    /// advance_handshake decodes as many buffered handshake messages as are
    /// complete
    fn advance_handshake(&mut self, id: ConnId) {
        loop {
            let Some(Endpoint::Client(client)) = self.sessions.get_mut(id) else {
                return;
            };

            match client.state {
                ClientState::AwaitingGreeting => match decode_greeting(&client.inbox) {
                    Err(DecodeError::Incomplete) => return,
                    Ok((AuthMethod::NoAuth, used)) => {
                        client.inbox.advance(used);
                        client.state = ClientState::AwaitingRequest;
                        debug!("client {id} greeted with no-auth");
                        if !self.send(id, &encode_method_reply(AuthMethod::NoAuth)) {
                            return;
                        }
                    }
                    Ok((method, _)) => {
                        info!("client {id} offered no acceptable method");
                        self.reject(id, &encode_method_reply(method));
                        return;
                    }
                    Err(e) => {
                        warn!("malformed greeting from client {id}: {e}");
                        self.reject(id, &encode_method_reply(AuthMethod::NoAcceptable));
                        return;
                    }
                },
                ClientState::AwaitingRequest => {
                    match decode_connect_request(&client.inbox) {
                        Err(DecodeError::Incomplete) => {}
                        Ok((request, used)) => {
                            client.inbox.advance(used);
                            self.on_connect_request(id, request);
                        }
                        Err(e) => {
                            warn!("unsupported request from client {id}: {e}");
                            self.reject(id, &encode_failure(ReplyCode::CommandNotSupported));
                        }
                    }
                    return;
                }
                _ => return,
            }
        }
    }

    fn on_connect_request(&mut self, id: ConnId, request: ConnectRequest) {
        info!(
            "client {id} requested {}:{}",
            request.destination, request.port
        );

        match request.destination {
            Destination::IPv4(ip) => self.start_connect(id, SocketAddrV4::new(ip, request.port)),
            Destination::DomainName(name) => {
                match self
                    .resolver
                    .resolve(&mut self.sessions, &name, id, request.port)
                {
                    Ok(query_id) => {
                        if let Some(Endpoint::Client(client)) = self.sessions.get_mut(id) {
                            client.state = ClientState::AwaitingResolution { query_id };
                        }
                        info!("client {id} waiting on dns query {query_id} for {name}");
                    }
                    Err(e) => {
                        warn!("cannot resolve {name} for client {id}: {e}");
                        self.reject(id, &encode_failure(ReplyCode::HostUnreachable));
                    }
                }
            }
        }
    }

    /// on_resolution advances the client waiting on a resolver reply
    pub(crate) fn on_resolution(&mut self, resolution: Resolution) {
        let Some(pending) = self.sessions.take_pending_dns(resolution.query_id) else {
            warn!(
                "dns reply {} matches no pending query, dropped",
                resolution.query_id
            );
            return;
        };

        let waiting = matches!(
            self.sessions.get(pending.client),
            Some(Endpoint::Client(ClientConn {
                state: ClientState::AwaitingResolution { query_id },
                ..
            })) if *query_id == resolution.query_id
        );
        if !waiting {
            error!(
                "dns query {} pending for client {} that is not awaiting it",
                resolution.query_id, pending.client
            );
            return;
        }

        match resolution.outcome {
            ResolveOutcome::Resolved(ip) => {
                info!(
                    "{} resolved to {ip} for client {}",
                    pending.hostname, pending.client
                );
                self.start_connect(pending.client, SocketAddrV4::new(ip, pending.port));
            }
            ResolveOutcome::NotFound => {
                info!(
                    "no A record for {} (client {})",
                    pending.hostname, pending.client
                );
                self.reject(pending.client, &encode_failure(ReplyCode::HostUnreachable));
            }
        }
    }

    fn start_connect(&mut self, id: ConnId, target: SocketAddrV4) {
        let Some(Endpoint::Client(client)) = self.sessions.get_mut(id) else {
            return;
        };

        client.state = ClientState::Connecting {
            target,
            connect: Box::pin(TcpStream::connect(SocketAddr::V4(target))),
        };
        debug!("client {id} connecting to {target}");
    }

    /// on_connected completes a destination connect: pair and relay on
    /// success, host-unreachable otherwise
    pub(crate) fn on_connected(&mut self, id: ConnId, result: io::Result<TcpStream>) {
        if !self.sessions.contains(id) {
            return;
        }

        let opened = result.and_then(|stream| {
            let local = stream.local_addr()?;
            let peer = stream.peer_addr()?;
            Ok((stream, local, peer))
        });

        let (stream, local, peer) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                warn!("destination connect for client {id} failed: {e}");
                self.reject(id, &encode_failure(ReplyCode::HostUnreachable));
                return;
            }
        };

        let destination = self.sessions.insert(Endpoint::destination(stream, peer));
        if let Err(e) = self.sessions.bind(id, destination) {
            error!("cannot pair client {id} with destination {destination}: {e}");
            self.close(destination, "unpaired destination");
            self.close(id, "unpaired client");
            return;
        }

        let Some(Endpoint::Client(client)) = self.sessions.get_mut(id) else {
            return;
        };
        client.state = ClientState::Relaying;
        let pipelined = client.inbox.split();

        let bound = match local {
            SocketAddr::V4(local) => local,
            SocketAddr::V6(_) => SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
        };

        info!("client {id} relaying to {peer} via {local}");
        if !self.send(id, &encode_reply(ReplyCode::Succeeded, bound)) {
            return;
        }
        if !pipelined.is_empty() {
            self.forward(id, &pipelined);
        }
    }

    /// forward relays bytes read on one side of a session to the other
    pub(crate) fn forward(&mut self, from: ConnId, data: &[u8]) {
        let Some(to) = self.sessions.lookup_peer(from) else {
            error!("connection {from} has no paired peer, force-closing");
            self.close(from, "orphaned");
            return;
        };

        if let Some(peer) = self.sessions.get_mut(to) {
            peer.channel_mut().outbox.extend_from_slice(data);
        }
        if let Err(e) = self.flush(to) {
            self.close(to, e);
        }
    }

    /// reject queues the final reply for a client and closes it once flushed
    pub(crate) fn reject(&mut self, id: ConnId, reply: &[u8]) {
        let Some(Endpoint::Client(client)) = self.sessions.get_mut(id) else {
            return;
        };

        client.state = ClientState::Rejected;
        client.inbox.clear();
        client.channel.outbox.extend_from_slice(reply);

        match self.flush(id) {
            Ok(()) if self.backlog(id) == 0 => self.close(id, "rejected"),
            Ok(()) => debug!("client {id} rejected, flushing final reply"),
            Err(e) => self.close(id, e),
        }
    }

    /// send queues bytes for a connection and tries to write them now.
    /// Returns false if the connection was closed
    pub(crate) fn send(&mut self, id: ConnId, data: &[u8]) -> bool {
        let Some(endpoint) = self.sessions.get_mut(id) else {
            return false;
        };
        endpoint.channel_mut().outbox.extend_from_slice(data);

        match self.flush(id) {
            Ok(()) => true,
            Err(e) => {
                self.close(id, e);
                false
            }
        }
    }
}
