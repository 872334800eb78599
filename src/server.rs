use crate::commands::encode_failure;
use crate::dns::DnsResolver;
use crate::protocol::{BUFFER_SIZE, MAX_PENDING_WRITE, ReplyCode};
use crate::session::{ConnId, SessionTable};
use crate::state::{ClientState, Endpoint};
use anyhow::{Result, anyhow, bail};
use bytes::Buf;
use std::fmt;
use std::future::poll_fn;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Upstream resolver used when none is configured
pub const DEFAULT_DNS_SERVER: &str = "dns.google:53";

const DNS_PORT: u16 = 53;

// How often optional timeouts are checked
const SWEEP_PERIOD: Duration = Duration::from_secs(1);

// Bounds resolver datagrams handled per wakeup
const MAX_DNS_PER_WAKE: usize = 64;

/// Socks5Server represents a SOCKS5 server and houses related
/// configuration data
pub struct Socks5Server {
    pub listen_addr: String,
    pub dns_server: String,
    pub resolve_timeout: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    listener: Option<TcpListener>,
    resolver: Option<DnsResolver>,
}

/// Socks5Server implementation block
impl Socks5Server {
    /// new is a constructor for the Socks5Server type
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            dns_server: DEFAULT_DNS_SERVER.to_string(),
            resolve_timeout: None,
            idle_timeout: None,
            listener: None,
            resolver: None,
        }
    }

    /// with_dns sets the upstream resolver, as host:port or bare host
    pub fn with_dns(mut self, dns_server: impl Into<String>) -> Self {
        self.dns_server = dns_server.into();
        self
    }

    /// with_resolve_timeout bounds how long a client may wait on DNS
    pub fn with_resolve_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.resolve_timeout = timeout;
        self
    }

    /// with_idle_timeout closes sessions with no traffic for this long
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// bind opens the listener and the resolver socket. Returns the
    /// listener's local address
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        if self.listener.is_some() {
            bail!("[ERR] bind can only be called once");
        }

        // Instantiate tokio listener
        let listener = TcpListener::bind(&self.listen_addr)
            .await
            .map_err(|e| anyhow!("[ERR] cannot listen on {}: {e}", self.listen_addr))?;
        let addr = listener.local_addr()?;

        let upstream = lookup_dns_server(&self.dns_server).await?;
        let resolver = DnsResolver::connect(upstream)
            .await
            .map_err(|e| anyhow!("[ERR] cannot open resolver socket to {upstream}: {e}"))?;

        info!("SOCKS5 proxy listening on {addr}, resolving via {upstream}");

        self.listener = Some(listener);
        self.resolver = Some(resolver);
        Ok(addr)
    }

    /// run drives the proxy until a fatal error
    pub async fn run(&mut self) -> Result<()> {
        if self.listener.is_none() {
            self.bind().await?;
        }

        let (Some(listener), Some(resolver)) = (self.listener.take(), self.resolver.take()) else {
            bail!("[ERR] server is not bound");
        };

        let mut proxy = Proxy::new(listener, resolver, self.resolve_timeout, self.idle_timeout);
        proxy.run().await
    }
}

/// lookup_dns_server resolves the upstream resolver's own address through
/// the system resolver, preferring IPv4
async fn lookup_dns_server(dns_server: &str) -> Result<SocketAddr> {
    if let Ok(addr) = dns_server.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = dns_server.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DNS_PORT));
    }

    let target = if dns_server.contains(':') {
        dns_server.to_string()
    } else {
        format!("{dns_server}:{DNS_PORT}")
    };

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(&target)
        .await
        .map_err(|e| anyhow!("[ERR] failed to resolve dns server '{target}': {e}"))?
        .collect();

    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| anyhow!("[ERR] no address found for dns server '{target}'"))
}

/// Event is one unit of readiness found by a poll of every socket
pub(crate) enum Event {
    Accepted(TcpStream, SocketAddr),
    AcceptFailed(io::Error),
    ResolverReadable,
    ResolverWritable,
    Readable(ConnId),
    Writable(ConnId),
    Connected(ConnId, io::Result<TcpStream>),
    Sweep,
}

/// Proxy is the single-threaded event loop: it owns the listener, the
/// resolver socket and every session
pub(crate) struct Proxy {
    listener: TcpListener,
    pub(crate) resolver: DnsResolver,
    pub(crate) sessions: SessionTable<Endpoint>,
    resolve_timeout: Option<Duration>,
    idle_timeout: Option<Duration>,
    sweep: Option<Interval>,
}

impl Proxy {
    fn new(
        listener: TcpListener,
        resolver: DnsResolver,
        resolve_timeout: Option<Duration>,
        idle_timeout: Option<Duration>,
    ) -> Self {
        let sweep = (resolve_timeout.is_some() || idle_timeout.is_some()).then(|| {
            let mut interval = tokio::time::interval(SWEEP_PERIOD);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });

        Self {
            listener,
            resolver,
            sessions: SessionTable::new(),
            resolve_timeout,
            idle_timeout,
            sweep,
        }
    }

    async fn run(&mut self) -> Result<()> {
        loop {
            let events = poll_fn(|cx| self.poll_events(cx)).await;

            for event in events {
                self.dispatch(event);
            }

            debug_assert!(
                self.sessions.is_symmetric(),
                "client/destination pairing lost symmetry"
            );
        }
    }

    /// poll_events registers interest on every socket and returns whatever
    /// is ready, or Pending when nothing is
    fn poll_events(&mut self, cx: &mut Context<'_>) -> Poll<Vec<Event>> {
        let mut events = Vec::new();

        match self.listener.poll_accept(cx) {
            Poll::Ready(Ok((stream, peer_addr))) => events.push(Event::Accepted(stream, peer_addr)),
            Poll::Ready(Err(e)) => events.push(Event::AcceptFailed(e)),
            Poll::Pending => {}
        }

        if self.resolver.poll_recv_ready(cx).is_ready() {
            events.push(Event::ResolverReadable);
        }
        if self.resolver.has_queued() && self.resolver.poll_send_ready(cx).is_ready() {
            events.push(Event::ResolverWritable);
        }

        if let Some(sweep) = self.sweep.as_mut() {
            if sweep.poll_tick(cx).is_ready() {
                events.push(Event::Sweep);
            }
        }

        for id in self.sessions.ids() {
            let wants_read = self.wants_read(id);
            let Some(endpoint) = self.sessions.get_mut(id) else {
                continue;
            };

            let channel = endpoint.channel();
            if wants_read && channel.stream.poll_read_ready(cx).is_ready() {
                events.push(Event::Readable(id));
            }
            if !channel.outbox.is_empty() && channel.stream.poll_write_ready(cx).is_ready() {
                events.push(Event::Writable(id));
            }

            if let Endpoint::Client(client) = endpoint {
                if let ClientState::Connecting { connect, .. } = &mut client.state {
                    if let Poll::Ready(result) = connect.as_mut().poll(cx) {
                        events.push(Event::Connected(id, result));
                    }
                }
            }
        }

        if events.is_empty() {
            Poll::Pending
        } else {
            Poll::Ready(events)
        }
    }

    // A source is read only when its state consumes bytes and its peer is
    // not backed up
    fn wants_read(&self, id: ConnId) -> bool {
        let consumes = match self.sessions.get(id) {
            Some(endpoint) if endpoint.channel().draining => false,
            Some(Endpoint::Client(client)) => client.state.reads_client(),
            Some(Endpoint::Destination(_)) => true,
            None => false,
        };

        consumes
            && self
                .sessions
                .lookup_peer(id)
                .is_none_or(|peer| self.backlog(peer) < MAX_PENDING_WRITE)
    }

    fn dispatch(&mut self, event: Event) {
        match event {
            Event::Accepted(stream, peer_addr) => {
                let id = self.sessions.insert(Endpoint::client(stream, peer_addr));
                info!("new client {id}: {peer_addr}");
            }
            Event::AcceptFailed(e) => error!("accept failed: {e}"),
            Event::ResolverReadable => self.drain_resolver(),
            Event::ResolverWritable => {
                if let Err(e) = self.resolver.flush_queries() {
                    warn!("resolver socket error ({}): {e}", self.resolver.upstream());
                }
            }
            Event::Readable(id) => self.on_readable(id),
            Event::Writable(id) => self.on_writable(id),
            Event::Connected(id, result) => self.on_connected(id, result),
            Event::Sweep => self.sweep_timeouts(),
        }
    }

    fn drain_resolver(&mut self) {
        for _ in 0..MAX_DNS_PER_WAKE {
            match self.resolver.recv_resolution() {
                Ok(Some(resolution)) => self.on_resolution(resolution),
                Ok(None) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => warn!("resolver socket error ({}): {e}", self.resolver.upstream()),
            }
        }
    }

    fn on_readable(&mut self, id: ConnId) {
        let mut buf = [0u8; BUFFER_SIZE];

        // Already closed earlier in this batch
        let Some(endpoint) = self.sessions.get_mut(id) else {
            return;
        };

        let channel = endpoint.channel_mut();
        let len = match channel.stream.try_read(&mut buf) {
            Ok(0) => {
                self.finish(id, "peer closed");
                return;
            }
            Ok(len) => len,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                self.finish(id, e);
                return;
            }
        };
        channel.last_activity = Instant::now();

        if matches!(endpoint, Endpoint::Client(_)) {
            self.on_client_data(id, &buf[..len]);
        } else {
            self.forward(id, &buf[..len]);
        }
    }

    fn on_writable(&mut self, id: ConnId) {
        if let Err(e) = self.flush(id) {
            self.close(id, e);
            return;
        }

        let drained = self
            .sessions
            .get(id)
            .is_some_and(|endpoint| endpoint.lingers() && endpoint.channel().outbox.is_empty());
        if drained {
            self.close(id, "flushed");
        }
    }

    /// flush writes as much of the outbound queue as the socket takes
    pub(crate) fn flush(&mut self, id: ConnId) -> io::Result<()> {
        let Some(endpoint) = self.sessions.get_mut(id) else {
            return Ok(());
        };
        let channel = endpoint.channel_mut();

        while !channel.outbox.is_empty() {
            match channel.stream.try_write(&channel.outbox) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(written) => {
                    channel.outbox.advance(written);
                    channel.last_activity = Instant::now();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// backlog is the number of bytes queued for a connection
    pub(crate) fn backlog(&self, id: ConnId) -> usize {
        self.sessions
            .get(id)
            .map_or(0, |endpoint| endpoint.channel().outbox.len())
    }

    /// close tears down a connection together with its peer
    pub(crate) fn close(&mut self, id: ConnId, reason: impl fmt::Display) {
        for endpoint in self.sessions.teardown(id) {
            debug!(
                "closed {} {}",
                endpoint.role(),
                endpoint.channel().peer_addr
            );
        }
        info!("session {id} closed: {reason}");
    }

    /// finish ends a session once one side stops sending. The source is
    /// closed at once; its peer stops being read and lingers until the bytes
    /// already queued for it are written
    pub(crate) fn finish(&mut self, id: ConnId, reason: impl fmt::Display) {
        let peer = self.sessions.detach(id);
        self.close(id, reason);

        let Some(peer) = peer else {
            return;
        };
        let queued = self.backlog(peer);
        if queued == 0 {
            self.close(peer, "peer closed");
            return;
        }

        if let Some(endpoint) = self.sessions.get_mut(peer) {
            endpoint.channel_mut().draining = true;
        }
        debug!("{peer} draining {queued} queued bytes before close");
    }

    fn sweep_timeouts(&mut self) {
        let now = Instant::now();

        if let Some(cutoff) = self.resolve_timeout.and_then(|t| now.checked_sub(t)) {
            for query_id in self.sessions.expired_queries(cutoff) {
                if let Some(pending) = self.sessions.take_pending_dns(query_id) {
                    warn!(
                        "dns query {query_id} for {} timed out (client {})",
                        pending.hostname, pending.client
                    );
                    self.reject(pending.client, &encode_failure(ReplyCode::HostUnreachable));
                }
            }
        }

        let Some(idle_timeout) = self.idle_timeout else {
            return;
        };

        // Paired destinations are judged through their client
        for id in self.sessions.ids() {
            let Some(endpoint) = self.sessions.get(id) else {
                continue;
            };
            match endpoint {
                Endpoint::Client(client)
                    if matches!(client.state, ClientState::AwaitingResolution { .. }) =>
                {
                    continue;
                }
                Endpoint::Destination(_) if self.sessions.lookup_client(id).is_some() => continue,
                _ => {}
            }

            let mut last_activity = endpoint.channel().last_activity;
            if let Some(peer) = self
                .sessions
                .lookup_destination(id)
                .and_then(|destination| self.sessions.get(destination))
            {
                last_activity = last_activity.max(peer.channel().last_activity);
            }

            if now.duration_since(last_activity) >= idle_timeout {
                self.close(id, "idle timeout");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dns_server_literals_skip_the_system_resolver() {
        assert_eq!(
            lookup_dns_server("2001:4860:4860::8888").await.unwrap(),
            "[2001:4860:4860::8888]:53".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            lookup_dns_server("[::1]:5353").await.unwrap(),
            "[::1]:5353".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            lookup_dns_server("127.0.0.1").await.unwrap(),
            "127.0.0.1:53".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            lookup_dns_server("127.0.0.1:5353").await.unwrap(),
            "127.0.0.1:5353".parse::<SocketAddr>().unwrap()
        );
    }

    #[tokio::test]
    async fn bare_hostname_gets_dns_port() {
        let addr = lookup_dns_server("localhost").await.unwrap();
        assert_eq!(addr.port(), DNS_PORT);
    }
}
