//! Per-client session state machine
//!
//! A session owns the accepted client stream and every socket opened on its
//! behalf. Readiness events are routed here by role; an `Err` from any
//! handler ends the session, and the server tears it down.

use super::hook::ServerHook;
use super::poller::{Readiness, Role, RoleKey, SessionId, MAX_DNS_QUERIES};
use super::nat::{DropReason, Outbound};
use super::roles::{
    bind_datagram, recv_datagram_via, send_datagram_via, ClientSocket, DnsQuery, IoStatus,
    RemoteSocket, RemoteStream, StreamEnd, UdpRelay,
};
use super::write::Flush;
use crate::config::ServerConfig;
use crate::dns::QueryIds;
use crate::error::{Reply, SessionError, SessionResult, Socks5Error};
use crate::helper::{pending_error, unspecified_for, SESSION_BUFFER_SIZE};
use crate::socks::{
    decode_command, decode_credentials, decode_greeting, encode_auth_status,
    encode_method_selection, encode_reply, select_method, AddressRecord, AuthMethod, Command,
    DomainName, MAX_HANDSHAKE_MESSAGE_LEN,
};
use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use mio::{Registry, Token};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use tracing::{debug, error, info, trace, warn};

/// Reads of unwanted client bytes per readiness event
const MAX_DISCARD_READS: usize = 4;

/// Where a session is in the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the method greeting
    Accepted,
    /// Waiting for username/password
    AuthRequested,
    /// Waiting for a command request
    Authenticated,
    /// Waiting for a DNS answer
    ResolvingDomainName,
    /// Outbound connect in progress
    ConnectingRemote,
    /// Relaying a TCP stream
    Connected,
    /// Relaying UDP datagrams
    Associated,
}

impl SessionState {
    /// Whether the client is still negotiating
    pub fn is_handshake(self) -> bool {
        matches!(
            self,
            SessionState::Accepted | SessionState::AuthRequested | SessionState::Authenticated
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Accepted => "accepted",
            SessionState::AuthRequested => "auth-requested",
            SessionState::Authenticated => "authenticated",
            SessionState::ResolvingDomainName => "resolving",
            SessionState::ConnectingRemote => "connecting",
            SessionState::Connected => "connected",
            SessionState::Associated => "associated",
        };
        f.write_str(name)
    }
}

/// Server-owned resources a session borrows while handling an event
pub struct SessionContext<'a> {
    /// Poll registry
    pub registry: &'a Registry,
    /// Server configuration
    pub config: &'a ServerConfig,
    /// Upstream DNS server; `None` disables domain resolution
    pub dns_server: Option<SocketAddr>,
    /// DNS transaction ids
    pub query_ids: &'a mut QueryIds,
    /// Shared scratch buffer
    pub buffer: &'a mut [u8],
    /// Lifecycle observer and socket I/O
    pub hook: &'a mut dyn ServerHook,
}

/// Command waiting for its destination to resolve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Intent {
    Connect,
    Associate,
}

#[derive(Debug, Clone, Copy)]
struct PendingCommand {
    intent: Intent,
    port: u16,
}

/// One client and the sockets opened for it
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    state: SessionState,
    client: ClientSocket,
    remote: Option<RemoteSocket>,
    relay: Option<UdpRelay>,
    dns: [Option<DnsQuery>; MAX_DNS_QUERIES],
    inbound: BytesMut,
    pending: Option<PendingCommand>,
}

fn stream_end(remote: &mut Option<RemoteSocket>) -> Option<&mut StreamEnd> {
    match remote {
        Some(RemoteSocket::Stream(stream)) => stream.end(),
        _ => None,
    }
}

impl Session {
    /// Wrap an accepted stream and register it for reads
    pub fn new(
        id: SessionId,
        stream: TcpStream,
        peer: SocketAddr,
        registry: &Registry,
        config: &ServerConfig,
    ) -> SessionResult<Self> {
        let mut client = ClientSocket::new(id, stream, peer, &config.client_tcp)?;
        client
            .end()
            .register(registry, RoleKey::new(id, Role::Client).token())?;

        Ok(Session {
            id,
            state: SessionState::Accepted,
            client,
            remote: None,
            relay: None,
            dns: std::array::from_fn(|_| None),
            inbound: BytesMut::new(),
            pending: None,
        })
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Number of DNS queries in flight
    pub fn outstanding_queries(&self) -> usize {
        self.dns.iter().filter(|q| q.is_some()).count()
    }

    fn token(&self, role: Role) -> Token {
        RoleKey::new(self.id, role).token()
    }

    /// Handle readiness of one of this session's sockets
    ///
    /// Returns `false` when the session must be torn down.
    pub fn process_readiness(
        &mut self,
        role: Role,
        readiness: Readiness,
        ctx: &mut SessionContext<'_>,
    ) -> bool {
        let result = match role {
            Role::Client => self.on_client(readiness, ctx),
            Role::Remote => self.on_remote(readiness, ctx),
            Role::UdpRelay => self.on_relay(readiness, ctx),
            Role::DnsQuery(slot) => self.on_dns(slot, readiness, ctx),
        };

        match result {
            Ok(()) => true,
            Err(e) if e.is_peer_closed() => {
                debug!(session = self.id, state = %self.state, "Peer closed connection");
                false
            }
            Err(SessionError::Transport(e)) => {
                error!(session = self.id, state = %self.state, "Transport error: {}", e);
                false
            }
            Err(e) => {
                warn!(session = self.id, state = %self.state, "Session terminated: {}", e);
                false
            }
        }
    }

    /// Deregister and close every socket, client last
    pub fn close(&mut self, registry: &Registry, hook: &mut dyn ServerHook) {
        self.close_queries(registry);

        if let Some(mut relay) = self.relay.take() {
            relay.close(registry);
        }
        if let Some(mut remote) = self.remote.take() {
            if let Some(peer) = remote.connected_peer() {
                hook.on_remote_disconnected(self.id, peer);
            }
            remote.close(registry);
        }

        self.client.end().close(registry);
        hook.on_client_disconnected(self.id, self.client.peer());
        debug!(session = self.id, "Session closed");
    }

    fn close_queries(&mut self, registry: &Registry) {
        for slot in self.dns.iter_mut() {
            if let Some(mut query) = slot.take() {
                query.close(registry);
            }
        }
    }

    // Client stream

    fn on_client(&mut self, readiness: Readiness, ctx: &mut SessionContext<'_>) -> SessionResult<()> {
        if readiness.error {
            let stream = self.client.end().stream();
            return Err(pending_error(|| stream.take_error()).into());
        }
        if readiness.hangup {
            return Err(SessionError::PeerClosed);
        }

        if readiness.writable {
            self.flush_client(ctx)?;
        }
        if readiness.readable {
            self.read_client(ctx)?;
        }
        Ok(())
    }

    fn flush_client(&mut self, ctx: &mut SessionContext<'_>) -> SessionResult<()> {
        let client_token = self.token(Role::Client);
        let remote_token = self.token(Role::Remote);

        if self.client.end().flush(ctx.hook)? == Flush::Pending {
            return Ok(());
        }
        self.client.end().resume(ctx.registry, client_token)?;

        // Remote reads were paused while the client lagged
        if self.state == SessionState::Connected {
            if let Some(end) = stream_end(&mut self.remote) {
                end.resume(ctx.registry, remote_token)?;
            }
        }
        Ok(())
    }

    fn read_client(&mut self, ctx: &mut SessionContext<'_>) -> SessionResult<()> {
        match self.state {
            SessionState::Accepted | SessionState::AuthRequested | SessionState::Authenticated => {
                self.read_handshake(ctx)
            }
            SessionState::Connected => self.pump_client_to_remote(ctx),
            // Read once connected
            SessionState::ConnectingRemote => Ok(()),
            SessionState::ResolvingDomainName | SessionState::Associated => {
                self.discard_client_bytes(ctx)
            }
        }
    }

    fn read_handshake(&mut self, ctx: &mut SessionContext<'_>) -> SessionResult<()> {
        // Replies still queued for the client; resumed after the flush
        if self.client.end().has_pending() {
            return Ok(());
        }

        let token = self.token(Role::Client);
        loop {
            let buf = &mut ctx.buffer[..SESSION_BUFFER_SIZE];
            let burst_done = match self.client.end().recv(ctx.hook, buf)? {
                IoStatus::Data(n) => {
                    self.inbound.extend_from_slice(&buf[..n]);
                    false
                }
                IoStatus::WouldBlock => true,
                IoStatus::Closed => return Err(SessionError::PeerClosed),
            };
            self.parse_handshake(burst_done, ctx)?;

            if burst_done {
                return Ok(());
            }
            if !self.state.is_handshake() {
                // Unread bytes belong to the next state
                self.client.end().resume(ctx.registry, token)?;
                return Ok(());
            }
            if self.inbound.len() > MAX_HANDSHAKE_MESSAGE_LEN {
                return Err(Socks5Error::MessageTooLong(self.inbound.len()).into());
            }
        }
    }

    /// Handle every complete message in `inbound`
    ///
    /// A message cut short may still be completed later in the same burst;
    /// once the burst is over it is a protocol violation.
    fn parse_handshake(
        &mut self,
        burst_done: bool,
        ctx: &mut SessionContext<'_>,
    ) -> SessionResult<()> {
        while !self.inbound.is_empty() {
            let result = match self.state {
                SessionState::Accepted => self.on_greeting(ctx),
                SessionState::AuthRequested => self.on_credentials(ctx),
                SessionState::Authenticated => self.on_command(ctx),
                // Anything left over is early data for the remote
                _ => return Ok(()),
            };
            match result {
                Ok(()) => {}
                Err(SessionError::ProtocolViolation(Socks5Error::TruncatedMessage { .. }))
                    if !burst_done =>
                {
                    return Ok(())
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn discard_client_bytes(&mut self, ctx: &mut SessionContext<'_>) -> SessionResult<()> {
        let token = self.token(Role::Client);
        let buf = &mut ctx.buffer[..SESSION_BUFFER_SIZE];
        let mut discarded = 0;
        let mut drained = false;
        for _ in 0..MAX_DISCARD_READS {
            match self.client.end().recv(ctx.hook, buf)? {
                IoStatus::Data(n) => discarded += n,
                IoStatus::WouldBlock => {
                    drained = true;
                    break;
                }
                IoStatus::Closed => return Err(SessionError::PeerClosed),
            }
        }
        if discarded > 0 {
            warn!(
                session = self.id,
                state = %self.state,
                "Discarded {} unexpected bytes from client",
                discarded
            );
        }
        if !drained {
            // Let other sessions run; re-arming reports the rest later
            self.client.end().resume(ctx.registry, token)?;
        }
        Ok(())
    }

    fn send_client(&mut self, ctx: &mut SessionContext<'_>, data: &[u8]) -> SessionResult<()> {
        let token = self.token(Role::Client);
        let end = self.client.end();
        end.send(ctx.hook, data)?;
        end.settle(ctx.registry, token)?;
        Ok(())
    }

    fn reject(&mut self, ctx: &mut SessionContext<'_>, reply: Reply) {
        self.client
            .send_last(ctx.hook, &encode_reply(reply, &AddressRecord::unspecified()));
    }

    // Handshake

    fn on_greeting(&mut self, ctx: &mut SessionContext<'_>) -> SessionResult<()> {
        let required = ctx.config.auth_method();
        let decoded = decode_greeting(&self.inbound)
            .map(|(offered, len)| (select_method(offered, required), len));
        let (selected, len) = match decoded {
            Ok(decoded) => decoded,
            Err(e @ Socks5Error::UnsupportedVersion(_)) => {
                self.client
                    .send_last(ctx.hook, &encode_method_selection(None));
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };
        self.inbound.advance(len);

        match selected {
            None => {
                self.client
                    .send_last(ctx.hook, &encode_method_selection(None));
                Err(Socks5Error::NoAcceptableMethod.into())
            }
            Some(method) => {
                trace!(session = self.id, "Selected auth method {}", method);
                self.send_client(ctx, &encode_method_selection(Some(method)))?;
                self.state = match method {
                    AuthMethod::None => SessionState::Authenticated,
                    AuthMethod::Password => SessionState::AuthRequested,
                };
                Ok(())
            }
        }
    }

    fn on_credentials(&mut self, ctx: &mut SessionContext<'_>) -> SessionResult<()> {
        let (credentials, len) = decode_credentials(&self.inbound)?;
        self.inbound.advance(len);

        if !credentials.matches(&ctx.config.username, &ctx.config.password) {
            warn!(
                session = self.id,
                "Authentication failed for user {:?}",
                credentials.username_lossy()
            );
            self.client.send_last(ctx.hook, &encode_auth_status(false));
            return Err(Socks5Error::AuthFailed.into());
        }

        debug!(session = self.id, "Authenticated user {:?}", credentials.username_lossy());
        self.send_client(ctx, &encode_auth_status(true))?;
        self.state = SessionState::Authenticated;
        Ok(())
    }

    fn on_command(&mut self, ctx: &mut SessionContext<'_>) -> SessionResult<()> {
        let request = match decode_command(&self.inbound) {
            Ok(request) => request,
            Err(e @ Socks5Error::AddressTypeNotSupported(_)) => {
                self.reject(ctx, Reply::AddrTypeNotSupported);
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };
        self.inbound.advance(request.len);

        info!(
            session = self.id,
            "SOCKS5 {} request to {}", request.command, request.address
        );

        let intent = match request.command {
            Command::Connect => Intent::Connect,
            Command::UdpAssociate => Intent::Associate,
            other => {
                self.reject(ctx, Reply::CommandNotSupported);
                return Err(Socks5Error::CommandNotSupported(other.to_byte()).into());
            }
        };

        match request.address {
            AddressRecord::Domain(name, port) => self.begin_resolution(name, port, intent, ctx),
            address => {
                let target = address
                    .socket_addr()
                    .ok_or_else(|| Socks5Error::AddressTypeNotSupported(address.addr_type()))?;
                self.dispatch(intent, vec![target], ctx)
            }
        }
    }

    // Resolution

    fn begin_resolution(
        &mut self,
        name: DomainName,
        port: u16,
        intent: Intent,
        ctx: &mut SessionContext<'_>,
    ) -> SessionResult<()> {
        let server = match ctx.dns_server {
            Some(server) => server,
            None => {
                self.reject(ctx, Reply::AddrTypeNotSupported);
                return Err(SessionError::ResolutionFailure(format!(
                    "{}: domain resolution disabled",
                    name
                )));
            }
        };

        match self.start_resolution(name, server, ctx) {
            Ok(()) => {
                self.pending = Some(PendingCommand { intent, port });
                self.state = SessionState::ResolvingDomainName;
                Ok(())
            }
            Err(SessionError::ResourceExhausted(what)) => {
                // The client may retry the command
                warn!(session = self.id, "Resolution refused: {} exhausted", what);
                Ok(())
            }
            Err(e) => {
                self.reject(ctx, Reply::HostUnreachable);
                Err(e)
            }
        }
    }

    /// Open a DNS query socket in a free slot and send the query
    pub(crate) fn start_resolution(
        &mut self,
        name: DomainName,
        server: SocketAddr,
        ctx: &mut SessionContext<'_>,
    ) -> SessionResult<()> {
        let slot = self
            .dns
            .iter()
            .position(Option::is_none)
            .ok_or(SessionError::ResourceExhausted("DNS query slots"))?;

        let token = self.token(Role::DnsQuery(slot));
        let query = DnsQuery::start(name, server, ctx.query_ids.next_id(), ctx.registry, token)?;
        debug!(session = self.id, "Resolving {} via {}", query.domain(), server);

        self.dns[slot] = Some(query);
        Ok(())
    }

    fn on_dns(
        &mut self,
        slot: usize,
        readiness: Readiness,
        ctx: &mut SessionContext<'_>,
    ) -> SessionResult<()> {
        let query = match self.dns.get_mut(slot).and_then(Option::as_mut) {
            Some(query) => query,
            None => return Ok(()),
        };

        let outcome = if readiness.error {
            Err(SessionError::ResolutionFailure(format!(
                "{}: query socket error",
                query.domain()
            )))
        } else {
            query.recv(ctx.buffer)
        };

        match outcome {
            Ok(None) => Ok(()),
            Ok(Some(addresses)) => {
                debug!(session = self.id, "Resolved {} addresses", addresses.len());
                self.close_queries(ctx.registry);
                self.on_resolved(addresses, ctx)
            }
            Err(e) => {
                self.close_queries(ctx.registry);
                self.reject(ctx, Reply::HostUnreachable);
                Err(e)
            }
        }
    }

    fn on_resolved(&mut self, addresses: Vec<IpAddr>, ctx: &mut SessionContext<'_>) -> SessionResult<()> {
        let pending = match self.pending.take() {
            Some(pending) => pending,
            None => return Ok(()),
        };

        let candidates = addresses
            .into_iter()
            .map(|ip| SocketAddr::new(ip, pending.port))
            .collect();
        self.dispatch(pending.intent, candidates, ctx)
    }

    fn dispatch(
        &mut self,
        intent: Intent,
        candidates: Vec<SocketAddr>,
        ctx: &mut SessionContext<'_>,
    ) -> SessionResult<()> {
        match intent {
            Intent::Connect => self.start_connect(candidates, ctx),
            Intent::Associate => self.associate(ctx),
        }
    }

    // CONNECT

    fn start_connect(
        &mut self,
        candidates: Vec<SocketAddr>,
        ctx: &mut SessionContext<'_>,
    ) -> SessionResult<()> {
        let mut remote = RemoteStream::new(self.id, candidates);
        let early = self.inbound.split();
        if !early.is_empty() {
            remote.queue_early(&early);
        }

        self.remote = Some(RemoteSocket::Stream(remote));
        self.state = SessionState::ConnectingRemote;
        self.try_connect_next(ctx)
    }

    /// Start the next candidate; immediate failures move straight on
    fn try_connect_next(&mut self, ctx: &mut SessionContext<'_>) -> SessionResult<()> {
        let token = self.token(Role::Remote);
        let remote = match self.remote.as_mut() {
            Some(RemoteSocket::Stream(remote)) => remote,
            _ => return Err(SessionError::ConnectFailure("no outbound stream".to_string())),
        };

        loop {
            let addr = match remote.connector().advance() {
                Some(addr) => addr,
                None => {
                    let (reply, bound) = remote.connector().failure_reply();
                    let detail = match remote.connector().last_error() {
                        Some(e) => e.to_string(),
                        None => "no candidate addresses".to_string(),
                    };
                    remote.close(ctx.registry);
                    self.client.send_last(ctx.hook, &encode_reply(reply, &bound));
                    return Err(SessionError::ConnectFailure(detail));
                }
            };

            debug!(session = self.id, "Connecting to {}", addr);
            match remote.connect(addr, &ctx.config.remote_tcp, ctx.registry, token) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!(session = self.id, "Connect to {} failed: {}", addr, e);
                    remote.close(ctx.registry);
                    remote.connector().record_failure(e);
                }
            }
        }
    }

    fn on_connect_ready(
        &mut self,
        readiness: Readiness,
        ctx: &mut SessionContext<'_>,
    ) -> SessionResult<()> {
        let remote = match self.remote.as_mut() {
            Some(RemoteSocket::Stream(remote)) => remote,
            _ => return Ok(()),
        };

        match remote.poll_connected() {
            Ok(Some(peer)) => self.on_connectable(peer, ctx),
            Ok(None) if readiness.is_fatal() => {
                remote.close(ctx.registry);
                remote
                    .connector()
                    .record_failure(std::io::ErrorKind::NotConnected.into());
                self.try_connect_next(ctx)
            }
            // Spurious wakeup, still in progress
            Ok(None) => Ok(()),
            Err(e) => {
                debug!(
                    session = self.id,
                    "Connect to {:?} failed: {}",
                    remote.connector().attempting(),
                    e
                );
                remote.close(ctx.registry);
                remote.connector().record_failure(e);
                self.try_connect_next(ctx)
            }
        }
    }

    fn on_connectable(&mut self, peer: SocketAddr, ctx: &mut SessionContext<'_>) -> SessionResult<()> {
        let remote_token = self.token(Role::Remote);
        let client_token = self.token(Role::Client);

        let remote = match self.remote.as_mut() {
            Some(RemoteSocket::Stream(remote)) => remote,
            _ => return Ok(()),
        };
        remote.established(peer);

        let end = match remote.end() {
            Some(end) => end,
            None => return Err(SessionError::ConnectFailure(peer.to_string())),
        };
        let bound = end.stream().local_addr()?;
        end.flush(ctx.hook)?;
        end.resume(ctx.registry, remote_token)?;

        info!(session = self.id, "SOCKS5 tunnel established to {}", peer);
        ctx.hook.on_remote_connected(self.id, peer);

        self.state = SessionState::Connected;
        self.send_client(ctx, &encode_reply(Reply::Success, &AddressRecord::from(bound)))?;

        // Client reads were deferred during the connect
        self.client.end().resume(ctx.registry, client_token)?;
        Ok(())
    }

    // Stream relay

    fn on_remote(&mut self, readiness: Readiness, ctx: &mut SessionContext<'_>) -> SessionResult<()> {
        match self.remote {
            Some(RemoteSocket::Stream(_)) if self.state == SessionState::ConnectingRemote => {
                self.on_connect_ready(readiness, ctx)
            }
            Some(RemoteSocket::Stream(_)) => self.on_remote_stream(readiness, ctx),
            Some(RemoteSocket::Datagram(_)) => self.on_remote_datagram(readiness, ctx),
            None => Ok(()),
        }
    }

    fn on_remote_stream(
        &mut self,
        readiness: Readiness,
        ctx: &mut SessionContext<'_>,
    ) -> SessionResult<()> {
        let remote_token = self.token(Role::Remote);
        let client_token = self.token(Role::Client);

        let end = match stream_end(&mut self.remote) {
            Some(end) => end,
            None => return Ok(()),
        };

        if readiness.error {
            let stream = end.stream();
            return Err(pending_error(|| stream.take_error()).into());
        }
        if readiness.hangup {
            return Err(SessionError::PeerClosed);
        }

        if readiness.writable && end.flush(ctx.hook)? == Flush::Drained {
            end.resume(ctx.registry, remote_token)?;
            // Client reads were paused while the remote lagged
            self.client.end().resume(ctx.registry, client_token)?;
        }
        if readiness.readable {
            self.pump_remote_to_client(ctx)?;
        }
        Ok(())
    }

    fn pump_client_to_remote(&mut self, ctx: &mut SessionContext<'_>) -> SessionResult<()> {
        let remote_token = self.token(Role::Remote);
        let buf = &mut ctx.buffer[..SESSION_BUFFER_SIZE];

        loop {
            let remote = match stream_end(&mut self.remote) {
                Some(end) => end,
                None => return Ok(()),
            };
            if remote.has_pending() {
                return Ok(());
            }

            match self.client.end().recv(ctx.hook, buf)? {
                IoStatus::Data(n) => {
                    if remote.send(ctx.hook, &buf[..n])? == Flush::Pending {
                        remote.settle(ctx.registry, remote_token)?;
                        return Ok(());
                    }
                }
                IoStatus::WouldBlock => return Ok(()),
                IoStatus::Closed => return Err(SessionError::PeerClosed),
            }
        }
    }

    fn pump_remote_to_client(&mut self, ctx: &mut SessionContext<'_>) -> SessionResult<()> {
        let client_token = self.token(Role::Client);
        let buf = &mut ctx.buffer[..SESSION_BUFFER_SIZE];

        loop {
            let remote = match stream_end(&mut self.remote) {
                Some(end) => end,
                None => return Ok(()),
            };
            let client = self.client.end();
            if client.has_pending() {
                return Ok(());
            }

            match remote.recv(ctx.hook, buf)? {
                IoStatus::Data(n) => {
                    if client.send(ctx.hook, &buf[..n])? == Flush::Pending {
                        client.settle(ctx.registry, client_token)?;
                        return Ok(());
                    }
                }
                IoStatus::WouldBlock => return Ok(()),
                IoStatus::Closed => return Err(SessionError::PeerClosed),
            }
        }
    }

    // UDP ASSOCIATE

    fn associate(&mut self, ctx: &mut SessionContext<'_>) -> SessionResult<()> {
        let local_ip = self.client.local().ip();
        let relay = UdpRelay::bind(
            local_ip,
            self.client.peer().ip(),
            ctx.registry,
            self.token(Role::UdpRelay),
        )?;
        let bound = relay.local_addr()?;
        self.relay = Some(relay);

        let remote = bind_datagram(
            unspecified_for(local_ip),
            ctx.registry,
            self.token(Role::Remote),
        )?;
        self.remote = Some(RemoteSocket::Datagram(remote));

        // Control stream carries no data from here on
        self.inbound.clear();
        self.state = SessionState::Associated;

        info!(session = self.id, "UDP relay bound on {}", bound);
        self.send_client(ctx, &encode_reply(Reply::Success, &AddressRecord::from(bound)))
    }

    fn on_relay(&mut self, readiness: Readiness, ctx: &mut SessionContext<'_>) -> SessionResult<()> {
        let client_is_v4 = self.client.local().is_ipv4();
        let relay = match self.relay.as_mut() {
            Some(relay) => relay,
            None => return Ok(()),
        };
        if readiness.error {
            let socket = relay.socket();
            return Err(pending_error(|| socket.take_error()).into());
        }

        let remote = match self.remote.as_ref() {
            Some(RemoteSocket::Datagram(socket)) => socket,
            _ => return Ok(()),
        };
        let (socket, nat) = relay.parts();

        while let Some((n, src)) = recv_datagram_via(ctx.hook, self.id, socket, ctx.buffer)? {
            match nat.from_client(&ctx.buffer[..n], src) {
                Outbound::Forward { dest, payload } => {
                    if dest.is_ipv4() != client_is_v4 {
                        debug!(session = self.id, "Dropping datagram to {}: address family", dest);
                        continue;
                    }
                    if !send_datagram_via(ctx.hook, self.id, remote, payload, dest)? {
                        debug!(session = self.id, "Dropping datagram to {}: socket busy", dest);
                    }
                }
                Outbound::Drop(reason @ DropReason::PortMapFull) => {
                    warn!(session = self.id, "Dropping datagram from {}: {}", src, reason);
                }
                Outbound::Drop(reason) => {
                    debug!(session = self.id, "Dropping datagram from {}: {}", src, reason);
                }
            }
        }
        Ok(())
    }

    fn on_remote_datagram(
        &mut self,
        readiness: Readiness,
        ctx: &mut SessionContext<'_>,
    ) -> SessionResult<()> {
        let remote = match self.remote.as_ref() {
            Some(RemoteSocket::Datagram(socket)) => socket,
            _ => return Ok(()),
        };
        if readiness.error {
            return Err(pending_error(|| remote.take_error()).into());
        }
        let relay = match self.relay.as_mut() {
            Some(relay) => relay,
            None => return Ok(()),
        };
        let (socket, nat) = relay.parts();

        while let Some((n, src)) = recv_datagram_via(ctx.hook, self.id, remote, ctx.buffer)? {
            match nat.to_client(&ctx.buffer[..n], src) {
                Ok((packet, client)) => {
                    if !send_datagram_via(ctx.hook, self.id, socket, &packet, client)? {
                        debug!(session = self.id, "Dropping reply to {}: socket busy", client);
                    }
                }
                Err(unmapped) => {
                    warn!(session = self.id, "Dropping datagram from {}: {}", src, unmapped);
                }
            }
        }
        Ok(())
    }
}
