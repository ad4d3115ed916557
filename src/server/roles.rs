//! Socket roles
//!
//! Typed wrappers over the non-blocking sockets a session owns. Each wrapper
//! knows how to register itself, perform its I/O without surfacing
//! would-block as an error, and tear itself down. Protocol decisions stay in
//! the session.

use super::connector::RemoteConnector;
use super::hook::ServerHook;
use super::nat::NatTable;
use super::poller::{stream_interest, SessionId};
use super::write::{Flush, ScheduledWrite};
use crate::config::TcpOptions;
use crate::dns::{build_query, parse_response, DnsError, RecordType};
use crate::error::{SessionError, SessionResult};
use crate::helper::unspecified_for;
use crate::socks::DomainName;
use mio::net::{TcpStream, UdpSocket};
use mio::{Interest, Registry, Token};
use socket2::SockRef;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr};
use tracing::{debug, trace};

/// Outcome of a receive that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    /// This many bytes were read
    Data(usize),
    /// Nothing available until the next readiness event
    WouldBlock,
    /// Orderly EOF
    Closed,
}

/// Read once, folding would-block and EOF into [`IoStatus`]
pub fn recv_some<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<IoStatus> {
    loop {
        match reader.read(buf) {
            Ok(0) => return Ok(IoStatus::Closed),
            Ok(n) => return Ok(IoStatus::Data(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(IoStatus::WouldBlock),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
}

/// Run a socket call, retrying on interrupt; would-block becomes `None`
fn nonblocking<T>(mut op: impl FnMut() -> io::Result<T>) -> io::Result<Option<T>> {
    loop {
        match op() {
            Ok(value) => return Ok(Some(value)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
}

/// Receive one datagram, or `None` if nothing is queued
pub fn recv_datagram(
    socket: &UdpSocket,
    buf: &mut [u8],
) -> io::Result<Option<(usize, SocketAddr)>> {
    nonblocking(|| socket.recv_from(buf))
}

/// Send one datagram; returns `false` if the socket buffer was full and the
/// datagram was dropped
pub fn send_datagram(socket: &UdpSocket, data: &[u8], dest: SocketAddr) -> io::Result<bool> {
    Ok(nonblocking(|| socket.send_to(data, dest))?.is_some())
}

/// [`recv_datagram`] for an association socket, through the hook
pub fn recv_datagram_via(
    hook: &mut dyn ServerHook,
    session: SessionId,
    socket: &UdpSocket,
    buf: &mut [u8],
) -> io::Result<Option<(usize, SocketAddr)>> {
    nonblocking(|| hook.udp_recv_from(session, socket, buf))
}

/// [`send_datagram`] for an association socket, through the hook
pub fn send_datagram_via(
    hook: &mut dyn ServerHook,
    session: SessionId,
    socket: &UdpSocket,
    data: &[u8],
    dest: SocketAddr,
) -> io::Result<bool> {
    Ok(nonblocking(|| hook.udp_send_to(session, socket, data, dest))?.is_some())
}

/// Which end of a session a stream belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The accepted client connection
    Client,
    /// The outbound CONNECT stream
    Remote,
}

/// Stream I/O routed through the hook's send/recv methods
struct Hooked<'a> {
    stream: &'a mut TcpStream,
    hook: &'a mut dyn ServerHook,
    session: SessionId,
    side: Side,
}

impl Read for Hooked<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.side {
            Side::Client => self.hook.client_recv(self.session, self.stream, buf),
            Side::Remote => self.hook.remote_recv(self.session, self.stream, buf),
        }
    }
}

impl Write for Hooked<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match self.side {
            Side::Client => self.hook.client_send(self.session, self.stream, data),
            Side::Remote => self.hook.remote_send(self.session, self.stream, data),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

/// A registered TCP stream with its outbound schedule
#[derive(Debug)]
pub struct StreamEnd {
    stream: TcpStream,
    outbound: ScheduledWrite,
    interest: Interest,
    session: SessionId,
    side: Side,
}

impl StreamEnd {
    /// Wrap a stream; `interest` is used on registration
    pub fn new(stream: TcpStream, interest: Interest, session: SessionId, side: Side) -> Self {
        StreamEnd {
            stream,
            outbound: ScheduledWrite::new(),
            interest,
            session,
            side,
        }
    }

    fn hooked<'a>(
        &'a mut self,
        hook: &'a mut dyn ServerHook,
    ) -> (Hooked<'a>, &'a mut ScheduledWrite) {
        let io = Hooked {
            stream: &mut self.stream,
            hook,
            session: self.session,
            side: self.side,
        };
        (io, &mut self.outbound)
    }

    /// The underlying stream
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Register with the poller
    pub fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        registry.register(&mut self.stream, token, self.interest)
    }

    /// Read available bytes
    pub fn recv(&mut self, hook: &mut dyn ServerHook, buf: &mut [u8]) -> io::Result<IoStatus> {
        let (mut io, _) = self.hooked(hook);
        recv_some(&mut io, buf)
    }

    /// Send bytes, scheduling any unsent tail
    pub fn send(&mut self, hook: &mut dyn ServerHook, data: &[u8]) -> io::Result<Flush> {
        let (mut io, outbound) = self.hooked(hook);
        outbound.send(&mut io, data)
    }

    /// Write scheduled bytes
    pub fn flush(&mut self, hook: &mut dyn ServerHook) -> io::Result<Flush> {
        let (mut io, outbound) = self.hooked(hook);
        outbound.flush(&mut io)
    }

    /// Schedule bytes for the next flush without writing
    pub fn queue(&mut self, data: &[u8]) {
        self.outbound.push(data);
    }

    /// Check if bytes are scheduled
    pub fn has_pending(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Switch interest, re-registering only on change
    pub fn set_interest(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        if self.interest != interest {
            registry.reregister(&mut self.stream, token, interest)?;
            self.interest = interest;
        }
        Ok(())
    }

    /// Match interest to the schedule: write while pending, read otherwise
    pub fn settle(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        let interest = stream_interest(self.has_pending());
        self.set_interest(registry, token, interest)
    }

    /// Like [`settle`](Self::settle) but always re-registers
    ///
    /// Readiness is edge-triggered; re-registering makes the poller report
    /// data that arrived while this end was not being read.
    pub fn resume(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        let interest = stream_interest(self.has_pending());
        registry.reregister(&mut self.stream, token, interest)?;
        self.interest = interest;
        Ok(())
    }

    /// Deregister, then shut down both directions
    pub fn close(&mut self, registry: &Registry) {
        if let Err(e) = registry.deregister(&mut self.stream) {
            trace!("Deregister failed: {}", e);
        }
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// The accepted client connection
#[derive(Debug)]
pub struct ClientSocket {
    end: StreamEnd,
    peer: SocketAddr,
    local: SocketAddr,
}

impl ClientSocket {
    /// Wrap an accepted stream and apply client socket options
    pub fn new(
        session: SessionId,
        stream: TcpStream,
        peer: SocketAddr,
        options: &TcpOptions,
    ) -> io::Result<Self> {
        options.apply(SockRef::from(&stream))?;
        let local = stream.local_addr()?;
        Ok(ClientSocket {
            end: StreamEnd::new(stream, Interest::READABLE, session, Side::Client),
            peer,
            local,
        })
    }

    /// Client's address
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Local address the client connected to
    pub fn local(&self) -> SocketAddr {
        self.local
    }

    /// The stream end
    pub fn end(&mut self) -> &mut StreamEnd {
        &mut self.end
    }

    /// Send bytes that end the session, ignoring anything the socket refuses
    pub fn send_last(&mut self, hook: &mut dyn ServerHook, data: &[u8]) {
        if let Err(e) = self.end.send(hook, data) {
            debug!("Final write to {} failed: {}", self.peer, e);
        }
    }
}

/// Outbound TCP stream of a CONNECT, including its fallback state
#[derive(Debug)]
pub struct RemoteStream {
    session: SessionId,
    connector: RemoteConnector,
    end: Option<StreamEnd>,
    early: ScheduledWrite,
}

impl RemoteStream {
    /// Create a stream that will try `candidates` in order
    pub fn new(session: SessionId, candidates: Vec<SocketAddr>) -> Self {
        RemoteStream {
            session,
            connector: RemoteConnector::new(candidates),
            end: None,
            early: ScheduledWrite::new(),
        }
    }

    /// Fallback state
    pub fn connector(&mut self) -> &mut RemoteConnector {
        &mut self.connector
    }

    /// The stream end of the current attempt or connection
    pub fn end(&mut self) -> Option<&mut StreamEnd> {
        self.end.as_mut()
    }

    /// Hold client bytes until the connection is up
    pub fn queue_early(&mut self, data: &[u8]) {
        self.early.push(data);
    }

    #[cfg(test)]
    pub(crate) fn queued_early(&self) -> usize {
        self.early.len()
    }

    /// Start a non-blocking connect to `addr`, replacing any previous attempt
    pub fn connect(
        &mut self,
        addr: SocketAddr,
        options: &TcpOptions,
        registry: &Registry,
        token: Token,
    ) -> io::Result<()> {
        if let Some(mut previous) = self.end.take() {
            previous.close(registry);
        }

        let stream = TcpStream::connect(addr)?;
        options.apply(SockRef::from(&stream))?;

        let mut end = StreamEnd::new(stream, Interest::WRITABLE, self.session, Side::Remote);
        if let Err(e) = end.register(registry, token) {
            end.close(registry);
            return Err(e);
        }
        self.end = Some(end);
        Ok(())
    }

    /// Check whether the current attempt has completed
    ///
    /// `Ok(Some(peer))` when connected, `Ok(None)` while still in progress,
    /// `Err` when the attempt failed.
    pub fn poll_connected(&mut self) -> io::Result<Option<SocketAddr>> {
        let end = self
            .end
            .as_ref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;

        if let Some(err) = end.stream().take_error()? {
            return Err(err);
        }
        match end.stream().peer_addr() {
            Ok(peer) => Ok(Some(peer)),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Mark the current attempt as connected and move early bytes into the
    /// outbound schedule
    pub fn established(&mut self, peer: SocketAddr) {
        self.connector.mark_connected(peer);
        let early = self.early.take();
        if let Some(end) = self.end.as_mut() {
            if !early.is_empty() {
                end.queue(&early);
            }
        }
    }

    /// Close the current attempt or connection
    pub fn close(&mut self, registry: &Registry) {
        if let Some(mut end) = self.end.take() {
            end.close(registry);
        }
    }
}

/// Remote side of a session
#[derive(Debug)]
pub enum RemoteSocket {
    /// CONNECT: outbound TCP stream
    Stream(RemoteStream),
    /// UDP ASSOCIATE: remote-facing UDP socket
    Datagram(UdpSocket),
}

impl RemoteSocket {
    /// Deregister and close
    pub fn close(&mut self, registry: &Registry) {
        match self {
            RemoteSocket::Stream(stream) => stream.close(registry),
            RemoteSocket::Datagram(socket) => {
                if let Err(e) = registry.deregister(socket) {
                    trace!("Deregister failed: {}", e);
                }
            }
        }
    }

    /// Peer of an established stream
    pub fn connected_peer(&self) -> Option<SocketAddr> {
        match self {
            RemoteSocket::Stream(stream) => stream.connector.peer(),
            RemoteSocket::Datagram(_) => None,
        }
    }
}

/// Bind a UDP socket on `addr` and register it for reads
pub fn bind_datagram(addr: SocketAddr, registry: &Registry, token: Token) -> io::Result<UdpSocket> {
    let mut socket = UdpSocket::bind(addr)?;
    registry.register(&mut socket, token, Interest::READABLE)?;
    Ok(socket)
}

/// Client-facing UDP socket of an association
#[derive(Debug)]
pub struct UdpRelay {
    socket: UdpSocket,
    nat: NatTable,
}

impl UdpRelay {
    /// Bind on `local_ip` with an ephemeral port, accepting datagrams from
    /// `client_ip`
    pub fn bind(
        local_ip: IpAddr,
        client_ip: IpAddr,
        registry: &Registry,
        token: Token,
    ) -> io::Result<Self> {
        let socket = bind_datagram(SocketAddr::new(local_ip, 0), registry, token)?;
        Ok(UdpRelay {
            socket,
            nat: NatTable::new(client_ip),
        })
    }

    /// Bound address advertised to the client
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// The client-facing socket
    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    /// Socket and port map, borrowed together
    pub fn parts(&mut self) -> (&UdpSocket, &mut NatTable) {
        (&self.socket, &mut self.nat)
    }

    /// Deregister and close
    pub fn close(&mut self, registry: &Registry) {
        if let Err(e) = registry.deregister(&mut self.socket) {
            trace!("Deregister failed: {}", e);
        }
    }
}

/// One outstanding A query
#[derive(Debug)]
pub struct DnsQuery {
    socket: UdpSocket,
    server: SocketAddr,
    id: u16,
    domain: DomainName,
}

impl DnsQuery {
    /// Open a socket, register it and send the query
    pub fn start(
        domain: DomainName,
        server: SocketAddr,
        id: u16,
        registry: &Registry,
        token: Token,
    ) -> SessionResult<Self> {
        let query = build_query(id, domain.as_str(), RecordType::A)
            .map_err(|e| SessionError::ResolutionFailure(format!("{}: {}", domain, e)))?;

        let socket = bind_datagram(unspecified_for(server.ip()), registry, token)?;
        let mut pending = DnsQuery {
            socket,
            server,
            id,
            domain,
        };

        match send_datagram(&pending.socket, &query, server) {
            Ok(true) => Ok(pending),
            Ok(false) => {
                pending.close(registry);
                Err(SessionError::ResolutionFailure(format!(
                    "{}: query not sent, socket busy",
                    pending.domain
                )))
            }
            Err(e) => {
                pending.close(registry);
                Err(e.into())
            }
        }
    }

    /// Name being resolved
    pub fn domain(&self) -> &DomainName {
        &self.domain
    }

    /// Read the response if it has arrived
    ///
    /// Datagrams from other sources or with another id are skipped.
    pub fn recv(&mut self, buf: &mut [u8]) -> SessionResult<Option<Vec<IpAddr>>> {
        while let Some((n, src)) = recv_datagram(&self.socket, buf)? {
            if src != self.server {
                debug!("Ignoring DNS datagram from {}", src);
                continue;
            }
            match parse_response(self.id, &buf[..n]) {
                Ok(addresses) => return Ok(Some(addresses)),
                Err(DnsError::IdMismatch { got, .. }) => {
                    debug!("Ignoring DNS response with stale id {:#06x}", got);
                }
                Err(e) => {
                    return Err(SessionError::ResolutionFailure(format!(
                        "{}: {}",
                        self.domain, e
                    )))
                }
            }
        }
        Ok(None)
    }

    /// Deregister and close
    pub fn close(&mut self, registry: &Registry) {
        if let Err(e) = registry.deregister(&mut self.socket) {
            trace!("Deregister failed: {}", e);
        }
    }
}
