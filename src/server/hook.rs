//! Lifecycle notifications and I/O interception
//!
//! A [`ServerHook`] observes the server from inside the event loop, and may
//! take over the socket calls the loop makes. Calls are made synchronously
//! on the loop thread, so implementations must return quickly.

use super::poller::SessionId;
use mio::net::{TcpListener, TcpStream, UdpSocket};
use std::io::{self, Read, Write};
use std::net::SocketAddr;

/// Observer of server and session events, and owner of socket I/O
///
/// Event methods default to no-ops. Behaviour methods default to the plain
/// socket call; an override must keep non-blocking semantics and report
/// would-block as `io::ErrorKind::WouldBlock`.
pub trait ServerHook: Send {
    /// The listener is bound and the loop is about to start
    fn on_server_started(&mut self, _local_addr: SocketAddr) {}

    /// The loop has exited and every session is closed
    fn on_server_stopped(&mut self) {}

    /// A client connection was accepted
    fn on_client_accepted(&mut self, _session: SessionId, _peer: SocketAddr) {}

    /// A session ended and its client connection was closed
    fn on_client_disconnected(&mut self, _session: SessionId, _peer: SocketAddr) {}

    /// An outbound CONNECT stream was established
    fn on_remote_connected(&mut self, _session: SessionId, _remote: SocketAddr) {}

    /// An established outbound stream was closed
    fn on_remote_disconnected(&mut self, _session: SessionId, _remote: SocketAddr) {}

    /// Accept one pending connection
    fn client_accept(&mut self, listener: &TcpListener) -> io::Result<(TcpStream, SocketAddr)> {
        listener.accept()
    }

    /// Read from a client connection
    fn client_recv(
        &mut self,
        _session: SessionId,
        stream: &mut TcpStream,
        buf: &mut [u8],
    ) -> io::Result<usize> {
        stream.read(buf)
    }

    /// Write to a client connection
    fn client_send(
        &mut self,
        _session: SessionId,
        stream: &mut TcpStream,
        data: &[u8],
    ) -> io::Result<usize> {
        stream.write(data)
    }

    /// Read from an outbound CONNECT stream
    fn remote_recv(
        &mut self,
        _session: SessionId,
        stream: &mut TcpStream,
        buf: &mut [u8],
    ) -> io::Result<usize> {
        stream.read(buf)
    }

    /// Write to an outbound CONNECT stream
    fn remote_send(
        &mut self,
        _session: SessionId,
        stream: &mut TcpStream,
        data: &[u8],
    ) -> io::Result<usize> {
        stream.write(data)
    }

    /// Receive on either socket of a UDP association
    fn udp_recv_from(
        &mut self,
        _session: SessionId,
        socket: &UdpSocket,
        buf: &mut [u8],
    ) -> io::Result<(usize, SocketAddr)> {
        socket.recv_from(buf)
    }

    /// Send on either socket of a UDP association
    fn udp_send_to(
        &mut self,
        _session: SessionId,
        socket: &UdpSocket,
        data: &[u8],
        dest: SocketAddr,
    ) -> io::Result<usize> {
        socket.send_to(data, dest)
    }
}

/// Hook that ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHook;

impl ServerHook for NoopHook {}
