//! Test utilities for Socksmux
//!
//! Spawns servers on loopback and speaks the client side of SOCKS5 over
//! blocking std sockets.

#![allow(dead_code)]

use socksmux::config::{DnsMode, ServerConfig};
use socksmux::server::SessionId;
use socksmux::socks::{
    decode_reply, encode_command, encode_credentials, AddressRecord, Command,
};
use socksmux::{Server, ServerHook, ShutdownHandle};
use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Read/write timeout for test sockets
pub const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Test configuration builder
pub struct TestConfigBuilder {
    username: String,
    password: String,
    dns: DnsMode,
    dns_port: u16,
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        TestConfigBuilder {
            username: String::new(),
            password: String::new(),
            dns: DnsMode::Disabled,
            dns_port: 53,
        }
    }
}

impl TestConfigBuilder {
    /// Create a new test config builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Require username/password authentication
    pub fn credentials(mut self, username: &str, password: &str) -> Self {
        self.username = username.to_string();
        self.password = password.to_string();
        self
    }

    /// Resolve domain names through `server`
    pub fn dns_server(mut self, server: SocketAddr) -> Self {
        self.dns = DnsMode::Server(server.ip());
        self.dns_port = server.port();
        self
    }

    /// Build the configuration, listening on an ephemeral loopback port
    pub fn build(self) -> ServerConfig {
        ServerConfig {
            listen_ip: "127.0.0.1".parse().unwrap(),
            listen_port: 0,
            username: self.username,
            password: self.password,
            dns: self.dns,
            dns_port: self.dns_port,
            ..Default::default()
        }
    }
}

/// Lifecycle events seen by [`RecordingHook`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookEvent {
    Started(SocketAddr),
    Stopped,
    ClientAccepted(SessionId),
    ClientDisconnected(SessionId),
    RemoteConnected(SessionId, SocketAddr),
    RemoteDisconnected(SessionId, SocketAddr),
}

/// Hook that appends every event to a shared list
#[derive(Debug, Clone, Default)]
pub struct RecordingHook {
    pub events: Arc<Mutex<Vec<HookEvent>>>,
}

impl RecordingHook {
    /// Snapshot of the recorded events
    pub fn events(&self) -> Vec<HookEvent> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: HookEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl ServerHook for RecordingHook {
    fn on_server_started(&mut self, local_addr: SocketAddr) {
        self.push(HookEvent::Started(local_addr));
    }

    fn on_server_stopped(&mut self) {
        self.push(HookEvent::Stopped);
    }

    fn on_client_accepted(&mut self, session: SessionId, _peer: SocketAddr) {
        self.push(HookEvent::ClientAccepted(session));
    }

    fn on_client_disconnected(&mut self, session: SessionId, _peer: SocketAddr) {
        self.push(HookEvent::ClientDisconnected(session));
    }

    fn on_remote_connected(&mut self, session: SessionId, remote: SocketAddr) {
        self.push(HookEvent::RemoteConnected(session, remote));
    }

    fn on_remote_disconnected(&mut self, session: SessionId, remote: SocketAddr) {
        self.push(HookEvent::RemoteDisconnected(session, remote));
    }
}

/// A server running on its own thread; stopped on drop
pub struct TestServer {
    pub addr: SocketAddr,
    handle: ShutdownHandle,
    thread: Option<JoinHandle<anyhow::Result<()>>>,
}

impl TestServer {
    /// Start a server with `config`
    pub fn start(config: ServerConfig) -> Self {
        Self::start_with_hook(config, socksmux::NoopHook)
    }

    /// Start a server with `config` and a lifecycle hook
    pub fn start_with_hook<H: ServerHook + 'static>(config: ServerConfig, hook: H) -> Self {
        let mut server = Server::bind(config).unwrap().with_hook(hook);
        let addr = server.local_addr();
        let handle = server.shutdown_handle();
        let thread = thread::spawn(move || server.serve());

        TestServer {
            addr,
            handle,
            thread: Some(thread),
        }
    }

    /// Stop the server and wait for its loop to exit
    pub fn stop(&mut self) {
        self.handle.shutdown();
        if let Some(thread) = self.thread.take() {
            thread.join().unwrap().unwrap();
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Connect a blocking client with timeouts set
pub fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(IO_TIMEOUT)).unwrap();
    stream.set_write_timeout(Some(IO_TIMEOUT)).unwrap();
    stream
}

/// Send a method greeting and return the selected method byte
pub fn greet(stream: &mut TcpStream, methods: &[u8]) -> u8 {
    let mut greeting = vec![5, methods.len() as u8];
    greeting.extend_from_slice(methods);
    stream.write_all(&greeting).unwrap();

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(reply[0], 5);
    reply[1]
}

/// Run the username/password sub-negotiation and return the status byte
pub fn authenticate(stream: &mut TcpStream, username: &str, password: &str) -> u8 {
    let message = encode_credentials(username.as_bytes(), password.as_bytes()).unwrap();
    stream.write_all(&message).unwrap();

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(reply[0], 1);
    reply[1]
}

/// Read one command reply: reply code and bound address
pub fn read_reply(stream: &mut TcpStream) -> (u8, AddressRecord) {
    let mut head = [0u8; 5];
    stream.read_exact(&mut head).unwrap();

    let rest = match head[3] {
        1 => 4 + 2 - 1,
        4 => 16 + 2 - 1,
        3 => head[4] as usize + 2,
        other => panic!("unexpected address type {}", other),
    };
    let mut message = head.to_vec();
    message.resize(5 + rest, 0);
    stream.read_exact(&mut message[5..]).unwrap();

    decode_reply(&message).unwrap()
}

/// Send a command request and read the reply
pub fn request(stream: &mut TcpStream, command: Command, target: &AddressRecord) -> (u8, AddressRecord) {
    stream.write_all(&encode_command(command, target)).unwrap();
    read_reply(stream)
}

/// Connect to the proxy, negotiate no-auth and CONNECT to `target`
pub fn open_tunnel(proxy: SocketAddr, target: &AddressRecord) -> (TcpStream, u8, AddressRecord) {
    let mut stream = connect(proxy);
    assert_eq!(greet(&mut stream, &[0]), 0);
    let (reply, bound) = request(&mut stream, Command::Connect, target);
    (stream, reply, bound)
}

/// Check that the peer closed the connection without sending anything more
pub fn assert_closed(stream: &mut TcpStream) {
    let mut buf = [0u8; 16];
    match stream.read(&mut buf) {
        Ok(0) => {}
        Ok(n) => panic!("expected close, got {:?}", &buf[..n]),
        // A reset also counts as closed
        Err(e) => assert!(
            !matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ),
            "timed out waiting for close"
        ),
    }
}

/// TCP echo server; each connection is echoed on its own thread
pub fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    thread::spawn(move || {
        for stream in listener.incoming() {
            let mut stream = match stream {
                Ok(stream) => stream,
                Err(_) => break,
            };
            thread::spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}

/// A loopback port with nothing listening on it
pub fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

/// UDP echo server
pub fn spawn_udp_echo() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = socket.local_addr().unwrap();

    thread::spawn(move || {
        let mut buf = [0u8; 65536];
        while let Ok((n, src)) = socket.recv_from(&mut buf) {
            let _ = socket.send_to(&buf[..n], src);
        }
    });

    addr
}

/// Stub DNS server answering every query with `answers`
pub fn spawn_dns_server(answers: Vec<IpAddr>) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = socket.local_addr().unwrap();

    thread::spawn(move || {
        let mut buf = [0u8; 512];
        while let Ok((n, src)) = socket.recv_from(&mut buf) {
            if let Ok(response) = socksmux::dns::build_response(&buf[..n], &answers, 60) {
                let _ = socket.send_to(&response, src);
            }
        }
    });

    addr
}

/// Give the server loop time to process
pub fn settle() {
    thread::sleep(Duration::from_millis(100));
}
