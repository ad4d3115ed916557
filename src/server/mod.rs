//! SOCKS5 server event loop
//!
//! One thread owns the listener, every session and the poll registry.
//! Each poll batch is copied into a list of [`ReadyEvent`]s and dispatched in
//! order; when a session is torn down, the rest of the batch is scrubbed of
//! its events before the next one is handled.

mod connector;
mod hook;
mod nat;
mod poller;
mod roles;
mod session;
mod write;

pub use hook::{NoopHook, ServerHook};
pub use nat::{DropReason, NatTable, Outbound, Unmapped, DEFAULT_PORT_MAP_CAPACITY};
pub use poller::{
    invalidate_session, Readiness, ReadyEvent, Role, RoleKey, SessionId, Target,
    MAX_DNS_QUERIES,
};
pub use session::SessionState;
pub use write::{Flush, ScheduledWrite};

use crate::config::ServerConfig;
use crate::dns::{upstream_server, QueryIds};
use crate::helper::{DATAGRAM_BUFFER_SIZE, EVENT_CAPACITY, LISTEN_BACKLOG};
use anyhow::{Context, Result};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Waker};
use poller::{collect_batch, FIRST_SESSION_ID, LISTENER, WAKER};
use session::{Session, SessionContext};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Stops a running [`Server`] from another thread
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    /// Ask the server to stop and wake its loop
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::SeqCst);
        if let Err(e) = self.waker.wake() {
            warn!("Failed to wake server loop: {}", e);
        }
    }

    /// Check if shutdown was requested
    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// A bound SOCKS5 server
pub struct Server {
    poll: Poll,
    listener: TcpListener,
    local_addr: SocketAddr,
    config: ServerConfig,
    dns_server: Option<SocketAddr>,
    sessions: HashMap<SessionId, Session>,
    next_id: SessionId,
    query_ids: QueryIds,
    buffer: Vec<u8>,
    batch: Vec<ReadyEvent>,
    // Connections left in the backlog because descriptors ran out
    accept_stalled: bool,
    hook: Box<dyn ServerHook>,
    shutdown: ShutdownHandle,
}

impl Server {
    /// Bind the listener and prepare the poll registry
    pub fn bind(config: ServerConfig) -> Result<Self> {
        let addr = config.listen_addr();
        let mut listener =
            bind_listener(addr).with_context(|| format!("Failed to listen on {}", addr))?;
        let local_addr = listener.local_addr()?;

        let poll = Poll::new().context("Failed to create poll instance")?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Waker::new(poll.registry(), WAKER).context("Failed to create waker")?;

        let dns_server = upstream_server(config.dns, config.dns_port);
        match dns_server {
            Some(server) => debug!("Resolving domain names via {}", server),
            None => info!("Domain name resolution disabled"),
        }

        Ok(Server {
            poll,
            listener,
            local_addr,
            config,
            dns_server,
            sessions: HashMap::new(),
            next_id: FIRST_SESSION_ID,
            query_ids: QueryIds::new(),
            buffer: vec![0u8; DATAGRAM_BUFFER_SIZE],
            batch: Vec::with_capacity(EVENT_CAPACITY),
            accept_stalled: false,
            hook: Box::new(NoopHook),
            shutdown: ShutdownHandle {
                flag: Arc::new(AtomicBool::new(false)),
                waker: Arc::new(waker),
            },
        })
    }

    /// Install a lifecycle observer
    pub fn with_hook<H: ServerHook + 'static>(mut self, hook: H) -> Self {
        self.hook = Box::new(hook);
        self
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Upstream DNS server in use, if any
    pub fn dns_server(&self) -> Option<SocketAddr> {
        self.dns_server
    }

    /// Handle for stopping the loop from another thread
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// State of a live session
    pub fn session_state(&self, id: SessionId) -> Option<SessionState> {
        self.sessions.get(&id).map(Session::state)
    }

    /// Run until shutdown is requested or the listener fails
    ///
    /// Every session is closed before this returns.
    pub fn serve(&mut self) -> Result<()> {
        info!("SOCKS5 server listening on {}", self.local_addr);
        self.hook.on_server_started(self.local_addr);

        let result = self.run();
        if let Err(e) = &result {
            error!("Server loop failed: {:#}", e);
        }

        self.shutdown_all();
        self.hook.on_server_stopped();
        info!("SOCKS5 server stopped");
        result
    }

    fn run(&mut self) -> Result<()> {
        let mut events = Events::with_capacity(EVENT_CAPACITY);

        while !self.shutdown.is_shutdown() {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e).context("Poll failed");
            }

            let mut batch = std::mem::take(&mut self.batch);
            collect_batch(&events, &mut batch);
            let result = self.dispatch(&mut batch);
            self.batch = batch;
            result?;
        }

        debug!("Shutdown requested");
        Ok(())
    }

    /// Handle one batch of events in order
    fn dispatch(&mut self, batch: &mut [ReadyEvent]) -> Result<()> {
        let live = self.sessions.len();
        for i in 0..batch.len() {
            let event = batch[i];
            match event.target {
                Target::Listener => self.accept()?,
                Target::Waker | Target::Closed => {}
                Target::Role(key) => {
                    if !self.process(key, event.readiness) {
                        self.teardown(key.session);
                        let dropped = invalidate_session(&mut batch[i + 1..], key.session);
                        if dropped > 0 {
                            trace!(session = key.session, "Dropped {} stale events", dropped);
                        }
                    }
                }
            }
        }

        // Descriptors were released; the listener will not fire again for
        // connections already queued
        if self.accept_stalled && self.sessions.len() < live {
            self.accept()?;
        }
        Ok(())
    }

    fn process(&mut self, key: RoleKey, readiness: Readiness) -> bool {
        // Ids are never reused, so events for unknown sessions are stale
        let session = match self.sessions.get_mut(&key.session) {
            Some(session) => session,
            None => return true,
        };

        let mut ctx = SessionContext {
            registry: self.poll.registry(),
            config: &self.config,
            dns_server: self.dns_server,
            query_ids: &mut self.query_ids,
            buffer: &mut self.buffer,
            hook: &mut *self.hook,
        };
        session.process_readiness(key.role, readiness, &mut ctx)
    }

    fn accept(&mut self) -> Result<()> {
        self.accept_stalled = false;
        loop {
            let (stream, peer) = match self.hook.client_accept(&self.listener) {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_transient_accept_error(&e) => {
                    debug!("Accept failed: {}", e);
                    continue;
                }
                Err(e) if is_resource_exhaustion(&e) => {
                    warn!(
                        "Accept paused with {} live sessions: {}",
                        self.sessions.len(),
                        e
                    );
                    self.accept_stalled = true;
                    return Ok(());
                }
                Err(e) => return Err(e).context("Accept failed"),
            };

            let id = self.next_id;
            self.next_id += 1;

            match Session::new(id, stream, peer, self.poll.registry(), &self.config) {
                Ok(session) => {
                    debug!(session = id, "Accepted client {}", peer);
                    self.sessions.insert(id, session);
                    self.hook.on_client_accepted(id, peer);
                }
                Err(e) => warn!("Failed to set up session for {}: {}", peer, e),
            }
        }
    }

    fn teardown(&mut self, id: SessionId) {
        if let Some(mut session) = self.sessions.remove(&id) {
            session.close(self.poll.registry(), &mut *self.hook);
        }
    }

    fn shutdown_all(&mut self) {
        let registry = self.poll.registry();
        for (_, mut session) in self.sessions.drain() {
            session.close(registry, &mut *self.hook);
        }
        if let Err(e) = registry.deregister(&mut self.listener) {
            trace!("Deregister listener failed: {}", e);
        }
    }
}

fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(TcpListener::from_std(socket.into()))
}

fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
    )
}

/// Out of descriptors or buffers; the listener itself is still fine
fn is_resource_exhaustion(e: &io::Error) -> bool {
    if e.kind() == io::ErrorKind::OutOfMemory {
        return true;
    }
    #[cfg(unix)]
    {
        matches!(
            e.raw_os_error(),
            Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM)
        )
    }
    #[cfg(not(unix))]
    {
        false
    }
}
