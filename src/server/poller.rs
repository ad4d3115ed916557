//! Readiness event plumbing
//!
//! Maps poll tokens to the socket role they belong to, copies each poll batch
//! into plain [`ReadyEvent`] values the orchestrator can edit, and neutralizes
//! events for sessions destroyed partway through a batch.

use mio::event::Event;
use mio::{Events, Interest, Token};

/// Stable session identifier; never reused within one server
pub type SessionId = usize;

/// Token of the listening socket
pub const LISTENER: Token = Token(0);

/// Token of the shutdown waker
pub const WAKER: Token = Token(1);

/// Maximum concurrent DNS queries per session
pub const MAX_DNS_QUERIES: usize = 5;

/// First session id handed out; ids below it map to server tokens
pub const FIRST_SESSION_ID: SessionId = 1;

const ROLE_BITS: usize = 3;
const ROLE_MASK: usize = (1 << ROLE_BITS) - 1;
const DNS_SLOT_BASE: usize = 3;

/// The socket roles a session can own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// The accepted client connection
    Client,
    /// The outbound TCP stream or remote-facing UDP socket
    Remote,
    /// The client-facing UDP socket of an association
    UdpRelay,
    /// One outstanding DNS query, by slot
    DnsQuery(usize),
}

impl Role {
    fn slot(self) -> usize {
        match self {
            Role::Client => 0,
            Role::Remote => 1,
            Role::UdpRelay => 2,
            Role::DnsQuery(index) => DNS_SLOT_BASE + index,
        }
    }

    fn from_slot(slot: usize) -> Option<Self> {
        match slot {
            0 => Some(Role::Client),
            1 => Some(Role::Remote),
            2 => Some(Role::UdpRelay),
            s if s >= DNS_SLOT_BASE && s < DNS_SLOT_BASE + MAX_DNS_QUERIES => {
                Some(Role::DnsQuery(s - DNS_SLOT_BASE))
            }
            _ => None,
        }
    }
}

/// A socket role of a specific session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoleKey {
    /// Owning session
    pub session: SessionId,
    /// Role within the session
    pub role: Role,
}

impl RoleKey {
    /// Create a key
    pub fn new(session: SessionId, role: Role) -> Self {
        RoleKey { session, role }
    }

    /// Poll token for this role
    pub fn token(self) -> Token {
        Token((self.session << ROLE_BITS) | self.role.slot())
    }

    /// Decode a token produced by [`RoleKey::token`]
    pub fn from_token(token: Token) -> Option<Self> {
        let session = token.0 >> ROLE_BITS;
        if session < FIRST_SESSION_ID {
            return None;
        }
        let role = Role::from_slot(token.0 & ROLE_MASK)?;
        Some(RoleKey { session, role })
    }
}

/// Readiness flags of one event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    /// Data or EOF can be read
    pub readable: bool,
    /// Bytes can be written, or a connect finished
    pub writable: bool,
    /// Both directions are closed
    pub hangup: bool,
    /// The socket has a pending error
    pub error: bool,
}

impl Readiness {
    /// Read-readiness only
    pub fn readable() -> Self {
        Readiness {
            readable: true,
            ..Default::default()
        }
    }

    /// Write-readiness only
    pub fn writable() -> Self {
        Readiness {
            writable: true,
            ..Default::default()
        }
    }

    /// Error or hang-up
    pub fn is_fatal(&self) -> bool {
        self.hangup || self.error
    }
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        Readiness {
            readable: event.is_readable(),
            writable: event.is_writable(),
            hangup: event.is_read_closed() && event.is_write_closed(),
            error: event.is_error(),
        }
    }
}

/// What an event is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// The listening socket
    Listener,
    /// The shutdown waker
    Waker,
    /// A session socket role
    Role(RoleKey),
    /// Neutralized; dispatch skips it
    Closed,
}

/// One entry of a dispatch batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyEvent {
    /// Addressee
    pub target: Target,
    /// Flags
    pub readiness: Readiness,
}

impl ReadyEvent {
    /// An event for a session role
    pub fn role(key: RoleKey, readiness: Readiness) -> Self {
        ReadyEvent {
            target: Target::Role(key),
            readiness,
        }
    }

    /// The no-op marker left behind by invalidation
    pub fn closed() -> Self {
        ReadyEvent {
            target: Target::Closed,
            readiness: Readiness::default(),
        }
    }

    /// Translate a poll event
    pub fn from_event(event: &Event) -> Self {
        let target = match event.token() {
            LISTENER => Target::Listener,
            WAKER => Target::Waker,
            token => RoleKey::from_token(token)
                .map(Target::Role)
                .unwrap_or(Target::Closed),
        };
        ReadyEvent {
            target,
            readiness: Readiness::from(event),
        }
    }
}

/// Copy a poll batch into `batch`, replacing its previous contents
pub fn collect_batch(events: &Events, batch: &mut Vec<ReadyEvent>) {
    batch.clear();
    batch.extend(events.iter().map(ReadyEvent::from_event));
}

/// Neutralize every event in `pending` that targets `session`
///
/// Returns how many events were replaced.
pub fn invalidate_session(pending: &mut [ReadyEvent], session: SessionId) -> usize {
    let mut count = 0;
    for event in pending.iter_mut() {
        if let Target::Role(key) = event.target {
            if key.session == session {
                *event = ReadyEvent::closed();
                count += 1;
            }
        }
    }
    count
}

/// Interest for a stream role: write while bytes are scheduled, read otherwise
pub fn stream_interest(write_pending: bool) -> Interest {
    if write_pending {
        Interest::WRITABLE
    } else {
        Interest::READABLE
    }
}
