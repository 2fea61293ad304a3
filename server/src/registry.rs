//! Client session management for the game server
//!
//! This module owns the server-side view of connected clients:
//! - Session lifecycle (accept, disconnect, shutdown teardown)
//! - Per-session packet counters and key material
//! - Capacity enforcement for the fixed-size client fleet
//!
//! Sessions are keyed by remote endpoint and stored in a bounded vector;
//! with at most sixteen clients a linear scan beats any map.

use log::info;
use shared::keys::SessionKeys;
use std::net::SocketAddr;
use std::time::Instant;

/// Default cap on concurrent clients.
pub const DEFAULT_MAX_CLIENTS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Established,
    Closed,
}

/// Returned by [`ClientRegistry::insert`] when every slot is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryFull;

/// A connected client and its negotiated state
///
/// Counters start at `in = 2, out = 1` the moment a session is accepted:
/// the handshake itself accounts for the first two round-trips, so the
/// first post-handshake exchange continues from there.
#[derive(Debug)]
pub struct ClientSession {
    /// Remote endpoint used to route responses
    pub addr: SocketAddr,
    /// Packets received from this client
    pub packet_count: u16,
    /// Packets sent to this client
    pub server_packet_count: u16,
    /// Session key material derived during the handshake
    pub keys: SessionKeys,
    pub state: SessionState,
    /// When the handshake completed
    pub connected_at: Instant,
}

impl ClientSession {
    /// Accepts a client, deriving the full key set from its public key.
    pub fn new(addr: SocketAddr, peer_public: &[u8; 16], key_seed: u32) -> Self {
        Self {
            addr,
            packet_count: 2,
            server_packet_count: 1,
            keys: SessionKeys::derive(peer_public, key_seed),
            state: SessionState::Established,
            connected_at: Instant::now(),
        }
    }
}

/// Bounded table of active sessions, keyed by remote endpoint
///
/// The registry owns every [`ClientSession`]; nothing outlives it. Lookups
/// scan linearly, which is adequate for the sixteen-client fleet this
/// server is sized for.
pub struct ClientRegistry {
    sessions: Vec<ClientSession>,
    max_clients: usize,
}

impl ClientRegistry {
    pub fn new(max_clients: usize) -> Self {
        Self {
            sessions: Vec::with_capacity(max_clients),
            max_clients,
        }
    }

    /// Accepts a new session for `addr`, or reports the server full.
    pub fn insert(
        &mut self,
        addr: SocketAddr,
        peer_public: &[u8; 16],
        key_seed: u32,
    ) -> Result<&mut ClientSession, RegistryFull> {
        if self.sessions.len() >= self.max_clients {
            return Err(RegistryFull);
        }
        info!("Client connected from {}", addr);
        self.sessions.push(ClientSession::new(addr, peer_public, key_seed));
        let last = self.sessions.len() - 1;
        Ok(&mut self.sessions[last])
    }

    pub fn find(&mut self, addr: SocketAddr) -> Option<&mut ClientSession> {
        self.sessions.iter_mut().find(|session| session.addr == addr)
    }

    pub fn contains(&self, addr: SocketAddr) -> bool {
        self.sessions.iter().any(|session| session.addr == addr)
    }

    /// Removes the session matching `addr`. Returns false when no session
    /// matched, which callers log as an unknown-client event.
    pub fn remove(&mut self, addr: SocketAddr) -> bool {
        let before = self.sessions.len();
        self.sessions.retain(|session| session.addr != addr);
        if self.sessions.len() < before {
            info!("Client {} disconnected", addr);
            true
        } else {
            false
        }
    }

    /// Takes every session out of the registry; used at shutdown to
    /// broadcast disconnection signals.
    pub fn drain(&mut self) -> Vec<ClientSession> {
        self.sessions.drain(..).collect()
    }

    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.sessions.iter().map(|session| session.addr).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.sessions.len() >= self.max_clients
    }
}
