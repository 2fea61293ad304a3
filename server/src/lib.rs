//! # Game Server Library
//!
//! Server-side implementation of the Gamespy-SDK endpoint: the handshake
//! state machine, the bounded client registry, the tick-driven network loop
//! and the console command layer.
//!
//! ## Architecture
//!
//! The core is single-threaded cooperative by design. One loop owns the
//! UDP socket, the receive queue and the registry; nothing in the hot path
//! takes a lock. Per tick the loop polls console input, drains the socket
//! into a FIFO, and dispatches each datagram through the handshake machine,
//! which looks sessions up in the registry and hands replies back for
//! sending. The only auxiliary execution is the detached stdin reader
//! thread, which communicates through a channel polled non-blockingly.
//!
//! ## Modules
//!
//! - [`handshake`]: per-packet-type dispatch from "challenge received" to
//!   "keys ready" or "refused".
//! - [`registry`]: bounded session table keyed by remote endpoint.
//! - [`network`]: socket ownership, the 30 Hz tick loop, shutdown
//!   broadcast.
//! - [`console`]: stdin-fed command registry (`quit`, `ticks`).

pub mod console;
pub mod handshake;
pub mod network;
pub mod registry;
