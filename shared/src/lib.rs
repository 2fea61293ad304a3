//! # Shared Protocol Library
//!
//! Everything both endpoints of the Gamespy-SDK wire protocol need: the
//! 128-bit integer arithmetic behind the key exchange, the challenge-response
//! routine, the session key ladder, the block cipher used for application
//! packets, the CRC32 trailer, the bitstream codec, and the packet formats
//! themselves.
//!
//! The primitives in here are reproduced bit-for-bit from the protocol as it
//! exists on the wire so that unmodified game clients can interoperate with
//! the server. None of them should be mistaken for real cryptography: key
//! sizes, random number generation and the cipher construction are all fixed
//! by the protocol and are far below any modern security bar.
//!
//! ## Module Overview
//!
//! - [`bigint`]: fixed-width 128-bit big-endian integers with the exact
//!   truncation and conditional-subtract semantics the key ladder needs.
//! - [`challenge`]: the `gssdkcr` challenge-response routine.
//! - [`keys`]: modular-exponentiation key ladder producing per-session
//!   public and shared keys.
//! - [`cipher`]: the 32-round block cipher and its buffer-level wrapper,
//!   including the overlapping tail block for odd-length buffers.
//! - [`crc`]: CRC32 packet trailer (no final XOR).
//! - [`bitstream`]: LSB-first bit packing used by application payloads.
//! - [`packet`]: on-wire packet layouts, read and written through explicit
//!   byte offsets rather than packed structs.

pub mod bigint;
pub mod bitstream;
pub mod challenge;
pub mod cipher;
pub mod crc;
pub mod keys;
pub mod packet;

pub use challenge::gssdkcr;
pub use keys::SessionKeys;
pub use packet::{Packet, PacketError, CLIENT_VERSION};
