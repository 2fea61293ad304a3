//! On-wire packet formats.
//!
//! Every datagram starts with the two `0xFE` magic bytes and a type byte.
//! Handshake and encrypted frames follow with two big-endian packet
//! counters; version and refusal-reason words are little-endian. Layouts
//! are read and written through explicit byte offsets so there is no
//! dependence on struct packing, and the 11-bit length field of encrypted
//! frames goes through the bitstream codec.

use std::fmt;

use thiserror::Error;

use crate::bitstream::{Bitstream, BitstreamError};
use crate::challenge::CHALLENGE_LEN;
use crate::{cipher, crc};

/// Magic bytes opening every valid datagram. Compared byte-wise; the two
/// bytes are equal so endianness can never hide a mistake here.
pub const GSSDK_MAGIC: [u8; 2] = [0xFE, 0xFE];

/// Client build this server accepts.
pub const CLIENT_VERSION: u32 = 0x0009_6A27;

/// Largest datagram the read path accepts. Anything longer is truncated by
/// the receive buffer and then fails structural parsing.
pub const MAX_DATAGRAM: usize = 4096;

/// Bytes of CRC32 trailer at the end of every encrypted payload.
pub const CRC_TRAILER_LEN: usize = 4;

/// Largest application payload an encrypted frame can carry: the 11-bit
/// length field counts payload plus trailer.
pub const MAX_PAYLOAD_LEN: usize = 0x7FF - CRC_TRAILER_LEN;

const HEADER_LEN: usize = 3;
const COUNTED_HEADER_LEN: usize = 7;
const KEY_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Encrypted = 0x00,
    ClientChallenge = 0x01,
    ServerChallengeResponse = 0x02,
    ClientResponse = 0x03,
    HandshakeSuccess = 0x04,
    ConnectionRefused = 0x05,
    ConnectionEstablished = 0x07,
    Disconnection = 0x68,
}

impl PacketType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Encrypted),
            0x01 => Some(Self::ClientChallenge),
            0x02 => Some(Self::ServerChallengeResponse),
            0x03 => Some(Self::ClientResponse),
            0x04 => Some(Self::HandshakeSuccess),
            0x05 => Some(Self::ConnectionRefused),
            0x07 => Some(Self::ConnectionEstablished),
            0x68 => Some(Self::Disconnection),
            _ => None,
        }
    }
}

/// Why a connection attempt was turned down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RefuseReason {
    IncompatibleProtocol = 3,
    OlderClientVersion = 4,
    NewerClientVersion = 5,
    ServerFull = 6,
}

impl RefuseReason {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            3 => Some(Self::IncompatibleProtocol),
            4 => Some(Self::OlderClientVersion),
            5 => Some(Self::NewerClientVersion),
            6 => Some(Self::ServerFull),
            _ => None,
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for RefuseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::IncompatibleProtocol => "incompatible network protocol version",
            Self::OlderClientVersion => "client version is older than server version",
            Self::NewerClientVersion => "server version is older than client version",
            Self::ServerFull => "server is full",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("datagram too short ({0} bytes)")]
    TooShort(usize),

    #[error("bad gssdk header")]
    BadMagic,

    #[error("unknown packet type 0x{0:02X}")]
    UnknownType(u8),

    #[error("encrypted frame claims {length} bytes but only {available} follow")]
    FrameTruncated { length: usize, available: usize },

    #[error("payload of {0} bytes does not fit an encrypted frame")]
    PayloadTooLarge(usize),

    #[error("payload checksum mismatch")]
    ChecksumMismatch,

    #[error(transparent)]
    Bitstream(#[from] BitstreamError),
}

/// The two packet counters carried after the header, big-endian on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketCounts {
    pub server: u16,
    pub client: u16,
}

impl PacketCounts {
    pub fn new(server: u16, client: u16) -> Self {
        Self { server, client }
    }
}

/// A decoded datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    ClientChallenge {
        counts: PacketCounts,
        challenge: [u8; CHALLENGE_LEN],
    },
    ServerChallengeResponse {
        counts: PacketCounts,
        challenge_response: [u8; CHALLENGE_LEN],
        challenge: [u8; CHALLENGE_LEN],
    },
    ClientResponse {
        counts: PacketCounts,
        challenge_response: [u8; CHALLENGE_LEN],
        public_key: [u8; KEY_LEN],
        version: u32,
    },
    HandshakeSuccess {
        counts: PacketCounts,
        public_key: [u8; KEY_LEN],
    },
    ConnectionRefused {
        counts: PacketCounts,
        reason: u32,
    },
    ConnectionEstablished {
        counts: PacketCounts,
    },
    /// Body bytes still encrypted; see [`open_payload`].
    Encrypted {
        counts: PacketCounts,
        body: Vec<u8>,
    },
    Disconnection,
}

impl Packet {
    /// Parses a raw datagram. Structural failures (short, bad magic,
    /// unknown type, truncated frame) come back as errors; the dispatch
    /// policy for all of them is to drop the datagram.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        need(buf, HEADER_LEN)?;
        if buf[..2] != GSSDK_MAGIC {
            return Err(PacketError::BadMagic);
        }
        let ty = PacketType::from_byte(buf[2]).ok_or(PacketError::UnknownType(buf[2]))?;

        // Disconnection is a bare header in either direction.
        if ty == PacketType::Disconnection {
            return Ok(Self::Disconnection);
        }

        need(buf, COUNTED_HEADER_LEN)?;
        let counts = PacketCounts {
            server: u16::from_be_bytes([buf[3], buf[4]]),
            client: u16::from_be_bytes([buf[5], buf[6]]),
        };

        match ty {
            PacketType::ClientChallenge => {
                need(buf, COUNTED_HEADER_LEN + CHALLENGE_LEN)?;
                Ok(Self::ClientChallenge {
                    counts,
                    challenge: copy_32(&buf[7..39]),
                })
            }
            PacketType::ServerChallengeResponse => {
                need(buf, COUNTED_HEADER_LEN + 2 * CHALLENGE_LEN)?;
                Ok(Self::ServerChallengeResponse {
                    counts,
                    challenge_response: copy_32(&buf[7..39]),
                    challenge: copy_32(&buf[39..71]),
                })
            }
            PacketType::ClientResponse => {
                need(buf, COUNTED_HEADER_LEN + CHALLENGE_LEN + KEY_LEN + 4)?;
                Ok(Self::ClientResponse {
                    counts,
                    challenge_response: copy_32(&buf[7..39]),
                    public_key: copy_16(&buf[39..55]),
                    version: u32::from_le_bytes([buf[55], buf[56], buf[57], buf[58]]),
                })
            }
            PacketType::HandshakeSuccess => {
                need(buf, COUNTED_HEADER_LEN + KEY_LEN)?;
                Ok(Self::HandshakeSuccess {
                    counts,
                    public_key: copy_16(&buf[7..23]),
                })
            }
            PacketType::ConnectionRefused => {
                need(buf, COUNTED_HEADER_LEN + 4)?;
                Ok(Self::ConnectionRefused {
                    counts,
                    reason: u32::from_le_bytes([buf[7], buf[8], buf[9], buf[10]]),
                })
            }
            PacketType::ConnectionEstablished => Ok(Self::ConnectionEstablished { counts }),
            PacketType::Encrypted => {
                need(buf, COUNTED_HEADER_LEN + 2)?;
                let length_bits = Bitstream::from_bytes(buf[7..9].to_vec());
                let length = length_bits.read(0, 11)? as usize;
                let available = buf.len() - 9;
                if length > available {
                    return Err(PacketError::FrameTruncated { length, available });
                }
                Ok(Self::Encrypted {
                    counts,
                    body: buf[9..9 + length].to_vec(),
                })
            }
            PacketType::Disconnection => unreachable!("handled above"),
        }
    }
}

fn need(buf: &[u8], len: usize) -> Result<(), PacketError> {
    if buf.len() < len {
        Err(PacketError::TooShort(buf.len()))
    } else {
        Ok(())
    }
}

fn copy_32(slice: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(slice);
    out
}

fn copy_16(slice: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(slice);
    out
}

fn counted_header(ty: PacketType, counts: PacketCounts, capacity: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(capacity);
    buf.extend_from_slice(&GSSDK_MAGIC);
    buf.push(ty as u8);
    buf.extend_from_slice(&counts.server.to_be_bytes());
    buf.extend_from_slice(&counts.client.to_be_bytes());
    buf
}

pub fn encode_client_challenge(counts: PacketCounts, challenge: &[u8; CHALLENGE_LEN]) -> Vec<u8> {
    let mut buf = counted_header(PacketType::ClientChallenge, counts, 39);
    buf.extend_from_slice(challenge);
    buf
}

pub fn encode_server_challenge_response(
    counts: PacketCounts,
    challenge_response: &[u8; CHALLENGE_LEN],
    challenge: &[u8; CHALLENGE_LEN],
) -> Vec<u8> {
    let mut buf = counted_header(PacketType::ServerChallengeResponse, counts, 71);
    buf.extend_from_slice(challenge_response);
    buf.extend_from_slice(challenge);
    buf
}

pub fn encode_client_response(
    counts: PacketCounts,
    challenge_response: &[u8; CHALLENGE_LEN],
    public_key: &[u8; KEY_LEN],
    version: u32,
) -> Vec<u8> {
    let mut buf = counted_header(PacketType::ClientResponse, counts, 59);
    buf.extend_from_slice(challenge_response);
    buf.extend_from_slice(public_key);
    buf.extend_from_slice(&version.to_le_bytes());
    buf
}

pub fn encode_handshake_success(counts: PacketCounts, public_key: &[u8; KEY_LEN]) -> Vec<u8> {
    let mut buf = counted_header(PacketType::HandshakeSuccess, counts, 23);
    buf.extend_from_slice(public_key);
    buf
}

pub fn encode_connection_refused(counts: PacketCounts, reason: RefuseReason) -> Vec<u8> {
    let mut buf = counted_header(PacketType::ConnectionRefused, counts, 11);
    buf.extend_from_slice(&reason.as_u32().to_le_bytes());
    buf
}

pub fn encode_connection_established(counts: PacketCounts) -> Vec<u8> {
    counted_header(PacketType::ConnectionEstablished, counts, 7)
}

pub fn encode_disconnection() -> Vec<u8> {
    vec![GSSDK_MAGIC[0], GSSDK_MAGIC[1], PacketType::Disconnection as u8]
}

/// Builds an encrypted frame around an application payload.
///
/// The plaintext body is the payload followed by its CRC32 trailer; the
/// whole body is encrypted as one span and its length (trailer included)
/// goes into the clear 11-bit field.
pub fn seal_payload(
    counts: PacketCounts,
    data: &[u8],
    key: &[u8; 16],
) -> Result<Vec<u8>, PacketError> {
    if data.len() > MAX_PAYLOAD_LEN {
        return Err(PacketError::PayloadTooLarge(data.len()));
    }
    let body_len = data.len() + CRC_TRAILER_LEN;

    let mut body = Vec::with_capacity(body_len);
    body.extend_from_slice(data);
    body.extend_from_slice(&crc::crc32(data).to_le_bytes());
    cipher::encrypt(&mut body, key);

    let mut length_bits = Bitstream::new();
    length_bits.write(body_len as u32, 11)?;
    length_bits.write(0, 1)?;

    let mut buf = counted_header(PacketType::Encrypted, counts, 9 + body_len);
    buf.extend_from_slice(length_bits.data());
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Decrypts an encrypted frame body and verifies its CRC32 trailer,
/// returning the application payload.
pub fn open_payload(body: &[u8], key: &[u8; 16]) -> Result<Vec<u8>, PacketError> {
    if body.len() < CRC_TRAILER_LEN {
        return Err(PacketError::TooShort(body.len()));
    }

    let mut plain = body.to_vec();
    cipher::decrypt(&mut plain, key);

    let data_len = plain.len() - CRC_TRAILER_LEN;
    let trailer = u32::from_le_bytes([
        plain[data_len],
        plain[data_len + 1],
        plain[data_len + 2],
        plain[data_len + 3],
    ]);
    if crc::crc32(&plain[..data_len]) != trailer {
        return Err(PacketError::ChecksumMismatch);
    }
    plain.truncate(data_len);
    Ok(plain)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 16] = *b"0123456789ABCDEF";

    #[test]
    fn test_decode_rejects_short_and_bad_magic() {
        assert_eq!(Packet::decode(&[]), Err(PacketError::TooShort(0)));
        assert_eq!(Packet::decode(&[0xFE]), Err(PacketError::TooShort(1)));
        assert_eq!(
            Packet::decode(&[0xFE, 0xFF, 0x01]),
            Err(PacketError::BadMagic)
        );
        assert_eq!(
            Packet::decode(&[0xFE, 0xFE, 0x42]),
            Err(PacketError::UnknownType(0x42))
        );
    }

    #[test]
    fn test_client_challenge_roundtrip() {
        let challenge = *b")nTu4y&t,Cr{P5j{6k<]^E@-ToF#Kg>m";
        let buf = encode_client_challenge(PacketCounts::new(0, 0), &challenge);
        assert_eq!(buf.len(), 39);
        match Packet::decode(&buf).unwrap() {
            Packet::ClientChallenge { counts, challenge: c } => {
                assert_eq!(counts, PacketCounts::new(0, 0));
                assert_eq!(c, challenge);
            }
            other => panic!("unexpected packet {other:?}"),
        }
    }

    #[test]
    fn test_counts_are_big_endian_on_wire() {
        let buf = encode_handshake_success(PacketCounts::new(1, 2), &[0u8; 16]);
        assert_eq!(&buf[3..7], &[0x00, 0x01, 0x00, 0x02]);
    }

    #[test]
    fn test_version_and_reason_are_little_endian() {
        let buf = encode_client_response(
            PacketCounts::default(),
            &[b'x'; 32],
            &[0u8; 16],
            CLIENT_VERSION,
        );
        assert_eq!(&buf[55..59], &[0x27, 0x6A, 0x09, 0x00]);

        let refused =
            encode_connection_refused(PacketCounts::new(1, 2), RefuseReason::ServerFull);
        assert_eq!(&refused[7..11], &[0x06, 0x00, 0x00, 0x00]);
        match Packet::decode(&refused).unwrap() {
            Packet::ConnectionRefused { reason, .. } => {
                assert_eq!(RefuseReason::from_u32(reason), Some(RefuseReason::ServerFull));
            }
            other => panic!("unexpected packet {other:?}"),
        }
    }

    #[test]
    fn test_server_challenge_response_roundtrip() {
        let response = [b'r'; 32];
        let challenge = [b'c'; 32];
        let buf =
            encode_server_challenge_response(PacketCounts::new(0, 1), &response, &challenge);
        assert_eq!(buf.len(), 71);
        match Packet::decode(&buf).unwrap() {
            Packet::ServerChallengeResponse {
                counts,
                challenge_response,
                challenge: c,
            } => {
                assert_eq!(counts, PacketCounts::new(0, 1));
                assert_eq!(challenge_response, response);
                assert_eq!(c, challenge);
            }
            other => panic!("unexpected packet {other:?}"),
        }
    }

    #[test]
    fn test_connection_established_roundtrip() {
        let buf = encode_connection_established(PacketCounts::new(2, 3));
        assert_eq!(buf.len(), 7);
        match Packet::decode(&buf).unwrap() {
            Packet::ConnectionEstablished { counts } => {
                assert_eq!(counts, PacketCounts::new(2, 3));
            }
            other => panic!("unexpected packet {other:?}"),
        }
    }

    #[test]
    fn test_disconnection_is_a_bare_header() {
        let buf = encode_disconnection();
        assert_eq!(buf, vec![0xFE, 0xFE, 0x68]);
        assert_eq!(Packet::decode(&buf).unwrap(), Packet::Disconnection);
    }

    #[test]
    fn test_truncated_handshake_packets_fail() {
        let buf = encode_client_challenge(PacketCounts::default(), &[b'a'; 32]);
        assert!(matches!(
            Packet::decode(&buf[..20]),
            Err(PacketError::TooShort(20))
        ));
    }

    #[test]
    fn test_sealed_payload_roundtrip() {
        let data = b"fire in the hole";
        let buf = seal_payload(PacketCounts::new(3, 4), data, &KEY).unwrap();

        match Packet::decode(&buf).unwrap() {
            Packet::Encrypted { counts, body } => {
                assert_eq!(counts, PacketCounts::new(3, 4));
                assert_eq!(body.len(), data.len() + CRC_TRAILER_LEN);
                assert_ne!(&body[..data.len()], data.as_slice());
                assert_eq!(open_payload(&body, &KEY).unwrap(), data.to_vec());
            }
            other => panic!("unexpected packet {other:?}"),
        }
    }

    #[test]
    fn test_tampered_payload_fails_checksum() {
        let buf = seal_payload(PacketCounts::default(), b"payload bytes", &KEY).unwrap();
        let body = match Packet::decode(&buf).unwrap() {
            Packet::Encrypted { body, .. } => body,
            other => panic!("unexpected packet {other:?}"),
        };

        let mut tampered = body.clone();
        tampered[0] ^= 0x01;
        assert_eq!(
            open_payload(&tampered, &KEY),
            Err(PacketError::ChecksumMismatch)
        );

        let mut wrong_key = KEY;
        wrong_key[0] ^= 0x01;
        assert_eq!(
            open_payload(&body, &wrong_key),
            Err(PacketError::ChecksumMismatch)
        );
    }

    #[test]
    fn test_frame_length_must_fit_datagram() {
        let mut buf = seal_payload(PacketCounts::default(), b"abcdefgh", &KEY).unwrap();
        buf.truncate(buf.len() - 2);
        assert!(matches!(
            Packet::decode(&buf),
            Err(PacketError::FrameTruncated { .. })
        ));
    }

    #[test]
    fn test_oversize_payload_is_refused() {
        let data = vec![0u8; MAX_PAYLOAD_LEN + 1];
        assert_eq!(
            seal_payload(PacketCounts::default(), &data, &KEY),
            Err(PacketError::PayloadTooLarge(data.len()))
        );
    }

    #[test]
    fn test_max_payload_fits() {
        let data = vec![0xA5u8; MAX_PAYLOAD_LEN];
        let buf = seal_payload(PacketCounts::default(), &data, &KEY).unwrap();
        match Packet::decode(&buf).unwrap() {
            Packet::Encrypted { body, .. } => {
                assert_eq!(open_payload(&body, &KEY).unwrap(), data);
            }
            other => panic!("unexpected packet {other:?}"),
        }
    }
}
