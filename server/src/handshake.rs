//! Handshake state machine.
//!
//! Drives each remote endpoint from "challenge received" to "keys ready" or
//! "refused". The machine stays deliberately stateless until the client's
//! public key arrives: answering a challenge costs nothing and proves
//! nothing, so no session slot is committed before the `ClientResponse`
//! packet. Every handler returns the datagrams to send back to the sender;
//! the network loop owns the socket.

use log::{debug, info, warn};
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use shared::challenge::{challenge_parity, gssdkcr, CHALLENGE_LEN};
use shared::packet::{self, Packet, PacketCounts, RefuseReason, CLIENT_VERSION};

use crate::registry::ClientRegistry;

/// Outstanding server challenges kept for strict verification. Newest wins
/// per endpoint; the table is tiny because entries only live between the
/// two handshake packets.
const MAX_PENDING_CHALLENGES: usize = 32;

pub struct HandshakeMachine {
    /// Verify the client's answer to our challenge before accepting it.
    ///
    /// The stock protocol never performs this check, so it defaults off
    /// for bug-compatibility and is switched on explicitly.
    strict_challenge: bool,
    pending_challenges: Vec<(SocketAddr, [u8; CHALLENGE_LEN])>,
    fixed_seed: Option<u32>,
}

impl HandshakeMachine {
    pub fn new(strict_challenge: bool) -> Self {
        Self {
            strict_challenge,
            pending_challenges: Vec::new(),
            fixed_seed: None,
        }
    }

    /// Machine with a deterministic seed sequence, for tests.
    #[cfg(test)]
    pub fn with_seed(strict_challenge: bool, seed: u32) -> Self {
        Self {
            strict_challenge,
            pending_challenges: Vec::new(),
            fixed_seed: Some(seed),
        }
    }

    /// Seed for the next challenge response or private key. Wall clock in
    /// production, a counting sequence under test.
    fn next_seed(&mut self) -> u32 {
        match &mut self.fixed_seed {
            Some(seed) => {
                let value = *seed;
                *seed = seed.wrapping_add(1);
                value
            }
            None => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u32,
        }
    }

    /// Dispatches one raw datagram, returning the responses owed to its
    /// sender.
    pub fn handle_datagram(
        &mut self,
        registry: &mut ClientRegistry,
        addr: SocketAddr,
        data: &[u8],
    ) -> Vec<Vec<u8>> {
        let packet = match Packet::decode(data) {
            Ok(packet) => packet,
            Err(err) => {
                debug!("Dropping malformed datagram from {}: {}", addr, err);
                return Vec::new();
            }
        };

        match packet {
            Packet::ClientChallenge { challenge, .. } => self.on_client_challenge(addr, &challenge),
            Packet::ClientResponse {
                challenge_response,
                public_key,
                version,
                ..
            } => self.on_client_response(registry, addr, &challenge_response, &public_key, version),
            Packet::Disconnection => {
                if !registry.remove(addr) {
                    info!("Disconnection signal received from unknown client ({})", addr);
                }
                Vec::new()
            }
            Packet::Encrypted { body, .. } => {
                self.on_encrypted(registry, addr, &body);
                Vec::new()
            }
            Packet::ServerChallengeResponse { .. }
            | Packet::HandshakeSuccess { .. }
            | Packet::ConnectionRefused { .. }
            | Packet::ConnectionEstablished { .. } => {
                warn!("Ignoring server-to-client packet from {}", addr);
                Vec::new()
            }
        }
    }

    fn on_client_challenge(
        &mut self,
        addr: SocketAddr,
        challenge: &[u8; CHALLENGE_LEN],
    ) -> Vec<Vec<u8>> {
        info!("Connection request from {}. Sending challenge...", addr);

        let response_seed = self.next_seed();
        let challenge_seed = self.next_seed();
        let challenge_response = gssdkcr(challenge, None, response_seed);
        let server_challenge = gssdkcr(&challenge_response, None, challenge_seed);

        if self.strict_challenge {
            self.remember_challenge(addr, server_challenge);
        }

        vec![packet::encode_server_challenge_response(
            PacketCounts::new(0, 1),
            &challenge_response,
            &server_challenge,
        )]
    }

    fn on_client_response(
        &mut self,
        registry: &mut ClientRegistry,
        addr: SocketAddr,
        challenge_response: &[u8; CHALLENGE_LEN],
        public_key: &[u8; 16],
        version: u32,
    ) -> Vec<Vec<u8>> {
        if version != CLIENT_VERSION {
            let reason = if version < CLIENT_VERSION {
                RefuseReason::OlderClientVersion
            } else {
                RefuseReason::NewerClientVersion
            };
            return vec![self.refuse(addr, reason)];
        }

        if self.strict_challenge {
            let verified = match self.take_challenge(addr) {
                Some(server_challenge) => {
                    verify_challenge_response(&server_challenge, challenge_response)
                }
                None => false,
            };
            if !verified {
                return vec![self.refuse(addr, RefuseReason::IncompatibleProtocol)];
            }
        }

        if registry.is_full() {
            return vec![self.refuse(addr, RefuseReason::ServerFull)];
        }

        info!("Connection from {} accepted. Generating keys...", addr);
        let key_seed = self.next_seed();
        let session = match registry.insert(addr, public_key, key_seed) {
            Ok(session) => session,
            // Checked above; races cannot happen on a single-threaded loop.
            Err(_) => return vec![self.refuse(addr, RefuseReason::ServerFull)],
        };

        let response = packet::encode_handshake_success(
            PacketCounts::new(session.server_packet_count, session.packet_count),
            &session.keys.public_key,
        );
        session.server_packet_count = session.server_packet_count.wrapping_add(1);
        vec![response]
    }

    fn on_encrypted(&mut self, registry: &mut ClientRegistry, addr: SocketAddr, body: &[u8]) {
        let session = match registry.find(addr) {
            Some(session) => session,
            None => {
                debug!("Encrypted packet from unknown endpoint {}", addr);
                return;
            }
        };

        match packet::open_payload(body, &session.keys.dec_key) {
            Ok(payload) => {
                session.packet_count = session.packet_count.wrapping_add(1);
                debug!("Received {} byte payload from {}", payload.len(), addr);
            }
            Err(err) => {
                warn!("Dropping encrypted packet from {}: {}", addr, err);
            }
        }
    }

    fn refuse(&mut self, addr: SocketAddr, reason: RefuseReason) -> Vec<u8> {
        info!("Refused connection from {}. Reason: {}", addr, reason);
        packet::encode_connection_refused(PacketCounts::new(1, 2), reason)
    }

    fn remember_challenge(&mut self, addr: SocketAddr, challenge: [u8; CHALLENGE_LEN]) {
        self.pending_challenges.retain(|(pending, _)| *pending != addr);
        if self.pending_challenges.len() >= MAX_PENDING_CHALLENGES {
            self.pending_challenges.remove(0);
        }
        self.pending_challenges.push((addr, challenge));
    }

    fn take_challenge(&mut self, addr: SocketAddr) -> Option<[u8; CHALLENGE_LEN]> {
        let index = self
            .pending_challenges
            .iter()
            .position(|(pending, _)| *pending == addr)?;
        Some(self.pending_challenges.remove(index).1)
    }
}

/// Checks a client's answer against our own recomputation.
///
/// Bytes 0 and 13 come from the client's generator and cannot be predicted,
/// so only the thirty deterministic bytes are compared. A challenge that
/// fails the parity scan yields a pure-generator response on both sides and
/// carries no verifiable bytes at all; those pass by construction.
fn verify_challenge_response(
    server_challenge: &[u8; CHALLENGE_LEN],
    response: &[u8; CHALLENGE_LEN],
) -> bool {
    if !challenge_parity(server_challenge) {
        return true;
    }
    let expected = gssdkcr(server_challenge, None, 0);
    (0..CHALLENGE_LEN)
        .filter(|&i| i != 0 && i != 13)
        .all(|i| expected[i] == response[i])
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::keys::{create_randhash, derive_public_key, derive_shared_key};

    const HALO_CHALLENGE: &[u8; 32] = b")nTu4y&t,Cr{P5j{6k<]^E@-ToF#Kg>m";

    fn test_addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn decode_one(responses: Vec<Vec<u8>>) -> Packet {
        assert_eq!(responses.len(), 1, "expected exactly one response");
        Packet::decode(&responses[0]).unwrap()
    }

    fn client_response_datagram(
        challenge_response: &[u8; 32],
        public_key: &[u8; 16],
        version: u32,
    ) -> Vec<u8> {
        packet::encode_client_response(
            PacketCounts::new(0, 2),
            challenge_response,
            public_key,
            version,
        )
    }

    #[test]
    fn test_happy_path_handshake() {
        let mut machine = HandshakeMachine::with_seed(false, 0);
        let mut registry = ClientRegistry::new(16);
        let addr = test_addr(4000);

        // Challenge phase: seeds 0 and 1 feed the two responses.
        let datagram = packet::encode_client_challenge(PacketCounts::new(0, 0), HALO_CHALLENGE);
        let reply = decode_one(machine.handle_datagram(&mut registry, addr, &datagram));

        let expected_response = gssdkcr(HALO_CHALLENGE, None, 0);
        let expected_challenge = gssdkcr(&expected_response, None, 1);
        let server_challenge = match reply {
            Packet::ServerChallengeResponse {
                counts,
                challenge_response,
                challenge,
            } => {
                assert_eq!(counts, PacketCounts::new(0, 1));
                assert_eq!(challenge_response, expected_response);
                assert_eq!(challenge, expected_challenge);
                challenge
            }
            other => panic!("unexpected reply {other:?}"),
        };
        assert!(registry.is_empty(), "no session before the public key");

        // Response phase: client derives its own keys and answers.
        let client_private = create_randhash(777);
        let client_public = derive_public_key(&client_private);
        let client_answer = gssdkcr(&server_challenge, None, 9);
        let datagram =
            client_response_datagram(&client_answer, &client_public, CLIENT_VERSION);
        let reply = decode_one(machine.handle_datagram(&mut registry, addr, &datagram));

        let server_public = match reply {
            Packet::HandshakeSuccess { counts, public_key } => {
                assert_eq!(counts, PacketCounts::new(1, 2));
                public_key
            }
            other => panic!("unexpected reply {other:?}"),
        };

        // Key seed 2 produced the server's private key.
        assert_eq!(server_public, derive_public_key(&create_randhash(2)));

        let session = registry.find(addr).expect("session created");
        assert_eq!(session.server_packet_count, 2);
        assert_eq!(session.packet_count, 2);
        assert_eq!(session.keys.enc_key, session.keys.dec_key);

        // Both sides agree on the shared key.
        let client_shared = derive_shared_key(&client_private, &server_public);
        assert_eq!(session.keys.enc_key, client_shared);
    }

    #[test]
    fn test_older_version_refused() {
        let mut machine = HandshakeMachine::with_seed(false, 0);
        let mut registry = ClientRegistry::new(16);

        let datagram =
            client_response_datagram(&[b'x'; 32], &[0u8; 16], CLIENT_VERSION - 1);
        let reply = decode_one(machine.handle_datagram(&mut registry, test_addr(4001), &datagram));

        match reply {
            Packet::ConnectionRefused { reason, .. } => assert_eq!(reason, 4),
            other => panic!("unexpected reply {other:?}"),
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_newer_version_refused() {
        let mut machine = HandshakeMachine::with_seed(false, 0);
        let mut registry = ClientRegistry::new(16);

        let datagram =
            client_response_datagram(&[b'x'; 32], &[0u8; 16], CLIENT_VERSION + 1);
        let reply = decode_one(machine.handle_datagram(&mut registry, test_addr(4002), &datagram));

        match reply {
            Packet::ConnectionRefused { reason, .. } => assert_eq!(reason, 5),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn test_server_full_refused() {
        let mut machine = HandshakeMachine::with_seed(false, 0);
        let mut registry = ClientRegistry::new(16);
        for i in 0..16 {
            let public = derive_public_key(&create_randhash(i));
            registry.insert(test_addr(5000 + i as u16), &public, i).unwrap();
        }

        let public = derive_public_key(&create_randhash(99));
        let datagram = client_response_datagram(&[b'x'; 32], &public, CLIENT_VERSION);
        let reply = decode_one(machine.handle_datagram(&mut registry, test_addr(4003), &datagram));

        match reply {
            Packet::ConnectionRefused { reason, .. } => assert_eq!(reason, 6),
            other => panic!("unexpected reply {other:?}"),
        }
        assert_eq!(registry.len(), 16);
    }

    #[test]
    fn test_strict_mode_accepts_honest_client() {
        let mut machine = HandshakeMachine::with_seed(true, 0);
        let mut registry = ClientRegistry::new(16);
        let addr = test_addr(4004);

        let datagram = packet::encode_client_challenge(PacketCounts::new(0, 0), HALO_CHALLENGE);
        let reply = decode_one(machine.handle_datagram(&mut registry, addr, &datagram));
        let server_challenge = match reply {
            Packet::ServerChallengeResponse { challenge, .. } => challenge,
            other => panic!("unexpected reply {other:?}"),
        };

        let client_public = derive_public_key(&create_randhash(777));
        let answer = gssdkcr(&server_challenge, None, 12345);
        let datagram = client_response_datagram(&answer, &client_public, CLIENT_VERSION);
        let reply = decode_one(machine.handle_datagram(&mut registry, addr, &datagram));

        assert!(matches!(reply, Packet::HandshakeSuccess { .. }));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_strict_mode_rejects_bad_response() {
        let mut machine = HandshakeMachine::with_seed(true, 0);
        let mut registry = ClientRegistry::new(16);
        let addr = test_addr(4005);

        let datagram = packet::encode_client_challenge(PacketCounts::new(0, 0), HALO_CHALLENGE);
        machine.handle_datagram(&mut registry, addr, &datagram);

        let client_public = derive_public_key(&create_randhash(777));
        let datagram = client_response_datagram(&[b'!'; 32], &client_public, CLIENT_VERSION);
        let reply = decode_one(machine.handle_datagram(&mut registry, addr, &datagram));

        match reply {
            Packet::ConnectionRefused { reason, .. } => assert_eq!(reason, 3),
            other => panic!("unexpected reply {other:?}"),
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_strict_mode_requires_prior_challenge() {
        let mut machine = HandshakeMachine::with_seed(true, 0);
        let mut registry = ClientRegistry::new(16);

        let client_public = derive_public_key(&create_randhash(777));
        let datagram = client_response_datagram(&[b'x'; 32], &client_public, CLIENT_VERSION);
        let reply = decode_one(machine.handle_datagram(&mut registry, test_addr(4006), &datagram));

        match reply {
            Packet::ConnectionRefused { reason, .. } => assert_eq!(reason, 3),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn test_disconnection_removes_session() {
        let mut machine = HandshakeMachine::with_seed(false, 0);
        let mut registry = ClientRegistry::new(16);
        let addr = test_addr(4007);
        let public = derive_public_key(&create_randhash(1));
        registry.insert(addr, &public, 1).unwrap();

        let replies =
            machine.handle_datagram(&mut registry, addr, &packet::encode_disconnection());
        assert!(replies.is_empty());
        assert!(registry.is_empty());

        // A second disconnection is the unknown-client path; still no reply.
        let replies =
            machine.handle_datagram(&mut registry, addr, &packet::encode_disconnection());
        assert!(replies.is_empty());
    }

    #[test]
    fn test_encrypted_roundtrip_with_session() {
        let mut machine = HandshakeMachine::with_seed(false, 0);
        let mut registry = ClientRegistry::new(16);
        let addr = test_addr(4008);

        let client_private = create_randhash(777);
        let client_public = derive_public_key(&client_private);
        let datagram = client_response_datagram(&[b'x'; 32], &client_public, CLIENT_VERSION);
        machine.handle_datagram(&mut registry, addr, &datagram);

        let (count_before, client_key) = {
            let session = registry.find(addr).unwrap();
            (session.packet_count, session.keys.dec_key)
        };

        let sealed =
            packet::seal_payload(PacketCounts::new(2, 3), b"bitpacked game data", &client_key)
                .unwrap();
        machine.handle_datagram(&mut registry, addr, &sealed);
        assert_eq!(registry.find(addr).unwrap().packet_count, count_before + 1);
    }

    #[test]
    fn test_malformed_datagrams_are_dropped() {
        let mut machine = HandshakeMachine::with_seed(false, 0);
        let mut registry = ClientRegistry::new(16);
        let addr = test_addr(4009);

        for datagram in [
            &[][..],
            &[0xFE][..],
            &[0x00, 0x01, 0x02][..],
            &[0xFE, 0xFE, 0x42][..],
        ] {
            assert!(machine.handle_datagram(&mut registry, addr, datagram).is_empty());
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_server_packets_from_clients_are_ignored() {
        let mut machine = HandshakeMachine::with_seed(false, 0);
        let mut registry = ClientRegistry::new(16);

        let datagram = packet::encode_handshake_success(PacketCounts::new(1, 2), &[0u8; 16]);
        let replies = machine.handle_datagram(&mut registry, test_addr(4010), &datagram);
        assert!(replies.is_empty());
    }
}
