//! Manual test client: runs the full handshake against a live server,
//! sends one encrypted payload, then disconnects.

use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::time::timeout;

use shared::bitstream::Bitstream;
use shared::challenge::gssdkcr;
use shared::keys::{create_randhash, derive_public_key, derive_shared_key};
use shared::packet::{self, Packet, PacketCounts, RefuseReason, CLIENT_VERSION};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn clock_seed() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u32
}

async fn recv_packet(socket: &UdpSocket) -> Result<Packet, Box<dyn std::error::Error>> {
    let mut buf = [0u8; 4096];
    let (len, _) = timeout(RECV_TIMEOUT, socket.recv_from(&mut buf)).await??;
    Ok(Packet::decode(&buf[..len])?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let server_addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:2302".to_string())
        .parse()?;

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    println!("Client socket bound to {}", socket.local_addr()?);

    // Step 1: challenge the server.
    let challenge = *b")nTu4y&t,Cr{P5j{6k<]^E@-ToF#Kg>m";
    let datagram = packet::encode_client_challenge(PacketCounts::new(0, 0), &challenge);
    socket.send_to(&datagram, server_addr).await?;
    println!("Sent client challenge to {}", server_addr);

    let server_challenge = match recv_packet(&socket).await? {
        Packet::ServerChallengeResponse { challenge, .. } => {
            println!("Received server challenge");
            challenge
        }
        other => return Err(format!("unexpected packet: {other:?}").into()),
    };

    // Step 2: answer it and present our public key.
    let private_key = create_randhash(clock_seed());
    let public_key = derive_public_key(&private_key);
    let answer = gssdkcr(&server_challenge, None, clock_seed());
    let datagram =
        packet::encode_client_response(PacketCounts::new(1, 1), &answer, &public_key, CLIENT_VERSION);
    socket.send_to(&datagram, server_addr).await?;
    println!("Sent challenge response and public key");

    let server_public = match recv_packet(&socket).await? {
        Packet::HandshakeSuccess { public_key, .. } => public_key,
        Packet::ConnectionRefused { reason, .. } => {
            let text = RefuseReason::from_u32(reason)
                .map(|reason| reason.to_string())
                .unwrap_or_else(|| format!("reason {reason}"));
            return Err(format!("connection refused: {text}").into());
        }
        other => return Err(format!("unexpected packet: {other:?}").into()),
    };

    let shared_key = derive_shared_key(&private_key, &server_public);
    println!("Handshake complete. Shared key: {:02X?}", shared_key);

    // Step 3: one encrypted application payload, bitpacked.
    let mut payload = Bitstream::new();
    payload.write(0x2A, 8)?;
    payload.write(1, 1)?;
    payload.write(0x155, 11)?;
    let datagram = packet::seal_payload(PacketCounts::new(2, 3), payload.data(), &shared_key)?;
    socket.send_to(&datagram, server_addr).await?;
    println!("Sent {} byte encrypted payload", payload.data().len());

    // Step 4: clean disconnect.
    socket.send_to(&packet::encode_disconnection(), server_addr).await?;
    println!("Disconnected.");

    Ok(())
}
