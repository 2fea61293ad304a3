//! Server network layer: socket ownership and the tick loop.
//!
//! One task owns everything: the UDP socket, the receive queue, the client
//! registry and the handshake machine. Each 30 Hz tick polls console input,
//! drains the socket into the queue without blocking, dispatches the queue
//! through the handshake machine and flushes whatever datagrams that
//! produced. Sends are best-effort; a failed send is logged and changes no
//! state.

use log::{debug, error, info};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

use shared::packet::{self, MAX_DATAGRAM};

use crate::console::{spawn_stdin_reader, CommandContext, CommandRegistry};
use crate::handshake::HandshakeMachine;
use crate::registry::{ClientRegistry, DEFAULT_MAX_CLIENTS};

pub const DEFAULT_PORT: u16 = 2302;
pub const DEFAULT_TICK_RATE: u32 = 30;

/// Ticks between periodic status lines (10 s at the default rate).
const STATUS_INTERVAL_TICKS: u64 = 300;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_clients: usize,
    pub tick_rate: u32,
    pub strict_challenge: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            max_clients: DEFAULT_MAX_CLIENTS,
            tick_rate: DEFAULT_TICK_RATE,
            strict_challenge: false,
        }
    }
}

/// The server: socket, sessions and the loop driving them.
pub struct Server {
    socket: UdpSocket,
    registry: ClientRegistry,
    machine: HandshakeMachine,
    receive_queue: VecDeque<(SocketAddr, Vec<u8>)>,
    console_rx: mpsc::UnboundedReceiver<String>,
    commands: CommandRegistry,
    tick_duration: Duration,
    ticks: u64,
    last_tick: Duration,
    stop: bool,
}

impl Server {
    /// Binds the UDP socket and wires up the console reader.
    ///
    /// A bind failure is fatal and propagates to the caller.
    pub async fn bind(config: ServerConfig) -> io::Result<Self> {
        let socket = UdpSocket::bind((config.host.as_str(), config.port)).await?;

        Ok(Self {
            socket,
            registry: ClientRegistry::new(config.max_clients),
            machine: HandshakeMachine::new(config.strict_challenge),
            receive_queue: VecDeque::new(),
            console_rx: spawn_stdin_reader(),
            commands: CommandRegistry::new(),
            tick_duration: Duration::from_secs_f64(1.0 / f64::from(config.tick_rate)),
            ticks: 0,
            last_tick: Duration::ZERO,
            stop: false,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Main loop; returns after a `quit` command has drained and the
    /// disconnect broadcast is out.
    pub async fn run(&mut self) -> io::Result<()> {
        let mut ticker = interval(self.tick_duration);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Listening at {}", self.local_addr()?);

        while !self.stop {
            ticker.tick().await;
            let tick_start = Instant::now();

            self.process_console();
            self.read_data();
            let outbound = self.process_received_data();
            self.flush(outbound).await;

            self.ticks += 1;
            self.last_tick = tick_start.elapsed();

            if self.ticks % STATUS_INTERVAL_TICKS == 0 && !self.registry.is_empty() {
                debug!("Tick {}: {} clients connected", self.ticks, self.registry.len());
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Executes any console lines that arrived since the last tick.
    fn process_console(&mut self) {
        let mut ctx = CommandContext {
            stop: false,
            ticks: self.ticks,
            last_tick: self.last_tick,
            client_count: self.registry.len(),
        };
        while let Ok(line) = self.console_rx.try_recv() {
            self.commands.dispatch(&line, &mut ctx);
        }
        if ctx.stop {
            self.stop = true;
        }
    }

    /// Drains the socket into the receive queue until it would block.
    ///
    /// Datagrams beyond 4 KiB are truncated by the buffer and will fail
    /// structural parsing downstream, which drops them.
    fn read_data(&mut self) {
        let mut buffer = [0u8; MAX_DATAGRAM];
        loop {
            match self.socket.try_recv_from(&mut buffer) {
                Ok((len, addr)) => {
                    self.receive_queue.push_back((addr, buffer[..len].to_vec()));
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    error!("Error receiving packet: {}", err);
                    break;
                }
            }
        }
    }

    /// Dispatches every queued datagram, collecting outbound replies.
    fn process_received_data(&mut self) -> Vec<(SocketAddr, Vec<u8>)> {
        let mut outbound = Vec::new();
        while let Some((addr, data)) = self.receive_queue.pop_front() {
            let replies = self.machine.handle_datagram(&mut self.registry, addr, &data);
            outbound.extend(replies.into_iter().map(|reply| (addr, reply)));
        }
        outbound
    }

    async fn flush(&mut self, outbound: Vec<(SocketAddr, Vec<u8>)>) {
        for (addr, data) in outbound {
            match self.socket.send_to(&data, addr).await {
                Ok(sent) => debug!("Sent {} bytes to {}", sent, addr),
                Err(err) => error!("Failed to send to {}: {}", addr, err),
            }
        }
    }

    /// Broadcasts a disconnection signal to every live session and tears
    /// the registry down.
    async fn shutdown(&mut self) {
        info!("Shutting down. Disconnecting {} clients...", self.registry.len());
        let disconnection = packet::encode_disconnection();
        for session in self.registry.drain() {
            if let Err(err) = self.socket.send_to(&disconnection, session.addr).await {
                error!("Failed to send disconnection to {}: {}", session.addr, err);
            }
        }
    }
}
