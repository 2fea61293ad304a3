use clap::Parser;
use log::info;
use server::network::{Server, ServerConfig};

// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// UDP port to listen on
    #[clap(default_value_t = 2302)]
    port: u16,

    /// Address to bind to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Maximum number of connected clients
    #[clap(short, long, default_value_t = 16)]
    max_clients: usize,

    /// Tick rate (updates per second)
    #[clap(short, long, default_value_t = 30)]
    tick_rate: u32,

    /// Verify the client's challenge response before accepting it
    #[clap(long)]
    strict_challenge: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Warning: RUST_LOG environment variable not set. Set it to display logs!");
        eprintln!("Recommended: RUST_LOG=info cargo run");
    }

    let args = Args::parse();
    let config = ServerConfig {
        host: args.host,
        port: args.port,
        max_clients: args.max_clients,
        tick_rate: args.tick_rate,
        strict_challenge: args.strict_challenge,
    };

    info!("Starting game server on {}:{}", config.host, config.port);
    info!("Tick rate: {} Hz", config.tick_rate);
    info!(" * Use 'quit' command to exit.");

    let mut server = Server::bind(config).await?;
    server.run().await?;

    Ok(())
}
