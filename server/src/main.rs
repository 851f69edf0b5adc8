use clap::Parser;
use log::{error, info};
use server::{Server, ServerSettings};
use shared::DEFAULT_PORT;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind to
    #[arg(short = 'H', long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Maximum number of simultaneous clients
    #[arg(short, long, default_value = "32")]
    max_clients: usize,

    /// Target state updates per second across all clients
    #[arg(short, long, default_value = "60")]
    updates_per_second: u32,

    /// Milliseconds clients wait between screenshots
    #[arg(long, default_value = "3000")]
    screenshot_interval: u32,

    /// Message sent to every client when it connects
    #[arg(short, long, default_value = "")]
    join_message: String,

    /// Save shared screenshots to disk
    #[arg(long)]
    save_screenshots: bool,

    /// Directory screenshots are saved to
    #[arg(long, default_value = "klfScreenshots")]
    screenshot_dir: PathBuf,

    /// Echo state updates back to the client that sent them
    #[arg(long)]
    relay_updates_to_sender: bool,
}

impl From<Args> for ServerSettings {
    fn from(args: Args) -> Self {
        ServerSettings {
            host: args.host,
            port: args.port,
            max_clients: args.max_clients,
            updates_per_second: args.updates_per_second,
            join_message: args.join_message,
            screenshot_interval: args.screenshot_interval,
            save_screenshots: args.save_screenshots,
            screenshot_dir: args.screenshot_dir,
            relay_updates_to_sender: args.relay_updates_to_sender,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let settings = ServerSettings::from(args);

    info!("Starting server on {}", settings.bind_address());
    info!(
        "Max clients: {}, updates per second: {}",
        settings.max_clients, settings.updates_per_second
    );
    info!("Console commands: /quit, /kick <name>, anything else is broadcast");

    let server = Server::new(settings).await?.with_console(true);
    let shutdown = server.shutdown_handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down...");
            shutdown.cancel();
        }
    });

    if let Err(e) = server.run().await {
        error!("Server stopped: {}", e);
        return Err(e.into());
    }

    Ok(())
}
