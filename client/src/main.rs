use clap::Parser;
use client::chat::spawn_stdin_reader;
use client::config::{ClientConfig, DEFAULT_PLUGIN_DIR};
use client::network::Client;
use log::info;
use shared::DEFAULT_PORT;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Name shown to other users
    #[arg(short, long, default_value = "username")]
    username: String,

    /// Server address to connect to
    #[arg(short = 's', long, default_value_t = format!("127.0.0.1:{}", DEFAULT_PORT))]
    server: String,

    /// Directory shared with the external application
    #[arg(short = 'd', long, default_value = DEFAULT_PLUGIN_DIR)]
    plugin_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let config = ClientConfig::new(&args.username, args.server, args.plugin_dir);

    info!("Starting client...");
    info!("Connecting to: {} as {}", config.server, config.username);
    info!("Type to chat, /quit to disconnect");

    let client = Client::connect(&config).await?;
    let end = client.run(Some(spawn_stdin_reader())).await?;
    println!("{}", end);

    Ok(())
}
