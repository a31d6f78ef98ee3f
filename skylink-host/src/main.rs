//! Skylink host entry point.
//!
//! ```text
//! skylink-host                     Serve on the configured port
//! skylink-host --port 6000         Override the control port
//! skylink-host --connect <addr>    Also dial out to a viewer
//! skylink-host --config <path>     Load a custom config TOML
//! skylink-host --gen-config        Write default config to stdout
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use skylink_host::config::HostConfig;
use skylink_host::service::HostService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "skylink-host", about = "Skylink screen streaming host")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "skylink-host.toml")]
    config: PathBuf,

    /// Control port, overriding the config file.
    #[arg(short, long)]
    port: Option<u16>,

    /// Viewer address to connect out to after starting.
    #[arg(long)]
    connect: Option<SocketAddr>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&HostConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let mut config = HostConfig::load(&cli.config);
    if let Some(port) = cli.port {
        config.network.control_port = port;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("skylink-host v{}", env!("CARGO_PKG_VERSION"));
    info!("control port: {}", config.network.control_port);
    info!("discovery port: {}", config.network.discovery_port);
    info!("codec: {}", config.encoding.codec);
    info!("capture: {}x{} @ {} fps", config.screen.width, config.screen.height, config.screen.fps);

    let service = HostService::new(config);
    let stop = service.stop_handle();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop.cancel();
    });

    service.run(cli.connect).await?;
    Ok(())
}
