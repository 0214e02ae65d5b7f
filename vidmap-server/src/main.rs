//! vidmap-server entry point.
//!
//! ```text
//! vidmap-server                  Run in the foreground
//! vidmap-server --config <path>  Load a custom config TOML
//! vidmap-server --gen-config     Write default config to stdout
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vidmap_core::protocol::registry;
use vidmap_server::config::ServerConfig;
use vidmap_server::server::Server;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "vidmap-server", about = "vidmap video-to-tile streaming daemon")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "vidmap-server.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&ServerConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    // Load config.
    let config = ServerConfig::load(&cli.config);

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("vidmap-server v{}", env!("CARGO_PKG_VERSION"));
    info!("listen address: {}", config.network.listen_addr);
    info!("videos dir: {}", config.media.videos_dir.display());

    // The dispatch-table patch must be in place before any send path
    // can run; startup is the single writer.
    registry::install();

    // One-time native decoder initialization.
    #[cfg(feature = "libav")]
    vidmap_core::decode::libav::init_native(&config.media.lut_path)?;
    #[cfg(not(feature = "libav"))]
    tracing::warn!("built without the `libav` feature; start commands will be rejected");

    let server = Server::new(config);
    let manager = server.manager();

    tokio::select! {
        result = server.run() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received; shutting down sessions");
            manager.shutdown_all().await?;
        }
    }

    info!("goodbye");
    Ok(())
}
