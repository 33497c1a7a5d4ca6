//! shardtun - encrypted UDP tunnel with forward error correction

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use shardtun::{relay, TunnelConfig, TunnelMode};

#[derive(Parser)]
#[command(name = "shardtun")]
#[command(version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_HASH"), ", built ", env!("BUILD_DATE"), ")"))]
#[command(about = "Encrypted UDP tunnel with forward error correction", long_about = None)]
struct Cli {
    /// Configuration file path (TOML, one tunnel or a [[tunnel]] array)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept plain UDP locally and tunnel it to a server
    Client(TunnelArgs),

    /// Accept tunnel traffic and forward it as plain UDP
    Server(TunnelArgs),
}

#[derive(Args)]
struct TunnelArgs {
    /// Local listen address
    #[arg(short = 'l', long = "local")]
    local: SocketAddr,

    /// Remote address (tunnel server, or forward target in server mode)
    #[arg(short = 'r', long = "remote")]
    remote: SocketAddr,

    /// Encryption method (chacha20, aes-*, rc4-md5, salsa20, none, ...)
    #[arg(long, default_value = "chacha20")]
    method: String,

    /// Pre-shared password
    #[arg(long = "pass", env = "SHARDTUN_PASSWORD", default_value = "123")]
    password: String,

    /// Maximum transmission unit
    #[arg(long, default_value_t = 1400)]
    mtu: usize,

    /// FEC data shards
    #[arg(long = "ds", default_value_t = 0)]
    data_shards: usize,

    /// FEC parity shards
    #[arg(long = "ps", default_value_t = 0)]
    parity_shards: usize,

    /// Authenticate stream-cipher packets with an HMAC
    #[arg(long = "auth")]
    authenticated: bool,

    /// Session idle expiry (e.g. 60s, 5m)
    #[arg(long, default_value = "60s", value_parser = humantime::parse_duration)]
    expires: Duration,
}

impl TunnelArgs {
    fn into_config(self, mode: TunnelMode) -> TunnelConfig {
        TunnelConfig {
            mode,
            local_addr: self.local,
            remote_addr: self.remote,
            method: self.method,
            password: self.password,
            mtu: self.mtu,
            data_shards: self.data_shards,
            parity_shards: self.parity_shards,
            authenticated: self.authenticated,
            expires: self.expires,
            ..TunnelConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logger
    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    let mut configs = Vec::new();
    if let Some(path) = &cli.config {
        let loaded = TunnelConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?;
        configs.extend(loaded);
    }
    match cli.command {
        Some(Commands::Client(args)) => configs.push(args.into_config(TunnelMode::Client)),
        Some(Commands::Server(args)) => configs.push(args.into_config(TunnelMode::Server)),
        None => {}
    }
    if configs.is_empty() {
        bail!("nothing to run: pass a subcommand or --config");
    }

    for config in &configs {
        config
            .validate()
            .with_context(|| format!("invalid {:?} tunnel on {}", config.mode, config.local_addr))?;
    }

    let mut tunnels = tokio::task::JoinSet::new();
    for config in configs {
        config.print();
        tunnels.spawn(relay::run(config));
    }

    while let Some(joined) = tunnels.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::error!("tunnel stopped: {:#}", e),
            Err(e) => log::error!("tunnel task failed: {}", e),
        }
    }
    Ok(())
}
