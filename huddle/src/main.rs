mod handlers;
mod server;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use huddle_core::{logging, Config};

#[derive(Parser, Debug)]
#[command(name = "huddle")]
#[command(about = "SFU video conferencing and live streaming server", long_about = None)]
struct Args {
    /// Listen address (host:port); overrides host/port from the config
    #[arg(long, env = "ADDR")]
    addr: Option<String>,

    /// Listen port when --addr is not given
    #[arg(long, env = "PORT", default_value_t = 8080)]
    port: u16,

    /// PEM certificate chain; TLS is served when both --cert and --key are set
    #[arg(long, env = "CERT")]
    cert: Option<String>,

    /// PEM private key
    #[arg(long, env = "KEY")]
    key: Option<String>,

    /// Optional TOML config file, layered under HUDDLE_* environment variables
    #[arg(long, env = "HUDDLE_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())
        .map_err(|e| anyhow::anyhow!("failed to load configuration: {e}"))?;

    // CLI flags win over file/env configuration.
    config.server.port = args.port;
    if args.cert.is_some() {
        config.server.cert = args.cert.clone();
    }
    if args.key.is_some() {
        config.server.key = args.key.clone();
    }
    let listen_addr = args
        .addr
        .clone()
        .unwrap_or_else(|| config.server.listen_addr());

    logging::init_logging(&config.logging)?;
    info!(addr = %listen_addr, tls = config.server.tls_enabled(), "huddle server starting");

    server::run(config, &listen_addr).await
}
