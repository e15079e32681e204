//! Demo FIX client: loads a TOML session config, connects, logs on, and
//! prints every frame until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use meridian_common::log::{LogFactory, WriteSink};
use meridian_common::time::SystemClock;
use meridian_fix::net::{self, TcpChannel};
use meridian_fix::{FixConfig, Session};

#[derive(Parser, Debug)]
#[command(name = "meridian-client")]
#[command(about = "Connects a FIX session and logs traffic")]
struct Args {
    /// Path to the TOML session configuration
    #[arg(short, long, default_value = "client.toml")]
    config: std::path::PathBuf,

    /// host:port of the FIX gateway
    #[arg(short, long)]
    address: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize logging with reasonable defaults
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let args = Args::parse();
    let raw = std::fs::read_to_string(&args.config)
        .with_context(|| format!("reading {}", args.config.display()))?;
    let config: FixConfig = toml::from_str(&raw).context("parsing session configuration")?;

    let mut session = Session::new(config, TcpChannel::new(), SystemClock)?;

    // Wire log straight to stderr; anything logged before the sink is
    // installed replays from the factory's buffer.
    let factory = LogFactory::new();
    session.set_wire_log(factory.logger());
    factory.install_sink(Box::new(WriteSink::new(std::io::stderr())));

    session.set_all_messages_listener(Box::new(|msg| {
        info!(
            msg_type = %String::from_utf8_lossy(msg.msg_type()),
            seq = msg.seq_num(),
            "inbound"
        );
    }));
    session.set_failure_listener(Box::new(|reason| {
        info!(reason, "session disconnected");
    }));

    info!(address = %args.address, "starting FIX client");
    session.connect(&args.address)?;

    tokio::select! {
        result = net::run(&mut session) => {
            result.context("session driver")?;
            info!("session went idle, exiting");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    // Graceful logout, then let the driver flush and wind down.
    session.close();
    net::run(&mut session).await.context("session shutdown")?;
    Ok(())
}
