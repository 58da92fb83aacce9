//! # Integration Bus Registry - Main Entry Point
//!
//! The registry is the rendezvous process of a simulation domain: it hands
//! every joining participant the list of already connected peers and stays
//! resident for late joiners. After the mesh is up it is off the critical
//! path; it also re-emits log records from participants that opted into
//! remote logging.
//!
//! The binary is self-contained: parse arguments, assemble the logging
//! stack, bind the listener, then run until interrupted.

use anyhow::Result;
use clap::Parser;
use tracing::info;
use vecu_bus::config::RegistryConfig;
use vecu_bus::logging::init_registry_logging;
use vecu_bus::registry::start_registry;

/// Integration Bus registry process
///
/// Participants of one simulation domain announce themselves here and
/// receive the peer list for building their direct connection mesh.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Interface to bind
    #[arg(long, default_value = "127.0.0.1")]
    hostname: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = vecu_bus::config::DEFAULT_REGISTRY_PORT)]
    port: u16,

    /// Simulation domain id served by this registry
    #[arg(short, long, default_value_t = 42)]
    domain: u32,

    /// Detailed log file (daily rolling); omit to log to stdout only
    #[arg(long)]
    log_file: Option<String>,

    /// Increase log verbosity (-v: debug, -vv: trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress stdout logging
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // The guard must stay alive for the file appender to flush.
    let _log_guard = init_registry_logging(args.verbose, args.quiet, args.log_file.as_deref());

    let config = RegistryConfig {
        hostname: args.hostname,
        port: args.port,
        ..Default::default()
    };

    let mut handle = start_registry(&config, args.domain).await?;
    info!(
        "registry ready on {} (domain {}); press Ctrl-C to stop",
        handle.local_addr(),
        args.domain
    );

    tokio::signal::ctrl_c().await?;
    handle.shutdown();
    info!("registry stopped");
    Ok(())
}
