use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Builder;
use log::info;

use vdpa_custodian::{Server, UDS_PATH};

/// High-availability context custodian for the vDPA control-plane daemon.
///
/// Holds VFIO and vhost descriptors on behalf of the worker so it can
/// restart without tearing down guest DMA mappings. Takes no options;
/// everything is compile-time configuration.
#[derive(Parser, Debug)]
#[clap(version)]
struct Args {}

fn main() -> Result<()> {
    let _args = Args::parse();

    Builder::from_default_env()
        .try_init()
        .context("Failed to init env_logger")?;

    info!(
        "{} {} starting",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let mut server = Server::bind(Path::new(UDS_PATH)).context("Failed to start control server")?;
    server.run()
}
