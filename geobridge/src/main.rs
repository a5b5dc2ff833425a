use clap::{Parser, Subcommand};
use snafu::ResultExt;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{ObservabilitySnafu, Result},
    serve::ServeArgs,
    simulate::SimulateArgs,
};

mod error;
#[cfg(feature = "kafka")]
mod kafka;
mod serve;
mod simulate;
mod sink;

#[derive(Parser)]
#[command(name = "geobridge")]
#[command(about = "GPS coordinates WebSocket to broker bridge")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept device connections and publish their records
    Serve {
        #[clap(flatten)]
        inner: ServeArgs,
    },
    /// Simulate devices pushing random coordinates
    Simulate {
        #[clap(flatten)]
        inner: SimulateArgs,
    },
}

#[tokio::main]
#[snafu::report]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let _guard = geobridge_observability::init_observability(
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
    )
    .context(ObservabilitySnafu {})?;

    let ct = CancellationToken::new();

    let ct_clone = ct.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        ct_clone.cancel();
    });

    match cli.command {
        Commands::Serve { inner } => inner.run(ct).await,
        Commands::Simulate { inner } => inner.run(ct).await,
    }
}
