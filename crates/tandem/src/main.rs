mod cli;
mod logging;

use clap::Parser as _;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use tandem_sync::Syncer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let args = cli::Cli::parse();
  logging::init("tandem")?;
  setup_panic_hook();

  let config = cli::load_config(&args.config)?;

  let shutdown_token = CancellationToken::new();
  spawn_signal_handler(shutdown_token.clone())?;

  let syncer = Syncer::new(config, shutdown_token.clone())
    .await
    .map_err(|e| anyhow::anyhow!("failed to start sync service: {}", e))?;

  match args.command {
    cli::Commands::Run => {
      syncer.run().await?;
      info!("sync service stopped cleanly");
    }
    cli::Commands::Init => {
      syncer.init_collections().await?;
      info!("collections initialized");
    }
    cli::Commands::Check => {
      syncer.check().await?;
      info!("queue and index are reachable");
    }
  }

  Ok(())
}

/// Cancel the shutdown token on SIGINT or SIGTERM so in-flight jobs can
/// drain within the configured grace period.
fn spawn_signal_handler(token: CancellationToken) -> anyhow::Result<()> {
  #[cfg(unix)]
  {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
      tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
        _ = terminate.recv() => info!("received SIGTERM, shutting down"),
      }
      token.cancel();
    });
  }

  #[cfg(not(unix))]
  {
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        info!("received interrupt, shutting down");
      }
      token.cancel();
    });
  }

  Ok(())
}

fn setup_panic_hook() {
  std::panic::set_hook(Box::new(|panic| {
    if let Some(location) = panic.location() {
      error!(
        message = %panic,
        panic.file = location.file(),
        panic.line = location.line(),
        panic.column = location.column(),
      );
    } else {
      error!(message = %panic);
    }
  }));
}
