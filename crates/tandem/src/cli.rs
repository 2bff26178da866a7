use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "tandem")]
#[command(about = "Keeps a vector search index in sync with a relational system of record", long_about = None)]
#[command(version)]
pub struct Cli {
  /// Path to configuration file
  #[arg(short, long, global = true, default_value = "tandem.toml")]
  pub config: PathBuf,

  #[command(subcommand)]
  pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
  /// Run the sync service until interrupted
  Run,

  /// Create any missing index collections, then exit
  Init,

  /// Probe the queue and the vector index, then exit
  Check,
}

/// Layered configuration: file (optional) then TANDEM_* environment
/// overrides, e.g. TANDEM_QUEUE__URL=redis://queue:6379.
pub fn load_config(path: &PathBuf) -> anyhow::Result<tandem_sync::Config> {
  let settings = config::Config::builder()
    .add_source(config::File::from(path.clone()).required(false))
    .add_source(config::Environment::with_prefix("TANDEM").separator("__"))
    .build()?;

  let parsed: tandem_sync::Config = settings.try_deserialize()?;
  Ok(parsed)
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write as _;

  #[test]
  fn test_missing_file_falls_back_to_defaults() {
    let config = load_config(&PathBuf::from("/nonexistent/tandem.toml")).unwrap();
    assert_eq!(config.queue.group, "tandem-sync");
    config.validate().unwrap();
  }

  #[test]
  fn test_file_values_override_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tandem.toml");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(
      file,
      "[queue]\nurl = \"redis://elsewhere:6379\"\n\n[workers]\ncount = 9\n"
    )
    .unwrap();

    let config = load_config(&path).unwrap();
    assert_eq!(config.queue.url, "redis://elsewhere:6379");
    assert_eq!(config.workers.count, 9);
  }
}
