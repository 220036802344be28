//! Runtime settings: defaults, then an optional TOML file, then `SLUICE_*`
//! environment variables.

use std::{
  path::{Path, PathBuf},
  sync::Arc,
  time::Duration,
};

use serde::Deserialize;
use sluice_core::store::EtlStore;
use sluice_pipeline::{
  IngestMode, Pipeline,
  adapter::{ApiAdapter, FileAdapter},
};

pub const ENV_PREFIX: &str = "SLUICE";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
  pub host:               String,
  pub port:               u16,
  /// SQLite file; `:memory:` keeps everything in RAM.
  pub database_path:      PathBuf,
  pub api_url:            String,
  /// Sent as `Authorization: Bearer <token>` when set.
  #[serde(default)]
  pub api_token:          Option<String>,
  pub file_path:          PathBuf,
  pub fetch_timeout_secs: u64,
  /// `0` disables the interval scheduler.
  pub etl_interval_secs:  u64,
  pub run_on_startup:     bool,
  pub ingest_mode:        IngestMode,
}

impl Settings {
  /// Layer defaults, the file at `path` (if it exists) and the environment.
  pub fn load(path: &Path) -> Result<Self, config::ConfigError> {
    let mut settings: Settings = config::Config::builder()
      .set_default("host", "0.0.0.0")?
      .set_default("port", 8000)?
      .set_default("database_path", "sluice.db")?
      .set_default("api_url", "http://jsonplaceholder.typicode.com/posts")?
      .set_default("file_path", "./data/sample.csv")?
      .set_default("fetch_timeout_secs", 30)?
      .set_default("etl_interval_secs", 3600)?
      .set_default("run_on_startup", true)?
      .set_default("ingest_mode", "incremental")?
      .add_source(config::File::from(path).required(false))
      .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
      .build()?
      .try_deserialize()?;

    settings.api_token = settings.api_token.filter(|t| !t.trim().is_empty());
    settings.database_path = expand_tilde(&settings.database_path);
    settings.file_path = expand_tilde(&settings.file_path);
    Ok(settings)
  }

  pub fn address(&self) -> String { format!("{}:{}", self.host, self.port) }

  pub fn fetch_timeout(&self) -> Duration { Duration::from_secs(self.fetch_timeout_secs) }

  pub fn etl_interval(&self) -> Option<Duration> {
    (self.etl_interval_secs > 0).then(|| Duration::from_secs(self.etl_interval_secs))
  }

  /// The pipeline over both configured sources.
  pub fn pipeline<S: EtlStore>(&self, store: Arc<S>) -> sluice_pipeline::Result<Pipeline<S>> {
    let api = ApiAdapter::new(&self.api_url, self.api_token.clone(), self.fetch_timeout())?;
    Ok(
      Pipeline::new(store, self.ingest_mode)
        .with_adapter(api)
        .with_adapter(FileAdapter::new(&self.file_path)),
    )
  }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}
