use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

#[derive(
  clap::ValueEnum, Clone, Copy, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize,
)]
pub enum LogLevel {
  Trace,
  Debug,
  Info,
  Warn,
  Error,
  Off,
}
impl From<LogLevel> for LevelFilter {
  fn from(level: LogLevel) -> LevelFilter {
    match level {
      LogLevel::Trace => LevelFilter::TRACE,
      LogLevel::Debug => LevelFilter::DEBUG,
      LogLevel::Info => LevelFilter::INFO,
      LogLevel::Warn => LevelFilter::WARN,
      LogLevel::Error => LevelFilter::ERROR,
      LogLevel::Off => LevelFilter::OFF,
    }
  }
}

/// Installs a global fmt subscriber. Later calls are ignored, so every test
/// may call it.
pub fn init_logging(level: LogLevel) {
  let _ = tracing_subscriber::fmt()
    .with_max_level(LevelFilter::from(level))
    .with_target(false)
    .try_init();
}
