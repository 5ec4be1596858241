//! Fault injection and logging setup shared by the tests and the binaries.
mod failure_config;
mod logging;

#[rustfmt::skip]
pub use {
  failure_config::FailureConfig,
  failure_config::FailureConfigMap,
  logging::init_logging,
  logging::LogLevel,
};
