//! Local settings, filesystem paths and logging for the edge dispatcher.

mod config;
mod error;
mod logging;
mod paths;

pub use config::{
    Config, DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_LOG_LEVEL, DEFAULT_READ_TIMEOUT_SECS,
    DEFAULT_RETRY_DELAY_SECS,
};
pub use error::{CoreError, CoreResult};
pub use logging::{init_logging, parse_level};
pub use paths::Paths;
