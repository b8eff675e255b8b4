//! Logging.

mod macros;

pub use log;
pub use log::{Level, LevelFilter, debug, error, info, log_enabled, trace, warn};
