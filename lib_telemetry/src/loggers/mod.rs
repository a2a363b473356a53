/// Console and rotated-file `tracing` setup.
pub mod loggerlocal;

pub use loggerlocal::{init_logging, rotate_logs, LoggerError, LoggerLocalOptions};
