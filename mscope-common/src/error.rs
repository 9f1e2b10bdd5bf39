//! Errors raised by mscope-common
//!
//! Everything here is a bootstrap or storage failure: the settings table,
//! the TOML file or the root folder on disk.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// SQLite failure while opening the pool or touching `settings`
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Root folder or config file I/O
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Unparseable TOML or setting value
    #[error("Configuration error: {0}")]
    Config(String),
}
