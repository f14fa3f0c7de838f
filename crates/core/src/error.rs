//! Error types for Seatlink Core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Invalid seat number: {0}")]
    InvalidSeat(String),
}

pub type Result<T> = std::result::Result<T, Error>;
