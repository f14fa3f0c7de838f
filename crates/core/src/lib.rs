//! Seatlink Core Library
//!
//! Data models and configuration shared by the networking layer and the
//! front end.

pub mod config;
pub mod error;
pub mod models;

pub use config::LinkConfig;
pub use error::{Error, Result};
pub use models::*;
