//! Data models for Seatlink

mod message;
mod peer;
mod role;
mod seat;

pub use message::*;
pub use peer::*;
pub use role::*;
pub use seat::*;
