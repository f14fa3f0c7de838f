//! Seat numbers entered by the user

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const MAX_SEAT_LEN: usize = 8;

/// A normalized seat label such as "25A"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SeatNumber(String);

impl SeatNumber {
    /// Trim and upper-case user input, rejecting anything that is not a short
    /// alphanumeric label
    pub fn parse(input: &str) -> Result<Self> {
        let seat = input.trim().to_uppercase();
        if seat.is_empty() {
            return Err(Error::InvalidSeat("seat number is empty".into()));
        }
        if seat.len() > MAX_SEAT_LEN {
            return Err(Error::InvalidSeat(format!(
                "{} is longer than {} characters",
                seat, MAX_SEAT_LEN
            )));
        }
        if !seat.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(Error::InvalidSeat(format!("{} is not alphanumeric", seat)));
        }
        Ok(Self(seat))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for SeatNumber {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SeatNumber {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<SeatNumber> for String {
    fn from(seat: SeatNumber) -> Self {
        seat.0
    }
}

impl fmt::Display for SeatNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
