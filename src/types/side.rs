//! Book side.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// One side of a limit order book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookSide {
    /// Resting buy interest, best = highest price
    #[serde(alias = "bids", alias = "buy")]
    Bid,
    /// Resting sell interest, best = lowest price
    #[serde(alias = "asks", alias = "sell")]
    Ask,
}

impl BookSide {
    /// Get the opposite side
    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            BookSide::Bid => BookSide::Ask,
            BookSide::Ask => BookSide::Bid,
        }
    }

    /// Token used by the venue for this side in change sets
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            BookSide::Bid => "bids",
            BookSide::Ask => "asks",
        }
    }
}

impl fmt::Display for BookSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookSide {
    type Err = Error;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        match token.to_ascii_lowercase().as_str() {
            "bid" | "bids" | "buy" => Ok(BookSide::Bid),
            "ask" | "asks" | "sell" => Ok(BookSide::Ask),
            _ => Err(Error::InvalidSide(token.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tokens() {
        assert_eq!("bids".parse::<BookSide>().unwrap(), BookSide::Bid);
        assert_eq!("Ask".parse::<BookSide>().unwrap(), BookSide::Ask);
        assert_eq!("sell".parse::<BookSide>().unwrap(), BookSide::Ask);
    }

    #[test]
    fn test_invalid_token() {
        let err = "middle".parse::<BookSide>().unwrap_err();
        assert!(matches!(err, Error::InvalidSide(ref t) if t == "middle"));
    }

    #[test]
    fn test_opposite() {
        assert_eq!(BookSide::Bid.opposite(), BookSide::Ask);
        assert_eq!(BookSide::Ask.opposite(), BookSide::Bid);
    }
}
