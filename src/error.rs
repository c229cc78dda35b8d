//! Error types for the l2book crate.
//!
//! Book and calibration errors ([`Error::EmptyBook`], [`Error::InvalidSide`],
//! [`Error::MalformedMessage`], [`Error::LiquidityInsufficient`]) sit next to
//! the transport errors raised while talking to the venue.
//!
//! Sequence gaps are not errors: they are reported in
//! [`crate::orderbook::ApplyOutcome`] and never interrupt processing.

use thiserror::Error;

use crate::types::{BookSide, Instrument, Size};

/// The main error type for this crate
#[derive(Debug, Error)]
pub enum Error {
    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// URL could not be built
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    /// Invalid configuration (missing fields, bad format)
    #[error("Configuration error: {0}")]
    Config(String),

    /// API returned an error response
    #[error("API error {0}")]
    Api(ApiError),

    /// Rate limit exceeded
    #[error("{}", rate_limited_message(.retry_after_ms))]
    RateLimited {
        /// Retry after this many milliseconds
        retry_after_ms: Option<u64>,
    },

    /// WebSocket connection closed unexpectedly
    #[error("WebSocket connection closed")]
    ConnectionClosed,

    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,

    /// Feed message did not have the expected shape; the message is dropped
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Side token was not recognised
    #[error("Invalid side: {0:?}")]
    InvalidSide(String),

    /// The requested side of a book has no levels
    #[error("Empty book: {instrument} has no {side}")]
    EmptyBook {
        /// Instrument whose book was read
        instrument: Instrument,
        /// Side that was empty
        side: BookSide,
    },

    /// A book side lacks the depth to absorb a requested size
    ///
    /// Constructing this value has no side effects. Callers that want to stop
    /// trading the instrument call [`crate::Engine::ban_instrument`].
    #[error(
        "Insufficient liquidity on {instrument} {side}: requested {requested}, available {available}"
    )]
    LiquidityInsufficient {
        /// Instrument whose book was walked
        instrument: Instrument,
        /// Side that was walked
        side: BookSide,
        /// Size asked for
        requested: Size,
        /// Total size resting on the side
        available: Size,
    },

    /// Instrument is not tracked by the registry
    #[error("Instrument not found: {0}")]
    InstrumentNotFound(Instrument),
}

fn rate_limited_message(retry_after_ms: &Option<u64>) -> String {
    match retry_after_ms {
        Some(ms) => format!("Rate limited, retry after {}ms", ms),
        None => "Rate limited".to_string(),
    }
}

/// Error returned by the venue API
#[derive(Debug, Clone)]
pub struct ApiError {
    /// HTTP status code
    pub status: u16,
    /// Error code from API (if provided)
    pub code: Option<String>,
    /// Error message
    pub message: String,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "({}, code {}): {}", self.status, code, self.message),
            None => write!(f, "({}): {}", self.status, self.message),
        }
    }
}

impl ApiError {
    /// Create a new API error
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            code: None,
            message: message.into(),
        }
    }

    /// Create an API error with an error code
    pub fn with_code(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: Some(code.into()),
            message: message.into(),
        }
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status)
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.status)
    }
}

impl Error {
    /// Whether the error concerns a single message or read and leaves the
    /// engine state untouched
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            Error::MalformedMessage(_)
                | Error::InvalidSide(_)
                | Error::EmptyBook { .. }
                | Error::InstrumentNotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_display() {
        let err = Error::Api(ApiError::new(400, "Bad request"));
        assert!(err.to_string().contains("400"));
        assert!(err.to_string().contains("Bad request"));
    }

    #[test]
    fn test_rate_limited_display() {
        let err = Error::RateLimited {
            retry_after_ms: Some(1000),
        };
        assert!(err.to_string().contains("1000"));

        let err = Error::RateLimited {
            retry_after_ms: None,
        };
        assert_eq!(err.to_string(), "Rate limited");
    }

    #[test]
    fn test_liquidity_display() {
        let err = Error::LiquidityInsufficient {
            instrument: Instrument::new("BTC", "USDT"),
            side: BookSide::Ask,
            requested: "5".parse().unwrap(),
            available: "2.5".parse().unwrap(),
        };
        let text = err.to_string();
        assert!(text.contains("BTC-USDT"));
        assert!(text.contains("asks"));
        assert!(text.contains("2.5"));
    }

    #[test]
    fn test_is_local() {
        assert!(Error::MalformedMessage("x".into()).is_local());
        assert!(Error::InvalidSide("x".into()).is_local());
        assert!(!Error::ConnectionClosed.is_local());
        assert!(ApiError::with_code(429, "429000", "slow down").is_client_error());
    }
}
