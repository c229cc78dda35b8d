//! Venue clients.
//!
//! This module contains:
//!
//! - [`transport`] - the [`Transport`] trait the engine talks to, and
//!   [`ExchangeTransport`], its default implementation
//! - [`rest`] - HTTP client for the venue's public REST endpoints
//! - [`websocket`] - WebSocket client and the reconnecting [`FeedPump`]

pub mod rest;
pub mod transport;
pub mod websocket;

pub use rest::RestClient;
pub use transport::{ExchangeTransport, Transport};
pub use websocket::{FeedPump, SubscriptionRequest, WebSocketClient};
