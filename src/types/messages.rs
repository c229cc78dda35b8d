//! Venue wire types.
//!
//! This module contains the commands sent over the WebSocket, the messages
//! received from it, and the REST payloads used by the transport. Conversion
//! into domain events ([`crate::events::FeedEvent`]) happens here so that a
//! malformed payload is rejected before it reaches the calibration engine.

use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::market::deserialize_optional_decimal;
use super::{BookSide, Instrument, PairSummary, Price, Sequence, Size, TimestampMs};
use crate::error::Error;
use crate::events::{Delta, FeedEvent, PairSummaryEvent};

/// Topic prefix of the level2 delta channel
pub const LEVEL2_TOPIC: &str = "/market/level2";

/// Topic prefix of the ticker channel
pub const TICKER_TOPIC: &str = "/market/ticker";

/// Success code of the REST envelope
pub const SUCCESS_CODE: &str = "200000";

/// WebSocket command sent to the server
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WsCommand {
    /// Subscribe to a topic
    Subscribe {
        /// Message ID
        id: u64,
        /// Topic, e.g. `/market/level2:BTC-USDT,ETH-USDT`
        topic: String,
        /// Whether the topic is private
        #[serde(rename = "privateChannel")]
        private_channel: bool,
        /// Ask the server to acknowledge
        response: bool,
    },
    /// Unsubscribe from a topic
    Unsubscribe {
        /// Message ID
        id: u64,
        /// Topic to leave
        topic: String,
        /// Ask the server to acknowledge
        response: bool,
    },
    /// Keep-alive ping
    Ping {
        /// Message ID
        id: u64,
    },
}

impl WsCommand {
    /// Subscribe command for a channel prefix and a set of instruments
    pub fn subscribe(id: u64, prefix: &str, instruments: &[Instrument]) -> Self {
        WsCommand::Subscribe {
            id,
            topic: topic_for(prefix, instruments),
            private_channel: false,
            response: true,
        }
    }
}

/// Build a multi-symbol topic string
pub fn topic_for(prefix: &str, instruments: &[Instrument]) -> String {
    let symbols: Vec<String> = instruments.iter().map(Instrument::symbol).collect();
    format!("{}:{}", prefix, symbols.join(","))
}

/// WebSocket message received from the server
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WsMessage {
    /// Sent once after the connection is accepted
    Welcome(ControlMsg),
    /// Subscription acknowledged
    Ack(ControlMsg),
    /// Reply to a ping
    Pong(ControlMsg),
    /// Error response
    Error(ErrorMsg),
    /// Topic data
    Message(TopicMsg),
}

/// Control message carrying only an id
#[derive(Debug, Clone, Deserialize)]
pub struct ControlMsg {
    /// Message ID (string or number depending on the server)
    pub id: Option<serde_json::Value>,
}

/// Error message
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorMsg {
    /// Message ID of the failing request
    pub id: Option<serde_json::Value>,
    /// Error code
    pub code: Option<i64>,
    /// Error description
    pub data: Option<String>,
}

impl ControlMsg {
    /// Id of the command this message answers
    pub fn message_id(&self) -> Option<u64> {
        parse_message_id(self.id.as_ref())
    }
}

impl ErrorMsg {
    /// Id of the command that failed
    pub fn message_id(&self) -> Option<u64> {
        parse_message_id(self.id.as_ref())
    }
}

/// The server echoes ids either as numbers or as strings
fn parse_message_id(id: Option<&serde_json::Value>) -> Option<u64> {
    match id? {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Data pushed on a subscribed topic
#[derive(Debug, Clone, Deserialize)]
pub struct TopicMsg {
    /// Topic, e.g. `/market/level2:BTC-USDT`
    pub topic: String,
    /// Subject, e.g. `trade.l2update`
    pub subject: String,
    /// Subject-specific payload
    pub data: serde_json::Value,
}

impl TopicMsg {
    /// Symbol part of the topic (after the colon)
    pub fn topic_symbol(&self) -> Option<&str> {
        self.topic.split_once(':').map(|(_, symbol)| symbol)
    }

    /// Convert into domain events
    ///
    /// Unknown subjects yield no events. A known subject whose payload does
    /// not have the expected shape fails with [`Error::MalformedMessage`].
    pub fn into_feed_events(self) -> Result<Vec<FeedEvent>, Error> {
        match self.subject.as_str() {
            "trade.l2update" => {
                let update: Level2Update = serde_json::from_value(self.data)
                    .map_err(|e| Error::MalformedMessage(format!("level2 update: {e}")))?;
                Ok(vec![FeedEvent::Level2(update)])
            }
            "trade.ticker" => {
                let symbol = self.topic_symbol().ok_or_else(|| {
                    Error::MalformedMessage(format!("ticker topic without symbol: {}", self.topic))
                })?;
                let instrument = Instrument::from_str(symbol)?;
                let ticker: TickerData = serde_json::from_value(self.data)
                    .map_err(|e| Error::MalformedMessage(format!("ticker: {e}")))?;
                Ok(vec![FeedEvent::PairSummary(PairSummaryEvent {
                    instrument,
                    summary: ticker.summary(),
                })])
            }
            _ => Ok(Vec::new()),
        }
    }
}

/// Level2 change message
///
/// Each change is `[price, size, sequence]` as strings. A message may carry
/// changes on both sides at once, or none at all on a side.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Level2Update {
    /// Venue symbol
    pub symbol: String,
    /// Changes per side
    pub changes: Level2Changes,
    /// First sequence in this message
    #[serde(default)]
    pub sequence_start: Option<Sequence>,
    /// Last sequence in this message
    #[serde(default)]
    pub sequence_end: Option<Sequence>,
    /// Server timestamp
    #[serde(default)]
    pub time: Option<TimestampMs>,
}

/// Changes per side of a level2 message
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Level2Changes {
    /// Ask changes
    #[serde(default)]
    pub asks: Vec<Vec<String>>,
    /// Bid changes
    #[serde(default)]
    pub bids: Vec<Vec<String>>,
}

impl Level2Update {
    /// Expand into one [`Delta`] per change, in ascending sequence order
    ///
    /// Sequences interleave across the two sides of a message, so the
    /// changes are merged back into feed order. All changes are validated
    /// before any is returned, so a malformed message is rejected as a whole.
    pub fn deltas(&self) -> Result<Vec<Delta>, Error> {
        let instrument = Instrument::from_str(&self.symbol)?;
        let mut deltas = Vec::with_capacity(self.changes.bids.len() + self.changes.asks.len());

        for (side, changes) in [
            (BookSide::Bid, &self.changes.bids),
            (BookSide::Ask, &self.changes.asks),
        ] {
            for change in changes {
                let (price, size, sequence) = parse_change(change)?;
                deltas.push(Delta {
                    instrument: instrument.clone(),
                    side,
                    price,
                    size,
                    sequence,
                });
            }
        }

        deltas.sort_by_key(|delta| delta.sequence);
        Ok(deltas)
    }
}

fn parse_change(change: &[String]) -> Result<(Price, Size, Sequence), Error> {
    let [price, size, sequence] = change else {
        return Err(Error::MalformedMessage(format!(
            "level2 change must be [price, size, sequence], got {} fields",
            change.len()
        )));
    };

    let price = Decimal::from_str(price)
        .map_err(|e| Error::MalformedMessage(format!("price {price:?}: {e}")))?;
    let size = Decimal::from_str(size)
        .map_err(|e| Error::MalformedMessage(format!("size {size:?}: {e}")))?;
    let sequence = sequence
        .parse::<Sequence>()
        .map_err(|e| Error::MalformedMessage(format!("sequence {sequence:?}: {e}")))?;

    if price.is_sign_negative() || size.is_sign_negative() {
        return Err(Error::MalformedMessage(format!(
            "negative price or size: {price} / {size}"
        )));
    }

    Ok((price, size, sequence))
}

/// Ticker push data
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickerData {
    /// Last trade price
    #[serde(default, deserialize_with = "deserialize_optional_decimal")]
    pub price: Option<Decimal>,
    /// Best bid
    #[serde(default, deserialize_with = "deserialize_optional_decimal")]
    pub best_bid: Option<Decimal>,
    /// Best ask
    #[serde(default, deserialize_with = "deserialize_optional_decimal")]
    pub best_ask: Option<Decimal>,
}

impl TickerData {
    /// Pair summary carried by this ticker
    pub fn summary(&self) -> PairSummary {
        PairSummary {
            close: self.price,
            bid: self.best_bid,
            ask: self.best_ask,
        }
    }
}

/// REST response envelope
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse<T> {
    /// `"200000"` on success
    pub code: String,
    /// Payload
    pub data: Option<T>,
    /// Error message when `code` is not a success
    #[serde(default)]
    pub msg: Option<String>,
}

/// Point-in-time order book snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Snapshot {
    /// Sequence the snapshot is consistent with
    #[serde(deserialize_with = "deserialize_sequence")]
    pub sequence: Sequence,
    /// Bid levels as (price, size)
    #[serde(default)]
    pub bids: Vec<(Price, Size)>,
    /// Ask levels as (price, size)
    #[serde(default)]
    pub asks: Vec<(Price, Size)>,
}

impl Snapshot {
    /// Build a snapshot from level lists
    pub fn new(sequence: Sequence, bids: Vec<(Price, Size)>, asks: Vec<(Price, Size)>) -> Self {
        Self {
            sequence,
            bids,
            asks,
        }
    }

    /// Levels of one side
    pub fn levels(&self, side: BookSide) -> &[(Price, Size)] {
        match side {
            BookSide::Bid => &self.bids,
            BookSide::Ask => &self.asks,
        }
    }
}

/// 24h statistics of a symbol
#[derive(Debug, Clone, Deserialize)]
pub struct StatsData {
    /// Venue symbol
    pub symbol: String,
    /// Best bid
    #[serde(default, deserialize_with = "deserialize_optional_decimal")]
    pub buy: Option<Decimal>,
    /// Best ask
    #[serde(default, deserialize_with = "deserialize_optional_decimal")]
    pub sell: Option<Decimal>,
    /// Last trade price
    #[serde(default, deserialize_with = "deserialize_optional_decimal")]
    pub last: Option<Decimal>,
}

impl StatsData {
    /// Pair summary carried by these stats
    pub fn summary(&self) -> PairSummary {
        PairSummary {
            close: self.last,
            bid: self.buy,
            ask: self.sell,
        }
    }
}

/// Trade fee of a symbol
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeFee {
    /// Venue symbol
    pub symbol: String,
    /// Taker fee rate
    pub taker_fee_rate: Decimal,
    /// Maker fee rate
    pub maker_fee_rate: Decimal,
}

/// Public WebSocket token
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulletToken {
    /// Token appended to the connect URL
    pub token: String,
    /// Servers to connect to
    pub instance_servers: Vec<InstanceServer>,
}

/// WebSocket server entry of a [`BulletToken`]
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceServer {
    /// `wss://` endpoint
    pub endpoint: String,
    /// Ping interval in milliseconds
    pub ping_interval: u64,
    /// Ping timeout in milliseconds
    #[serde(default)]
    pub ping_timeout: u64,
}

/// Deserialize a sequence sent either as a JSON number or a string
fn deserialize_sequence<'de, D>(deserializer: D) -> Result<Sequence, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(Sequence),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}
