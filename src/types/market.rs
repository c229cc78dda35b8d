//! Instrument identity and static market metadata.
//!
//! An [`Instrument`] is the (base, quote) pair used as the registry key.
//! [`SymbolInfo`] is the venue's symbol listing entry, from which
//! [`InstrumentMetadata`] (trading increments and fee) is derived.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A tradable base/quote asset pair
///
/// Serialized as the venue symbol `BASE-QUOTE`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Instrument {
    base: String,
    quote: String,
}

impl Instrument {
    /// Create an instrument from its base and quote assets
    pub fn new(base: impl Into<String>, quote: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            quote: quote.into(),
        }
    }

    /// Base asset (the one being bought or sold)
    #[must_use]
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Quote asset (the one prices are expressed in)
    #[must_use]
    pub fn quote(&self) -> &str {
        &self.quote
    }

    /// Venue symbol, e.g. `BTC-USDT`
    #[must_use]
    pub fn symbol(&self) -> String {
        format!("{}-{}", self.base, self.quote)
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.base, self.quote)
    }
}

impl FromStr for Instrument {
    type Err = Error;

    fn from_str(symbol: &str) -> Result<Self, Self::Err> {
        let mut parts = symbol.split('-');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(base), Some(quote), None) if !base.is_empty() && !quote.is_empty() => {
                Ok(Self::new(base, quote))
            }
            _ => Err(Error::MalformedMessage(format!(
                "invalid instrument symbol: {symbol:?}"
            ))),
        }
    }
}

impl TryFrom<String> for Instrument {
    type Error = Error;

    fn try_from(symbol: String) -> Result<Self, Self::Error> {
        symbol.parse()
    }
}

impl From<Instrument> for String {
    fn from(instrument: Instrument) -> Self {
        instrument.symbol()
    }
}

/// Static trading parameters of an instrument
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstrumentMetadata {
    /// Minimum step for base asset quantities
    pub base_increment: Option<Decimal>,
    /// Minimum step for quote asset quantities
    pub quote_increment: Option<Decimal>,
    /// Minimum step between price levels
    pub price_increment: Option<Decimal>,
    /// Taker fee rate, filled asynchronously when unknown at creation
    pub fee: Option<Decimal>,
}

impl InstrumentMetadata {
    /// Set the fee rate
    #[must_use]
    pub fn with_fee(mut self, fee: Decimal) -> Self {
        self.fee = Some(fee);
        self
    }
}

/// Latest 24h summary of a pair: last trade price and top of book
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PairSummary {
    /// Last trade price
    pub close: Option<Decimal>,
    /// Best bid
    pub bid: Option<Decimal>,
    /// Best ask
    pub ask: Option<Decimal>,
}

/// Symbol listing entry from the venue's REST API
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolInfo {
    /// Venue symbol, e.g. `BTC-USDT`
    pub symbol: String,
    /// Base asset
    pub base_currency: String,
    /// Quote asset
    pub quote_currency: String,
    /// Base quantity step
    #[serde(default, deserialize_with = "deserialize_optional_decimal")]
    pub base_increment: Option<Decimal>,
    /// Quote quantity step
    #[serde(default, deserialize_with = "deserialize_optional_decimal")]
    pub quote_increment: Option<Decimal>,
    /// Price step
    #[serde(default, deserialize_with = "deserialize_optional_decimal")]
    pub price_increment: Option<Decimal>,
    /// Whether the symbol accepts orders
    #[serde(default)]
    pub enable_trading: bool,
}

impl SymbolInfo {
    /// Instrument identity of this listing
    pub fn instrument(&self) -> Instrument {
        Instrument::new(&self.base_currency, &self.quote_currency)
    }

    /// Static metadata of this listing (fee is not part of the listing)
    pub fn metadata(&self) -> InstrumentMetadata {
        InstrumentMetadata {
            base_increment: self.base_increment,
            quote_increment: self.quote_increment,
            price_increment: self.price_increment,
            fee: None,
        }
    }
}

/// Deserialize helper that treats missing, null and empty strings as None
pub(crate) fn deserialize_optional_decimal<'de, D>(
    deserializer: D,
) -> Result<Option<Decimal>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let opt: Option<String> = Option::deserialize(deserializer)?;
    match opt {
        None => Ok(None),
        Some(s) if s.is_empty() => Ok(None),
        Some(s) => Decimal::from_str(&s)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instrument_symbol_roundtrip() {
        let inst: Instrument = "BTC-USDT".parse().unwrap();
        assert_eq!(inst.base(), "BTC");
        assert_eq!(inst.quote(), "USDT");
        assert_eq!(inst.symbol(), "BTC-USDT");
        assert_eq!(inst.to_string(), "BTC-USDT");
    }

    #[test]
    fn test_instrument_rejects_bad_symbols() {
        for bad in ["BTCUSDT", "BTC-", "-USDT", "A-B-C", ""] {
            assert!(
                matches!(bad.parse::<Instrument>(), Err(Error::MalformedMessage(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_instrument_serde_as_symbol() {
        let inst = Instrument::new("ETH", "BTC");
        let json = serde_json::to_string(&inst).unwrap();
        assert_eq!(json, "\"ETH-BTC\"");
        let back: Instrument = serde_json::from_str(&json).unwrap();
        assert_eq!(back, inst);
    }

    #[test]
    fn test_symbol_info_deserialization() {
        let json = r#"{
            "symbol": "KCS-USDT",
            "name": "KCS-USDT",
            "baseCurrency": "KCS",
            "quoteCurrency": "USDT",
            "baseIncrement": "0.0001",
            "quoteIncrement": "0.000001",
            "priceIncrement": "0.001",
            "feeCurrency": "USDT",
            "enableTrading": true
        }"#;

        let info: SymbolInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.instrument(), Instrument::new("KCS", "USDT"));
        let meta = info.metadata();
        assert_eq!(meta.price_increment, Some("0.001".parse().unwrap()));
        assert_eq!(meta.fee, None);
        assert!(info.enable_trading);
    }

    #[test]
    fn test_symbol_info_empty_increment() {
        let json = r#"{
            "symbol": "X-Y",
            "baseCurrency": "X",
            "quoteCurrency": "Y",
            "baseIncrement": "",
            "enableTrading": false
        }"#;

        let info: SymbolInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.base_increment, None);
        assert_eq!(info.price_increment, None);
    }
}
