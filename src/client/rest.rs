//! HTTP REST client for the venue's public market endpoints.
//!
//! This module provides the [`RestClient`] used for snapshots, pair
//! summaries, fee rates, the symbol listing and the WebSocket token.
//!
//! # Example
//!
//! ```rust,no_run
//! use l2book::client::RestClient;
//! use l2book::types::Instrument;
//! use l2book::Config;
//!
//! # async fn example() -> l2book::Result<()> {
//! let rest = RestClient::new(&Config::new())?;
//! let snapshot = rest.get_level2_snapshot(&Instrument::new("BTC", "USDT")).await?;
//! println!("sequence {}", snapshot.sequence);
//! # Ok(())
//! # }
//! ```

use std::str::FromStr;

use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use rust_decimal::Decimal;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use tracing::{debug, trace};
use url::Url;

use crate::config::Config;
use crate::error::{ApiError, Error};
use crate::types::messages::{ApiResponse, BulletToken, StatsData, TradeFee, SUCCESS_CODE};
use crate::types::{Instrument, Snapshot, SymbolInfo};

const BULLET_PUBLIC_PATH: &str = "/api/v1/bullet-public";
const LEVEL2_SNAPSHOT_PATH: &str = "/api/v1/market/orderbook/level2_100";
const STATS_PATH: &str = "/api/v1/market/stats";
const TRADE_FEES_PATH: &str = "/api/v1/trade-fees";
const SYMBOLS_PATH: &str = "/api/v2/symbols";

/// HTTP client for the venue REST API
#[derive(Debug)]
pub struct RestClient {
    client: Client,
    base_url: Url,
    fee_batch_size: usize,
}

impl RestClient {
    /// Create a new REST client
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL is invalid or the HTTP client cannot
    /// be initialized.
    pub fn new(config: &Config) -> Result<Self, Error> {
        Self::with_base_url(config, config.rest_base_url())
    }

    /// Create a client against a custom base URL
    ///
    /// # Errors
    ///
    /// Returns an error if `base_url` does not parse or the HTTP client
    /// cannot be initialized.
    pub fn with_base_url(config: &Config, base_url: &str) -> Result<Self, Error> {
        let client = Client::builder().timeout(config.timeout()).build()?;

        Ok(Self {
            client,
            base_url: Url::parse(base_url)?,
            fee_batch_size: config.fee_batch_size(),
        })
    }

    fn url(&self, path: &str, query: &[(&str, &str)]) -> Result<Url, Error> {
        let mut url = self.base_url.join(path)?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    /// Make a GET request and unwrap the response envelope
    pub async fn get<T>(&self, path: &str, query: &[(&str, &str)]) -> Result<T, Error>
    where
        T: DeserializeOwned,
    {
        let url = self.url(path, query)?;
        trace!(%url, "GET");
        let response = self.client.get(url).send().await?;
        self.handle_response(response).await
    }

    /// Make a bodiless POST request and unwrap the response envelope
    pub async fn post<T>(&self, path: &str) -> Result<T, Error>
    where
        T: DeserializeOwned,
    {
        let url = self.url(path, &[])?;
        trace!(%url, "POST");
        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .send()
            .await?;
        self.handle_response(response).await
    }

    /// Handle the HTTP response, checking for errors
    async fn handle_response<T>(&self, response: reqwest::Response) -> Result<T, Error>
    where
        T: DeserializeOwned,
    {
        let status = response.status();

        if status.as_u16() == 429 {
            let retry_after_ms = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(|secs| secs * 1000);

            return Err(Error::RateLimited { retry_after_ms });
        }

        let body = response.text().await?;
        parse_envelope(status.as_u16(), &body)
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    /// Request a token for the public WebSocket
    pub async fn post_bullet_public(&self) -> Result<BulletToken, Error> {
        self.post(BULLET_PUBLIC_PATH).await
    }

    /// Get the top 100 levels of each side
    pub async fn get_level2_snapshot(&self, instrument: &Instrument) -> Result<Snapshot, Error> {
        let symbol = instrument.symbol();
        self.get(LEVEL2_SNAPSHOT_PATH, &[("symbol", symbol.as_str())]).await
    }

    /// Get 24h statistics of one symbol
    pub async fn get_stats(&self, instrument: &Instrument) -> Result<StatsData, Error> {
        let symbol = instrument.symbol();
        self.get(STATS_PATH, &[("symbol", symbol.as_str())]).await
    }

    /// Get taker fee rates, batching symbols per request
    ///
    /// Symbols the venue does not return are absent from the map.
    pub async fn get_trade_fees(
        &self,
        instruments: &[Instrument],
    ) -> Result<FxHashMap<Instrument, Decimal>, Error> {
        let mut fees = FxHashMap::default();

        for chunk in instruments.chunks(self.fee_batch_size) {
            let symbols: Vec<String> = chunk.iter().map(Instrument::symbol).collect();
            let joined = symbols.join(",");
            let batch: Vec<TradeFee> = self
                .get(TRADE_FEES_PATH, &[("symbols", joined.as_str())])
                .await?;

            for fee in batch {
                match Instrument::from_str(&fee.symbol) {
                    Ok(instrument) => {
                        fees.insert(instrument, fee.taker_fee_rate);
                    }
                    Err(e) => debug!(symbol = %fee.symbol, error = %e, "skipping fee entry"),
                }
            }
        }

        Ok(fees)
    }

    /// List all symbols
    pub async fn get_symbols(&self) -> Result<Vec<SymbolInfo>, Error> {
        self.get(SYMBOLS_PATH, &[]).await
    }
}

/// Unwrap the `{code, data, msg}` envelope
fn parse_envelope<T>(status: u16, body: &str) -> Result<T, Error>
where
    T: DeserializeOwned,
{
    let envelope: ApiResponse<T> = match serde_json::from_str(body) {
        Ok(envelope) => envelope,
        Err(e) if (200..300).contains(&status) => return Err(Error::Json(e)),
        Err(_) => return Err(Error::Api(ApiError::new(status, body))),
    };

    if envelope.code != SUCCESS_CODE {
        let message = envelope.msg.unwrap_or_else(|| body.to_string());
        return Err(Error::Api(ApiError::with_code(status, envelope.code, message)));
    }

    envelope.data.ok_or_else(|| {
        Error::Api(ApiError::with_code(
            status,
            SUCCESS_CODE,
            "response without data",
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_success() {
        let body = r#"{"code":"200000","data":{"symbol":"BTC-USDT","buy":"100","sell":"101","last":"100.5"}}"#;
        let stats: StatsData = parse_envelope(200, body).unwrap();
        assert_eq!(stats.symbol, "BTC-USDT");
        assert_eq!(stats.summary().close, Some("100.5".parse().unwrap()));
    }

    #[test]
    fn test_envelope_error_code() {
        let body = r#"{"code":"400100","msg":"symbol not exists"}"#;
        match parse_envelope::<StatsData>(400, body) {
            Err(Error::Api(api)) => {
                assert_eq!(api.code.as_deref(), Some("400100"));
                assert_eq!(api.message, "symbol not exists");
                assert!(api.is_client_error());
            }
            other => panic!("Expected Api error, got {other:?}"),
        }
    }

    #[test]
    fn test_envelope_non_json_error() {
        match parse_envelope::<StatsData>(502, "Bad Gateway") {
            Err(Error::Api(api)) => assert!(api.is_server_error()),
            other => panic!("Expected Api error, got {other:?}"),
        }
    }

    #[test]
    fn test_snapshot_envelope() {
        let body = r#"{"code":"200000","data":{
            "sequence":"3262786978",
            "time":1550653727731,
            "bids":[["6500.12","0.45054140"],["6500.11","0.45054140"]],
            "asks":[["6500.16","0.57753524"]]
        }}"#;
        let snapshot: Snapshot = parse_envelope(200, body).unwrap();
        assert_eq!(snapshot.sequence, 3_262_786_978);
        assert_eq!(snapshot.bids.len(), 2);
        assert_eq!(snapshot.asks[0].0, "6500.16".parse::<Decimal>().unwrap());
    }

    #[test]
    fn test_url_building() {
        let rest = RestClient::with_base_url(&Config::new(), "https://example.com").unwrap();
        let url = rest
            .url(TRADE_FEES_PATH, &[("symbols", "BTC-USDT,ETH-USDT")])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://example.com/api/v1/trade-fees?symbols=BTC-USDT%2CETH-USDT"
        );
    }
}
