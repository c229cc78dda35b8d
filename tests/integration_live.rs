//! Integration tests against the live venue.
//!
//! These tests hit the public market data endpoints; no credentials are
//! needed, but they are skipped unless explicitly enabled.
//!
//! # Running
//!
//! ```bash
//! L2BOOK_LIVE=1 cargo test --test integration_live
//! ```
//!
//! Set `L2BOOK_ENV=sandbox` to run against the sandbox instead.

use std::time::Duration;

use l2book::client::{RestClient, WebSocketClient};
use l2book::config::Environment;
use l2book::types::{BookSide, Instrument, InstrumentMetadata, WsMessage};
use l2book::{Config, Engine};

/// Helper to build a config from environment variables
fn live_config() -> Option<Config> {
    std::env::var("L2BOOK_LIVE").ok()?;
    let environment = match std::env::var("L2BOOK_ENV")
        .unwrap_or_default()
        .to_lowercase()
        .as_str()
    {
        "sandbox" => Environment::Sandbox,
        _ => Environment::Production,
    };
    Some(Config::new().with_environment(environment))
}

/// Skip test if live runs are not enabled
macro_rules! require_live {
    () => {
        match live_config() {
            Some(c) => c,
            None => {
                eprintln!("Skipping test: L2BOOK_LIVE not set");
                return;
            }
        }
    };
}

fn btc() -> Instrument {
    Instrument::new("BTC", "USDT")
}

#[tokio::test]
async fn test_get_symbols() {
    let config = require_live!();
    let rest = RestClient::new(&config).unwrap();

    let symbols = rest.get_symbols().await;
    assert!(symbols.is_ok(), "Failed to get symbols: {:?}", symbols);

    let symbols = symbols.unwrap();
    println!("Got {} symbols", symbols.len());
    assert!(symbols.iter().any(|s| s.instrument() == btc()));
}

#[tokio::test]
async fn test_get_level2_snapshot() {
    let config = require_live!();
    let rest = RestClient::new(&config).unwrap();

    let snapshot = rest.get_level2_snapshot(&btc()).await.unwrap();
    println!(
        "Snapshot at {}: {} bids, {} asks",
        snapshot.sequence,
        snapshot.bids.len(),
        snapshot.asks.len()
    );
    assert!(!snapshot.bids.is_empty());
    assert!(!snapshot.asks.is_empty());
    assert!(snapshot.bids[0].0 < snapshot.asks[0].0);
}

#[tokio::test]
async fn test_websocket_subscribe_level2() {
    let config = require_live!();
    let rest = RestClient::new(&config).unwrap();

    let mut ws = WebSocketClient::connect(&rest).await.unwrap();
    ws.subscribe_level2(&[btc()]).await.unwrap();

    let got_update = tokio::time::timeout(Duration::from_secs(15), async {
        while let Some(msg) = ws.next().await {
            if let Ok(WsMessage::Message(msg)) = msg {
                println!("Received {} on {}", msg.subject, msg.topic);
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false);

    let _ = ws.close().await;
    assert!(got_update, "no level2 update within 15s");
}

#[tokio::test]
async fn test_engine_calibrates() {
    let config = require_live!();
    let engine = Engine::connect(config).unwrap();

    engine.registry().ensure(btc(), InstrumentMetadata::default());
    engine.subscribe(&[btc()]).unwrap();

    let calibrated = tokio::time::timeout(Duration::from_secs(30), async {
        while !engine.is_calibrated() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
    assert!(calibrated.is_ok(), "engine did not calibrate within 30s");

    let bids = engine.view(&btc(), BookSide::Bid).unwrap();
    let asks = engine.view(&btc(), BookSide::Ask).unwrap();
    println!("BTC-USDT best bid {:?} best ask {:?}", bids.best(), asks.best());
    assert!(bids.best().0 < asks.best().0);
}
