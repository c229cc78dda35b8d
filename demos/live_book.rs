//! Live order book - calibrates books from the public feed and prints the top
//!
//! Usage:
//!   cargo run --example live_book
//!
//! Optional:
//!   L2BOOK_ENV=sandbox              # Use sandbox environment (default: production)
//!   L2BOOK_SYMBOLS=BTC-USDT,ETH-USDT  # Instruments to track (default: BTC-USDT)
//!   L2BOOK_ALL=1                    # Track every tradable listing instead

use std::time::{Duration, Instant};

use l2book::client::RestClient;
use l2book::config::Environment;
use l2book::types::{BookSide, Instrument, InstrumentMetadata};
use l2book::{Config, Engine};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing for debug output
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("l2book=info".parse()?),
        )
        .init();

    let env = match std::env::var("L2BOOK_ENV")
        .unwrap_or_default()
        .to_lowercase()
        .as_str()
    {
        "sandbox" => Environment::Sandbox,
        _ => Environment::Production,
    };

    println!("=== Live Level-2 Books ===\n");

    let config = Config::new().with_environment(env);
    let engine = Engine::connect(config.clone())?;

    // Choose instruments: every tradable listing, or an explicit list
    let instruments = if std::env::var("L2BOOK_ALL").is_ok() {
        println!("Loading listings...");
        let rest = RestClient::new(&config)?;
        let symbols = rest.get_symbols().await?;
        let instruments = engine.registry().ensure_from_symbols(&symbols);
        println!("Tracking {} tradable instruments", instruments.len());
        instruments
    } else {
        let symbols = std::env::var("L2BOOK_SYMBOLS").unwrap_or_else(|_| "BTC-USDT".into());
        let mut instruments = Vec::new();
        for symbol in symbols.split(',') {
            let instrument: Instrument = symbol.trim().parse()?;
            engine
                .registry()
                .ensure(instrument.clone(), InstrumentMetadata::default());
            instruments.push(instrument);
        }
        instruments
    };

    match engine.registry().backfill_missing_fees().await {
        Ok(report) => println!(
            "Fees: {} filled, {} unresolved",
            report.filled.len(),
            report.unresolved.len()
        ),
        Err(e) => println!("Fee backfill failed: {}", e),
    }

    println!("\nSubscribing and calibrating...");
    let start = Instant::now();
    engine.subscribe(&instruments)?;
    while !engine.is_calibrated() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    println!("Calibrated in {:.1}s\n", start.elapsed().as_secs_f64());

    println!("=== Top of Book ===");
    println!("(Press Ctrl+C to stop)\n");

    let mut ticker = tokio::time::interval(Duration::from_secs(2));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for instrument in &instruments {
                    print_top(&engine, instrument);
                }
                println!();

                let report = engine.refresh_stale().await;
                if !report.failures.is_empty() {
                    println!("{} summary refreshes failed", report.failures.len());
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down");
                break;
            }
        }
    }

    Ok(())
}

fn print_top(engine: &Engine, instrument: &Instrument) {
    let bids = engine.view(instrument, BookSide::Bid);
    let asks = engine.view(instrument, BookSide::Ask);
    let gaps = engine
        .missing_sequences(instrument)
        .map(|m| m.len())
        .unwrap_or(0);

    match (bids, asks) {
        (Ok(bids), Ok(asks)) => {
            let (bid, bid_size) = bids.best();
            let (ask, ask_size) = asks.best();
            println!(
                "{:>12} | {} x {} | {} x {} | spread {} | levels {}/{} | gaps {}",
                instrument.to_string(),
                bid_size,
                bid,
                ask,
                ask_size,
                ask - bid,
                bids.len(),
                asks.len(),
                gaps
            );
        }
        (Err(e), _) | (_, Err(e)) => println!("{:>12} | {}", instrument.to_string(), e),
    }
}
