//! WebSocket client for the venue's public market feed.
//!
//! This module provides:
//!
//! - [`WebSocketClient`] - a single connection: token handshake, welcome,
//!   subscriptions, keep-alive pings and message decoding
//! - [`FeedPump`] - a reconnecting loop that turns the raw feed into
//!   [`FeedEvent`]s on a channel, reports every lost link and replays
//!   subscriptions after reconnecting
//! - [`SubscriptionRequest`] - a level2 subscription handed to the pump,
//!   answered once the venue acknowledged it
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use l2book::client::{FeedPump, RestClient, SubscriptionRequest};
//! use l2book::Config;
//!
//! # async fn example() -> l2book::Result<()> {
//! let config = Config::new();
//! let rest = Arc::new(RestClient::new(&config)?);
//! let (events_tx, mut events_rx) = tokio::sync::mpsc::channel(4096);
//!
//! let (pump, subscriptions) = FeedPump::new(rest, config.reconnect().clone(), events_tx);
//! tokio::spawn(pump.run());
//!
//! let (request, acked) = SubscriptionRequest::new(vec!["BTC-USDT".parse()?]);
//! subscriptions.send(request).ok();
//! acked.await.map_err(|_| l2book::Error::ConnectionClosed)??;
//!
//! while let Some(event) = events_rx.recv().await {
//!     println!("{}", event.kind());
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::config::ReconnectConfig;
use crate::error::{ApiError, Error};
use crate::events::FeedEvent;
use crate::types::messages::{WsCommand, WsMessage, LEVEL2_TOPIC, TICKER_TOPIC};
use crate::types::Instrument;

use super::RestClient;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Most symbols the venue accepts in one topic
const MAX_TOPIC_SYMBOLS: usize = 100;

/// Fallback keep-alive interval when the token carries none
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(18);

/// Time allowed for the welcome message after connecting
const WELCOME_TIMEOUT: Duration = Duration::from_secs(10);

/// WebSocket connection to the public feed
///
/// # Thread Safety
///
/// This client is NOT thread-safe. [`FeedPump`] owns it exclusively and
/// receives new subscriptions over a channel.
#[derive(Debug)]
pub struct WebSocketClient {
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
    message_id: u64,
    ping_interval: Duration,
}

impl WebSocketClient {
    /// Connect to the public feed
    ///
    /// Requests a token over REST, opens the socket and waits for the
    /// server's welcome message.
    ///
    /// # Errors
    ///
    /// Returns an error if the token request or the handshake fails, or if
    /// no welcome arrives in time.
    pub async fn connect(rest: &RestClient) -> Result<Self, Error> {
        let token = rest.post_bullet_public().await?;
        let server = token
            .instance_servers
            .first()
            .ok_or_else(|| Error::Config("token response without instance servers".to_string()))?;

        let mut url = Url::parse(&server.endpoint)?;
        url.query_pairs_mut()
            .append_pair("token", &token.token)
            .append_pair("connectId", &connect_id().to_string());

        debug!(endpoint = %server.endpoint, "connecting to feed");
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url.as_str()).await?;
        let (write, read) = ws_stream.split();

        let ping_interval = match server.ping_interval {
            0 => DEFAULT_PING_INTERVAL,
            ms => Duration::from_millis(ms),
        };

        let mut client = Self {
            write,
            read,
            message_id: 1,
            ping_interval,
        };
        client.await_welcome().await?;
        Ok(client)
    }

    async fn await_welcome(&mut self) -> Result<(), Error> {
        let welcome = async {
            loop {
                match self.next().await {
                    Some(Ok(WsMessage::Welcome(_))) => return Ok(()),
                    Some(Ok(other)) => trace!(?other, "message before welcome"),
                    Some(Err(e)) => return Err(e),
                    None => return Err(Error::ConnectionClosed),
                }
            }
        };

        tokio::time::timeout(WELCOME_TIMEOUT, welcome)
            .await
            .map_err(|_| Error::Timeout)?
    }

    /// Send a command to the WebSocket server
    async fn send_command(&mut self, cmd: WsCommand) -> Result<u64, Error> {
        let msg_id = self.message_id;
        let json = serde_json::to_string(&cmd)?;
        self.write.send(Message::Text(json)).await?;
        self.message_id += 1;
        Ok(msg_id)
    }

    /// Subscribe to a channel for a set of instruments
    ///
    /// Large sets are split across several topics. Returns the id of every
    /// command sent with the instruments it covers; the server acknowledges
    /// each id separately.
    pub async fn subscribe(
        &mut self,
        prefix: &str,
        instruments: &[Instrument],
    ) -> Result<Vec<(u64, Vec<Instrument>)>, Error> {
        let mut sent = Vec::new();
        for chunk in instruments.chunks(MAX_TOPIC_SYMBOLS) {
            let cmd = WsCommand::subscribe(self.message_id, prefix, chunk);
            let id = self.send_command(cmd).await?;
            sent.push((id, chunk.to_vec()));
        }
        Ok(sent)
    }

    /// Subscribe to level2 deltas
    pub async fn subscribe_level2(
        &mut self,
        instruments: &[Instrument],
    ) -> Result<Vec<(u64, Vec<Instrument>)>, Error> {
        self.subscribe(LEVEL2_TOPIC, instruments).await
    }

    /// Subscribe to ticker updates
    pub async fn subscribe_ticker(
        &mut self,
        instruments: &[Instrument],
    ) -> Result<Vec<(u64, Vec<Instrument>)>, Error> {
        self.subscribe(TICKER_TOPIC, instruments).await
    }

    /// Send a keep-alive ping
    pub async fn ping(&mut self) -> Result<u64, Error> {
        let cmd = WsCommand::Ping {
            id: self.message_id,
        };
        self.send_command(cmd).await
    }

    /// Interval at which [`WebSocketClient::ping`] should be called
    pub fn ping_interval(&self) -> Duration {
        self.ping_interval
    }

    /// Receive the next message from the WebSocket
    ///
    /// # Returns
    ///
    /// The next message, or `None` if the connection is closed.
    pub async fn next(&mut self) -> Option<Result<WsMessage, Error>> {
        loop {
            match self.read.next().await? {
                Ok(Message::Text(text)) => {
                    return Some(serde_json::from_str(&text).map_err(|e| {
                        Error::MalformedMessage(format!("undecodable feed message: {e}"))
                    }));
                }
                Ok(Message::Ping(data)) => {
                    if let Err(e) = self.write.send(Message::Pong(data)).await {
                        return Some(Err(e.into()));
                    }
                }
                Ok(Message::Close(_)) => {
                    return Some(Err(Error::ConnectionClosed));
                }
                Ok(_) => continue,
                Err(e) => {
                    return Some(Err(e.into()));
                }
            }
        }
    }

    /// Close the WebSocket connection
    pub async fn close(&mut self) -> Result<(), Error> {
        self.write.close().await?;
        Ok(())
    }
}

fn connect_id() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default()
}

/// Reply to a [`SubscriptionRequest`]
pub type SubscriptionReply = oneshot::Sender<Result<(), Error>>;

/// Level2 subscription handed to a [`FeedPump`]
///
/// The reply is sent once the pump is connected and the venue acknowledged
/// every subscribe command outstanding at that point, so deltas for the
/// instruments are flowing when it resolves.
#[derive(Debug)]
pub struct SubscriptionRequest {
    /// Instruments to stream
    pub instruments: Vec<Instrument>,
    /// Resolved with the outcome
    pub reply: SubscriptionReply,
}

impl SubscriptionRequest {
    /// Build a request and the receiver of its reply
    pub fn new(instruments: Vec<Instrument>) -> (Self, oneshot::Receiver<Result<(), Error>>) {
        let (reply, acked) = oneshot::channel();
        (Self { instruments, reply }, acked)
    }
}

/// Level2 subscribe commands awaiting the server's ack, and the requests
/// waiting on them
#[derive(Debug, Default)]
struct AckTracker {
    outstanding: FxHashMap<u64, Vec<Instrument>>,
    waiters: Vec<(FxHashSet<u64>, SubscriptionReply)>,
}

impl AckTracker {
    fn sent(&mut self, commands: Vec<(u64, Vec<Instrument>)>) {
        self.outstanding.extend(commands);
    }

    /// Answer `reply` once every command sent so far is acknowledged
    fn wait(&mut self, reply: SubscriptionReply) {
        if self.outstanding.is_empty() {
            let _ = reply.send(Ok(()));
        } else {
            let ids = self.outstanding.keys().copied().collect();
            self.waiters.push((ids, reply));
        }
    }

    fn acknowledge(&mut self, id: u64) {
        if self.outstanding.remove(&id).is_none() {
            return;
        }
        for (mut ids, reply) in std::mem::take(&mut self.waiters) {
            ids.remove(&id);
            if ids.is_empty() {
                let _ = reply.send(Ok(()));
            } else {
                self.waiters.push((ids, reply));
            }
        }
    }

    /// Fail the requests waiting on `id`
    ///
    /// Returns the instruments of the rejected command.
    fn reject(&mut self, id: u64, code: Option<i64>, reason: &str) -> Vec<Instrument> {
        let Some(instruments) = self.outstanding.remove(&id) else {
            return Vec::new();
        };
        let status = code.and_then(|c| u16::try_from(c).ok()).unwrap_or(400);
        let code = code.map(|c| c.to_string()).unwrap_or_default();

        for (ids, reply) in std::mem::take(&mut self.waiters) {
            if ids.contains(&id) {
                let _ = reply.send(Err(Error::Api(ApiError::with_code(
                    status,
                    code.as_str(),
                    reason,
                ))));
            } else {
                self.waiters.push((ids, reply));
            }
        }
        instruments
    }

    /// The link is gone; nothing pending will be acknowledged
    fn fail_all(&mut self) {
        self.outstanding.clear();
        for (_, reply) in self.waiters.drain(..) {
            let _ = reply.send(Err(Error::ConnectionClosed));
        }
    }
}

/// Why a connection stopped being pumped
enum PumpExit {
    /// The link failed; reconnect
    LinkLost(Error),
    /// Nobody listens to events anymore; stop
    Shutdown,
}

/// Reconnecting feed loop.
///
/// The pump provides:
/// - Automatic reconnection with exponential backoff
/// - A [`FeedEvent::LinkDisconnected`] event for every lost connection
/// - Subscription replay after reconnection
///
/// New subscriptions arrive over the channel returned by [`FeedPump::new`].
/// Requests are only taken off the channel while connected, after the
/// replay, and each is answered once its subscribe commands and any replayed
/// ones are acknowledged.
pub struct FeedPump {
    rest: Arc<RestClient>,
    reconnect: ReconnectConfig,
    events: mpsc::Sender<FeedEvent>,
    requests: mpsc::UnboundedReceiver<SubscriptionRequest>,
    /// Instruments to replay after reconnection
    subscribed: Vec<Instrument>,
    tickers: bool,
}

impl std::fmt::Debug for FeedPump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedPump")
            .field("subscription_count", &self.subscribed.len())
            .field("tickers", &self.tickers)
            .finish()
    }
}

impl FeedPump {
    /// Create a pump and the channel used to request subscriptions
    pub fn new(
        rest: Arc<RestClient>,
        reconnect: ReconnectConfig,
        events: mpsc::Sender<FeedEvent>,
    ) -> (Self, mpsc::UnboundedSender<SubscriptionRequest>) {
        let (tx, requests) = mpsc::unbounded_channel();
        let pump = Self {
            rest,
            reconnect,
            events,
            requests,
            subscribed: Vec::new(),
            tickers: true,
        };
        (pump, tx)
    }

    /// Also subscribe to ticker updates for every instrument (default on)
    #[must_use]
    pub fn with_tickers(mut self, tickers: bool) -> Self {
        self.tickers = tickers;
        self
    }

    /// Run until the event receiver is dropped or reconnection gives up
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] once the reconnection policy is
    /// exhausted.
    pub async fn run(mut self) -> Result<(), Error> {
        let mut attempt = 0;

        loop {
            match WebSocketClient::connect(&self.rest).await {
                Ok(mut client) => {
                    let mut acks = AckTracker::default();
                    match self.replay(&mut client, &mut acks).await {
                        Ok(()) => {
                            info!(instruments = self.subscribed.len(), "feed connected");
                            attempt = 0;
                            let exit = self.pump(client, &mut acks).await;
                            acks.fail_all();
                            match exit {
                                PumpExit::Shutdown => return Ok(()),
                                PumpExit::LinkLost(e) => {
                                    warn!(error = %e, "feed link lost");
                                    if self.events.send(FeedEvent::LinkDisconnected).await.is_err() {
                                        return Ok(());
                                    }
                                }
                            }
                        }
                        Err(e) => warn!(error = %e, "replaying subscriptions failed"),
                    }
                }
                Err(e) => warn!(error = %e, attempt, "feed connect failed"),
            }

            if !self.reconnect.allows(attempt) {
                return Err(Error::ConnectionClosed);
            }
            tokio::time::sleep(self.reconnect.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }

    /// Replay all saved subscriptions on a new connection
    async fn replay(&self, client: &mut WebSocketClient, acks: &mut AckTracker) -> Result<(), Error> {
        if self.subscribed.is_empty() {
            return Ok(());
        }
        acks.sent(client.subscribe_level2(&self.subscribed).await?);
        if self.tickers {
            client.subscribe_ticker(&self.subscribed).await?;
        }
        Ok(())
    }

    async fn add_subscriptions(
        &mut self,
        client: &mut WebSocketClient,
        acks: &mut AckTracker,
        requested: Vec<Instrument>,
    ) -> Result<(), Error> {
        let fresh: Vec<Instrument> = {
            let mut known: FxHashSet<Instrument> = self.subscribed.iter().cloned().collect();
            requested
                .into_iter()
                .filter(|instrument| known.insert(instrument.clone()))
                .collect()
        };
        if fresh.is_empty() {
            return Ok(());
        }

        acks.sent(client.subscribe_level2(&fresh).await?);
        if self.tickers {
            client.subscribe_ticker(&fresh).await?;
        }
        debug!(count = fresh.len(), "subscribe sent");
        self.subscribed.extend(fresh);
        Ok(())
    }

    async fn pump(&mut self, mut client: WebSocketClient, acks: &mut AckTracker) -> PumpExit {
        let mut ping = tokio::time::interval(client.ping_interval());
        ping.tick().await;

        loop {
            tokio::select! {
                message = client.next() => match message {
                    Some(Ok(WsMessage::Message(topic))) => match topic.into_feed_events() {
                        Ok(events) => {
                            for event in events {
                                if self.events.send(event).await.is_err() {
                                    return PumpExit::Shutdown;
                                }
                            }
                        }
                        Err(e) => warn!(error = %e, "dropping feed message"),
                    },
                    Some(Ok(WsMessage::Ack(ack))) => {
                        if let Some(id) = ack.message_id() {
                            acks.acknowledge(id);
                        }
                    }
                    Some(Ok(WsMessage::Error(err))) => {
                        warn!(code = ?err.code, data = ?err.data, "feed error message");
                        if let Some(id) = err.message_id() {
                            let reason = err.data.as_deref().unwrap_or("subscribe rejected");
                            let rejected = acks.reject(id, err.code, reason);
                            self.subscribed.retain(|instrument| !rejected.contains(instrument));
                        }
                    }
                    Some(Ok(other)) => trace!(?other, "control message"),
                    Some(Err(Error::MalformedMessage(reason))) => {
                        warn!(%reason, "dropping feed message");
                    }
                    Some(Err(e)) => return PumpExit::LinkLost(e),
                    None => return PumpExit::LinkLost(Error::ConnectionClosed),
                },
                request = self.requests.recv() => match request {
                    Some(request) => {
                        match self.add_subscriptions(&mut client, acks, request.instruments).await {
                            Ok(()) => acks.wait(request.reply),
                            Err(e) => {
                                let _ = request.reply.send(Err(Error::ConnectionClosed));
                                return PumpExit::LinkLost(e);
                            }
                        }
                    }
                    // Every transport handle is gone
                    None => return PumpExit::Shutdown,
                },
                _ = ping.tick() => {
                    if let Err(e) = client.ping().await {
                        return PumpExit::LinkLost(e);
                    }
                }
            }
        }
    }
}
