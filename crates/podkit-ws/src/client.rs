//! `WsClient`: typed subscriptions over one shared, self-healing connection.

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, U256};
use podkit_core::config::WsSettings;
use podkit_core::policy::ReconnectPolicy;
use podkit_core::{Connector, SdkConfig};
use serde_json::Value;
use tokio::sync::watch;
use tracing::info;

use crate::channel::{
    AuctionBidsParams, BidsParams, Channel, OrderbookParams, ReceiptsParams, SubscriptionParams,
    DEFAULT_ORDERBOOK_DEPTH,
};
use crate::connection::{Connection, ConnectionState};
use crate::error::WsError;
use crate::events::{AuctionBidEvent, BidEvent, OrderBookUpdate, ReceiptEvent};
use crate::multiplexer::{Multiplexer, SharedRegistry};
use crate::stream::SubscriptionStream;
use crate::transport::WsConnector;

/// Configuration for the WebSocket client.
#[derive(Debug, Clone, PartialEq)]
pub struct WsConfig {
    pub url: String,
    pub reconnect: ReconnectPolicy,
    /// Distinct server-side subscriptions allowed at once.
    pub max_subscriptions: usize,
    /// Per-consumer buffer; data arriving while it is full is dropped.
    pub buffer_size: usize,
    /// How long a subscribe waits for its acknowledgement.
    pub request_timeout: Duration,
}

impl WsConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self::from_settings(url, ReconnectPolicy::default(), &WsSettings::default())
    }

    pub fn from_settings(url: impl Into<String>, reconnect: ReconnectPolicy, ws: &WsSettings) -> Self {
        Self {
            url: url.into(),
            reconnect,
            max_subscriptions: ws.max_subscriptions,
            buffer_size: ws.buffer_size,
            request_timeout: Duration::from_millis(ws.request_timeout_ms),
        }
    }

    pub fn from_sdk(config: &SdkConfig) -> Self {
        Self::from_settings(config.network.ws_url.clone(), config.reconnect, &config.ws)
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }
}

/// WebSocket subscription client.
///
/// A background task owns the socket, reconnects under the configured policy
/// and re-issues every live subscription before reading again. Dropping the
/// client shuts that task down; open streams then end with `ConnectionClosed`.
pub struct WsClient {
    inner: Arc<Multiplexer>,
    url: String,
}

impl WsClient {
    /// Start connecting to `config.url`. Must be called inside a tokio runtime.
    pub fn connect(config: WsConfig) -> Self {
        let connector = Arc::new(WsConnector::new(config.url.clone()));
        Self::with_connector(connector, config)
    }

    /// Start the client over any socket connector.
    pub fn with_connector(connector: Arc<dyn Connector>, config: WsConfig) -> Self {
        let registry = SharedRegistry::default();
        let connection = Connection::spawn(
            connector,
            config.reconnect,
            Arc::clone(&registry),
            config.request_timeout,
        );
        let inner = Arc::new(Multiplexer::new(
            registry,
            connection,
            config.max_subscriptions,
            config.buffer_size,
            config.request_timeout,
        ));
        info!(url = %config.url, "websocket client started");
        Self { inner, url: config.url }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Order book snapshots for `clob_ids` (all books when empty). `depth`
    /// defaults to [`DEFAULT_ORDERBOOK_DEPTH`] levels per side.
    pub async fn subscribe_orderbook<I, S>(
        &self,
        clob_ids: I,
        depth: Option<u32>,
    ) -> Result<SubscriptionStream<OrderBookUpdate>, WsError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let params = OrderbookParams {
            clob_ids: clob_ids.into_iter().map(Into::into).collect(),
            depth: depth.unwrap_or(DEFAULT_ORDERBOOK_DEPTH),
        };
        self.inner.subscribe(SubscriptionParams::Orderbook(params)).await
    }

    pub async fn subscribe_bids<I, S>(&self, clob_ids: I) -> Result<SubscriptionStream<BidEvent>, WsError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let params = BidsParams {
            clob_ids: clob_ids.into_iter().map(Into::into).collect(),
        };
        self.inner.subscribe(SubscriptionParams::Bids(params)).await
    }

    pub async fn subscribe_auction_bids(
        &self,
        auction_id: Option<U256>,
    ) -> Result<SubscriptionStream<AuctionBidEvent>, WsError> {
        self.inner
            .subscribe(SubscriptionParams::AuctionBids(AuctionBidsParams { auction_id }))
            .await
    }

    /// Confirmed receipts, optionally only those sent from or to `account`.
    pub async fn subscribe_receipts(
        &self,
        account: Option<Address>,
    ) -> Result<SubscriptionStream<ReceiptEvent>, WsError> {
        self.inner
            .subscribe(SubscriptionParams::Receipts(ReceiptsParams { account }))
            .await
    }

    /// Untyped subscription; `params` are validated against the channel.
    pub async fn subscribe_raw(
        &self,
        channel: Channel,
        params: Option<Value>,
    ) -> Result<SubscriptionStream<Value>, WsError> {
        let params = SubscriptionParams::parse(channel, params)?;
        self.inner.subscribe(params).await
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.connection().state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection().watch()
    }

    /// Distinct server-side subscriptions currently held.
    pub fn subscription_count(&self) -> usize {
        self.inner.subscription_count()
    }

    /// Streams attached across all subscriptions.
    pub fn consumer_count(&self) -> usize {
        self.inner.consumer_count()
    }

    /// Close the socket and end every stream. Idempotent.
    pub async fn shutdown(&self) {
        self.inner.connection().shutdown().await;
    }
}

impl std::fmt::Debug for WsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsClient")
            .field("url", &self.url)
            .field("state", &self.state())
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}
