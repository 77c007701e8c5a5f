//! podkit-ws: multiplexed, self-healing WebSocket subscriptions for pod.
//!
//! # Features
//! - One socket shared by every subscription, owned by a background task
//! - Identical subscriptions deduplicated by canonical `(channel, params)` key
//! - Reconnect under a [`ReconnectPolicy`](podkit_core::policy::ReconnectPolicy),
//!   re-subscribing everything before new pushes are read
//! - Typed, bounded, cancellable streams for order books, bids, auction bids
//!   and confirmed receipts
//!
//! ```no_run
//! use futures::StreamExt;
//! use podkit_ws::{StreamEvent, WsClient, WsConfig};
//!
//! # async fn run() -> Result<(), podkit_ws::WsError> {
//! let client = WsClient::connect(WsConfig::new("wss://rpc.v1.dev.pod.network"));
//! let mut books = client.subscribe_orderbook(["0xab"], Some(10)).await?;
//! while let Some(event) = books.next().await {
//!     if let StreamEvent::Data(book) = event? {
//!         println!("{} best bid {:?}", book.clob_id, book.best_bid());
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod client;
pub mod connection;
pub mod error;
pub mod events;
mod frame;
mod multiplexer;
pub mod stream;
pub mod transport;

pub use channel::{Channel, SubscriptionParams, DEFAULT_ORDERBOOK_DEPTH};
pub use client::{WsClient, WsConfig};
pub use connection::ConnectionState;
pub use error::WsError;
pub use events::{AuctionBidEvent, BidEvent, Decode, OrderBookUpdate, ReceiptEvent};
pub use stream::{StreamEvent, SubscriptionStream};
pub use transport::WsConnector;
