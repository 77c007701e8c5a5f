//! podkit-core: shared building blocks for the podkit SDK.
//!
//! - [`policy`]: polling and reconnect schedules (pure functions)
//! - [`RpcTransport`] / [`Connector`]: request/response and duplex transport seams
//! - [`ReceiptFetcher`] / [`GasPriceSource`]: read-side interfaces
//! - [`PodRpc`]: typed JSON-RPC facade over any transport
//! - [`SdkConfig`] and [`telemetry`]: configuration and logging setup

pub mod config;
pub mod error;
pub mod fetcher;
pub mod policy;
pub mod request;
pub mod rpc;
pub mod telemetry;
pub mod transport;
pub mod types;

pub use config::SdkConfig;
pub use error::{ConfigError, TransportError};
pub use fetcher::{GasPriceSource, ReceiptFetcher};
pub use request::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RpcId};
pub use rpc::PodRpc;
pub use transport::{Connector, FrameSink, FrameStream, RpcTransport};
pub use types::{Receipt, TxHash};
