//! Transport traits: request/response RPC and the duplex socket connector.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Sink, Stream};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::TransportError;
use crate::request::{JsonRpcRequest, JsonRpcResponse};

/// The request/response trait every JSON-RPC transport implements.
///
/// Object-safe, so it can be stored as `Arc<dyn RpcTransport>`.
#[async_trait]
pub trait RpcTransport: Send + Sync + 'static {
    /// Send a single JSON-RPC request and return the response.
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError>;

    /// Return the transport's identifier (URL or name).
    fn url(&self) -> &str;
}

/// Call a method and deserialize its result.
///
/// A free function rather than a trait method so `RpcTransport` stays object-safe.
pub async fn call<T: DeserializeOwned>(
    transport: &dyn RpcTransport,
    id: u64,
    method: &str,
    params: Vec<Value>,
) -> Result<T, TransportError> {
    let req = JsonRpcRequest::new(id, method, params);
    let resp = transport.send(req).await?;
    let result = resp.into_result().map_err(TransportError::Rpc)?;
    serde_json::from_value(result).map_err(TransportError::from)
}

/// Outbound half of a socket: text frames in, `close()` on shutdown.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;

/// Inbound half of a socket. The stream ending (or yielding an error) is the
/// close notification.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// Opens duplex message channels to a node.
///
/// Called once for the initial connection and again for every reconnect
/// attempt; each call must produce a fresh, independent socket.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<(FrameSink, FrameStream), TransportError>;

    fn url(&self) -> &str;
}
