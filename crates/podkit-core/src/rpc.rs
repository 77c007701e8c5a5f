//! Typed facade over an [`RpcTransport`] for the handful of calls the SDK needs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use alloy_primitives::hex;
use async_trait::async_trait;
use serde_json::Value;

use crate::error::TransportError;
use crate::fetcher::{GasPriceSource, ReceiptFetcher};
use crate::transport::{call, RpcTransport};
use crate::types::{parse_quantity, Receipt, TxHash};

/// JSON-RPC client for a pod node.
///
/// Cheap to clone; clones share the transport and the request-id counter.
pub struct PodRpc<T: RpcTransport> {
    transport: Arc<T>,
    next_id: Arc<AtomicU64>,
}

impl<T: RpcTransport> Clone for PodRpc<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

impl<T: RpcTransport> PodRpc<T> {
    pub fn new(transport: T) -> Self {
        Self::from_arc(Arc::new(transport))
    }

    pub fn from_arc(transport: Arc<T>) -> Self {
        Self {
            transport,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn url(&self) -> &str {
        self.transport.url()
    }

    fn id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// `eth_getTransactionReceipt`; `Ok(None)` while the transaction is unknown.
    pub async fn get_transaction_receipt(
        &self,
        hash: TxHash,
    ) -> Result<Option<Receipt>, TransportError> {
        let raw: Value = call(
            &*self.transport,
            self.id(),
            "eth_getTransactionReceipt",
            vec![Value::String(hash.to_string())],
        )
        .await?;
        Receipt::from_json(raw)
    }

    /// `eth_gasPrice` in wei.
    pub async fn gas_price(&self) -> Result<u128, TransportError> {
        let raw: String = call(&*self.transport, self.id(), "eth_gasPrice", vec![]).await?;
        parse_quantity(&raw).map_err(TransportError::MalformedResponse)
    }

    pub async fn block_number(&self) -> Result<u64, TransportError> {
        let raw: String = call(&*self.transport, self.id(), "eth_blockNumber", vec![]).await?;
        let n = parse_quantity(&raw).map_err(TransportError::MalformedResponse)?;
        u64::try_from(n)
            .map_err(|_| TransportError::MalformedResponse(format!("block number {n} out of range")))
    }

    /// Submit signed transaction bytes and return the hash the node assigned.
    pub async fn send_raw_transaction(&self, signed: &[u8]) -> Result<TxHash, TransportError> {
        let hash: TxHash = call(
            &*self.transport,
            self.id(),
            "eth_sendRawTransaction",
            vec![Value::String(hex::encode_prefixed(signed))],
        )
        .await?;
        tracing::debug!(tx_hash = %hash, url = self.url(), "raw transaction submitted");
        Ok(hash)
    }
}

#[async_trait]
impl<T: RpcTransport> ReceiptFetcher for PodRpc<T> {
    async fn fetch(&self, hash: TxHash) -> Result<Option<Receipt>, TransportError> {
        self.get_transaction_receipt(hash).await
    }
}

#[async_trait]
impl<T: RpcTransport> GasPriceSource for PodRpc<T> {
    async fn gas_price(&self) -> Result<u128, TransportError> {
        PodRpc::gas_price(self).await
    }
}
