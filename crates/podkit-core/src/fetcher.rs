//! Read-side interfaces consumed by the transaction tracker and gas manager.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::types::{Receipt, TxHash};

/// Fetches the receipt for a transaction hash.
///
/// `Ok(None)` means "not yet known to the node". Implementations classify
/// failures with [`TransportError`]: transient ones (`NetworkUnavailable`,
/// `Timeout`, `ConnectionLost`) are retried by callers, `MalformedResponse`
/// is fatal.
#[async_trait]
pub trait ReceiptFetcher: Send + Sync + 'static {
    async fn fetch(&self, hash: TxHash) -> Result<Option<Receipt>, TransportError>;
}

/// Produces the network's current gas price in wei.
#[async_trait]
pub trait GasPriceSource: Send + Sync + 'static {
    async fn gas_price(&self) -> Result<u128, TransportError>;
}

#[async_trait]
impl<F: ReceiptFetcher + ?Sized> ReceiptFetcher for Arc<F> {
    async fn fetch(&self, hash: TxHash) -> Result<Option<Receipt>, TransportError> {
        (**self).fetch(hash).await
    }
}

#[async_trait]
impl<S: GasPriceSource + ?Sized> GasPriceSource for Arc<S> {
    async fn gas_price(&self) -> Result<u128, TransportError> {
        (**self).gas_price().await
    }
}
