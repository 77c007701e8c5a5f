//! Pending transaction tracker.
//!
//! A [`PendingTransaction`] resolves a submitted transaction hash to a
//! terminal outcome by polling a [`ReceiptFetcher`], optionally racing a push
//! stream of confirmed receipts. The first terminal outcome is recorded once;
//! every later wait returns it without touching the network.
//!
//! ```text
//! pending ──receipt(status=1)──▶ confirmed
//!    │    ──receipt(status=0)──▶ reverted
//!    └────deadline / attempts──▶ timed_out
//! ```

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use futures::{Stream, StreamExt};
use podkit_core::policy::{has_timed_out, next_delay, PollingConfig};
use podkit_core::{Receipt, ReceiptFetcher, TransportError, TxHash};
use thiserror::Error;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, info, warn};

/// Lifecycle of a tracked transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Pending,
    Confirmed,
    Reverted,
    TimedOut,
}

impl std::fmt::Display for TxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Confirmed => write!(f, "confirmed"),
            Self::Reverted => write!(f, "reverted"),
            Self::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// Terminal outcome of a transaction that made it into a receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOutcome {
    Confirmed(Receipt),
    /// Included but execution failed.
    Reverted(Receipt),
}

impl TxOutcome {
    fn from_receipt(receipt: Receipt) -> Self {
        if receipt.status {
            Self::Confirmed(receipt)
        } else {
            Self::Reverted(receipt)
        }
    }

    pub fn receipt(&self) -> &Receipt {
        match self {
            Self::Confirmed(r) | Self::Reverted(r) => r,
        }
    }

    pub fn into_receipt(self) -> Receipt {
        match self {
            Self::Confirmed(r) | Self::Reverted(r) => r,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, Self::Confirmed(_))
    }
}

/// Why a wait did not produce a receipt.
#[derive(Debug, Clone, Error)]
pub enum TxError {
    #[error("transaction {hash} not confirmed after {elapsed_ms}ms ({attempts} polls)")]
    TimedOut {
        hash: TxHash,
        elapsed_ms: u64,
        attempts: u32,
    },

    #[error("malformed receipt response: {0}")]
    MalformedResponse(String),

    #[error("receipt fetch failed: {0}")]
    Transport(TransportError),

    /// The caller's cancel signal fired; the transaction stays pending.
    #[error("wait cancelled")]
    Cancelled,
}

impl From<TransportError> for TxError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::MalformedResponse(m) => Self::MalformedResponse(m),
            other => Self::Transport(other),
        }
    }
}

enum Settled {
    Outcome(TxOutcome),
    TimedOut(TxError),
}

impl Settled {
    fn status(&self) -> TxStatus {
        match self {
            Self::Outcome(TxOutcome::Confirmed(_)) => TxStatus::Confirmed,
            Self::Outcome(TxOutcome::Reverted(_)) => TxStatus::Reverted,
            Self::TimedOut(_) => TxStatus::TimedOut,
        }
    }

    fn to_result(&self) -> Result<TxOutcome, TxError> {
        match self {
            Self::Outcome(o) => Ok(o.clone()),
            Self::TimedOut(e) => Err(e.clone()),
        }
    }
}

/// A submitted transaction awaiting its receipt.
///
/// Clones share the status cell, so a clone handed to another task observes
/// the same single terminal transition.
#[derive(Clone)]
pub struct PendingTransaction {
    hash: TxHash,
    fetcher: Arc<dyn ReceiptFetcher>,
    config: PollingConfig,
    require_attestation: bool,
    settled: Arc<Mutex<Option<Settled>>>,
}

impl std::fmt::Debug for PendingTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingTransaction")
            .field("hash", &self.hash)
            .field("status", &self.status())
            .field("require_attestation", &self.require_attestation)
            .finish()
    }
}

impl PendingTransaction {
    pub fn new(hash: TxHash, fetcher: Arc<dyn ReceiptFetcher>) -> Self {
        Self {
            hash,
            fetcher,
            config: PollingConfig::default(),
            require_attestation: true,
            settled: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_config(mut self, config: PollingConfig) -> Self {
        self.config = config;
        self
    }

    /// Treat receipts with zero validator signatures as still pending (the default).
    pub fn require_attestation(mut self, required: bool) -> Self {
        self.require_attestation = required;
        self
    }

    /// Accept the first receipt the node returns, attested or not.
    pub fn without_attestation(self) -> Self {
        self.require_attestation(false)
    }

    pub fn hash(&self) -> TxHash {
        self.hash
    }

    pub fn config(&self) -> &PollingConfig {
        &self.config
    }

    pub fn status(&self) -> TxStatus {
        self.cell()
            .as_ref()
            .map_or(TxStatus::Pending, Settled::status)
    }

    /// The recorded terminal result, if any.
    pub fn outcome(&self) -> Option<Result<TxOutcome, TxError>> {
        self.cell().as_ref().map(Settled::to_result)
    }

    /// Poll until a terminal outcome, a fatal fetch error, or the deadline.
    pub async fn wait_for_receipt(&self) -> Result<TxOutcome, TxError> {
        self.poll_until_settled().await
    }

    /// Like [`wait_for_receipt`](Self::wait_for_receipt), also watching a push
    /// stream of confirmed receipts. Whichever source settles first wins; the
    /// other is dropped and anything it would have produced is discarded.
    pub async fn wait_for_receipt_racing<S>(&self, confirmations: S) -> Result<TxOutcome, TxError>
    where
        S: Stream<Item = Receipt>,
    {
        tokio::select! {
            result = self.poll_until_settled() => result,
            receipt = self.next_pushed(confirmations) => {
                info!(tx_hash = %self.hash, "receipt delivered by push");
                self.settle(Settled::Outcome(TxOutcome::from_receipt(receipt)))
            }
        }
    }

    /// [`wait_for_receipt`](Self::wait_for_receipt) that gives up with
    /// [`TxError::Cancelled`] when `cancel` completes. The transaction stays
    /// pending and can be waited on again.
    pub async fn wait_for_receipt_until<C>(&self, cancel: C) -> Result<TxOutcome, TxError>
    where
        C: Future,
    {
        tokio::select! {
            result = self.poll_until_settled() => result,
            _ = cancel => self.cancelled(),
        }
    }

    /// Cancellable [`wait_for_receipt_racing`](Self::wait_for_receipt_racing).
    pub async fn wait_for_receipt_racing_until<S, C>(
        &self,
        confirmations: S,
        cancel: C,
    ) -> Result<TxOutcome, TxError>
    where
        S: Stream<Item = Receipt>,
        C: Future,
    {
        tokio::select! {
            result = self.wait_for_receipt_racing(confirmations) => result,
            _ = cancel => self.cancelled(),
        }
    }

    fn cancelled(&self) -> Result<TxOutcome, TxError> {
        // A racing source may have settled between the last poll and the signal.
        if let Some(result) = self.outcome() {
            return result;
        }
        debug!(tx_hash = %self.hash, "wait cancelled");
        Err(TxError::Cancelled)
    }

    fn cell(&self) -> std::sync::MutexGuard<'_, Option<Settled>> {
        self.settled.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record `settled` unless another path got there first; return whatever is recorded.
    fn settle(&self, settled: Settled) -> Result<TxOutcome, TxError> {
        let mut cell = self.cell();
        match cell.as_ref() {
            Some(existing) => existing.to_result(),
            None => {
                let result = settled.to_result();
                debug!(tx_hash = %self.hash, status = %settled.status(), "transaction settled");
                *cell = Some(settled);
                result
            }
        }
    }

    fn accepts(&self, receipt: &Receipt) -> bool {
        !self.require_attestation || receipt.has_attestations()
    }

    async fn next_pushed<S>(&self, confirmations: S) -> Receipt
    where
        S: Stream<Item = Receipt>,
    {
        let hash = self.hash;
        let matching = confirmations.filter(|r| {
            futures::future::ready(r.transaction_hash == hash && self.accepts(r))
        });
        futures::pin_mut!(matching);
        match matching.next().await {
            Some(receipt) => receipt,
            // Push source ended without a match; polling alone decides.
            None => futures::future::pending().await,
        }
    }

    async fn poll_until_settled(&self) -> Result<TxOutcome, TxError> {
        if let Some(result) = self.outcome() {
            return result;
        }

        let config = self.config;
        let started_at = Instant::now();
        let deadline = started_at + config.timeout();
        let mut attempt: u32 = 0;

        loop {
            let fetched = match timeout_at(deadline, self.fetcher.fetch(self.hash)).await {
                Ok(fetched) => fetched,
                Err(_) => return self.time_out(started_at, attempt + 1),
            };

            match fetched {
                Ok(Some(receipt)) if self.accepts(&receipt) => {
                    info!(
                        tx_hash = %self.hash,
                        status = receipt.status,
                        attempt,
                        "receipt found"
                    );
                    return self.settle(Settled::Outcome(TxOutcome::from_receipt(receipt)));
                }
                Ok(Some(receipt)) => {
                    debug!(
                        tx_hash = %self.hash,
                        signatures = receipt.signature_count(),
                        "receipt not yet attested"
                    );
                }
                Ok(None) => {
                    debug!(tx_hash = %self.hash, attempt, "receipt not available yet");
                }
                Err(e) if e.is_retryable() => {
                    warn!(tx_hash = %self.hash, attempt, error = %e, "transient receipt fetch error");
                }
                Err(e) => {
                    warn!(tx_hash = %self.hash, error = %e, "receipt fetch failed");
                    return Err(e.into());
                }
            }

            let polls = attempt + 1;
            if config.max_attempts().is_some_and(|max| polls >= max) {
                return self.time_out(started_at, polls);
            }

            let now = Instant::now();
            if has_timed_out(started_at, now, &config) {
                return self.time_out(started_at, polls);
            }
            sleep(next_delay(attempt, &config).min(deadline - now)).await;
            attempt = polls;

            if has_timed_out(started_at, Instant::now(), &config) {
                return self.time_out(started_at, polls);
            }
        }
    }

    fn time_out(&self, started_at: Instant, attempts: u32) -> Result<TxOutcome, TxError> {
        let elapsed_ms = started_at.elapsed().as_millis() as u64;
        warn!(tx_hash = %self.hash, elapsed_ms, attempts, "timed out waiting for receipt");
        self.settle(Settled::TimedOut(TxError::TimedOut {
            hash: self.hash,
            elapsed_ms,
            attempts,
        }))
    }
}
