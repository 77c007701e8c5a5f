//! Typed subscription streams.

use std::fmt;
use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};

use futures::{ready, Stream, StreamExt};
use podkit_core::Receipt;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::WsError;
use crate::events::{Decode, ReceiptEvent};
use crate::multiplexer::{Delivery, Multiplexer};

/// One item of a subscription stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent<T> {
    Data(T),
    /// The socket came back and the subscription was re-issued.
    Reconnected,
    /// The socket dropped; a reconnect is in progress.
    Disconnected,
}

impl<T> StreamEvent<T> {
    pub fn into_data(self) -> Option<T> {
        match self {
            Self::Data(t) => Some(t),
            _ => None,
        }
    }
}

type Filter<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

/// A consumer's view of one subscription.
///
/// Payloads that fail to decode are logged and skipped. Ends when cancelled
/// or dropped (releasing this consumer's share of the subscription), or after
/// yielding `ConnectionClosed` once the connection is gone for good.
pub struct SubscriptionStream<T> {
    key: String,
    consumer_id: u64,
    rx: mpsc::Receiver<Delivery>,
    owner: Weak<Multiplexer>,
    filters: Vec<Filter<T>>,
    released: bool,
    done: bool,
}

impl<T> SubscriptionStream<T> {
    pub(crate) fn new(key: String, consumer_id: u64, rx: mpsc::Receiver<Delivery>, owner: Weak<Multiplexer>) -> Self {
        Self {
            key,
            consumer_id,
            rx,
            owner,
            filters: Vec::new(),
            released: false,
            done: false,
        }
    }

    /// Canonical subscription key this stream is attached to.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Only yield data for which `predicate` holds. Filters stack.
    pub fn with_filter(mut self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.filters.push(Box::new(predicate));
        self
    }

    /// Stop receiving. Buffered items are discarded.
    pub fn cancel(&mut self) {
        self.release();
        self.done = true;
        self.rx.close();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(owner) = self.owner.upgrade() {
            owner.release(&self.key, self.consumer_id);
        }
    }
}

impl<T: Decode> SubscriptionStream<T> {
    /// Data payloads only; ends when the subscription does.
    pub fn into_data(self) -> impl Stream<Item = T> + Send {
        self.take_while(|item| futures::future::ready(item.is_ok()))
            .filter_map(|item| futures::future::ready(item.ok().and_then(StreamEvent::into_data)))
    }
}

impl SubscriptionStream<ReceiptEvent> {
    /// Pushed receipts, in the shape a pending transaction races against.
    pub fn receipts(self) -> impl Stream<Item = Receipt> + Send {
        self.into_data().map(ReceiptEvent::into_receipt)
    }
}

impl<T: Decode> Stream for SubscriptionStream<T> {
    type Item = Result<StreamEvent<T>, WsError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if this.done {
                return Poll::Ready(None);
            }
            let item = match ready!(this.rx.poll_recv(cx)) {
                Some(Delivery::Data(value)) => match T::decode(value) {
                    Ok(item) if this.filters.iter().all(|keep| keep(&item)) => StreamEvent::Data(item),
                    Ok(_) => continue,
                    Err(reason) => {
                        warn!(key = %this.key, %reason, "dropping undecodable payload");
                        continue;
                    }
                },
                Some(Delivery::Reconnected) => StreamEvent::Reconnected,
                Some(Delivery::Disconnected) => StreamEvent::Disconnected,
                None => {
                    // Senders only vanish when the connection closes.
                    this.done = true;
                    return Poll::Ready(Some(Err(WsError::closed())));
                }
            };
            return Poll::Ready(Some(Ok(item)));
        }
    }
}

impl<T> Drop for SubscriptionStream<T> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<T> fmt::Debug for SubscriptionStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionStream")
            .field("key", &self.key)
            .field("consumer_id", &self.consumer_id)
            .field("filters", &self.filters.len())
            .field("done", &self.done)
            .finish()
    }
}
