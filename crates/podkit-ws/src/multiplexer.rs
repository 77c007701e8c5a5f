//! Subscription registry and multiplexer.
//!
//! One [`Handle`] per canonical `(channel, params)` key, shared by every
//! consumer that asks for the same thing. The server sees one subscribe per
//! handle and one unsubscribe when its last consumer goes away.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use podkit_core::TransportError;
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::channel::{Channel, SubscriptionParams};
use crate::connection::{Command, Connection};
use crate::error::WsError;
use crate::events::Decode;
use crate::stream::SubscriptionStream;

/// What the connection task hands to a consumer.
#[derive(Debug, Clone)]
pub(crate) enum Delivery {
    Data(Value),
    Reconnected,
    Disconnected,
}

pub(crate) struct Handle {
    pub(crate) params: SubscriptionParams,
    /// Canonical params as sent on the wire.
    pub(crate) wire: Option<Value>,
    consumers: HashMap<u64, mpsc::Sender<Delivery>>,
    /// Connection epoch in which the subscribe frame was last written.
    pub(crate) subscribed_epoch: Option<u64>,
}

#[derive(Default)]
pub(crate) struct Registry {
    handles: HashMap<String, Handle>,
    next_consumer: u64,
    closed: bool,
}

pub(crate) type SharedRegistry = Arc<Mutex<Registry>>;

pub(crate) fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Registry {
    pub(crate) fn handle_mut(&mut self, key: &str) -> Option<&mut Handle> {
        self.handles.get_mut(key)
    }

    /// Every registered handle, marked as subscribed in `epoch`.
    pub(crate) fn resubscribe_all(&mut self, epoch: u64) -> Vec<(String, Channel, Option<Value>)> {
        self.handles
            .iter_mut()
            .map(|(key, handle)| {
                handle.subscribed_epoch = Some(epoch);
                (key.clone(), handle.params.channel(), handle.wire.clone())
            })
            .collect()
    }

    /// Route a push to every handle on `channel` whose params match it.
    /// Returns how many consumers accepted it.
    pub(crate) fn dispatch(&self, channel: Channel, data: &Value) -> usize {
        let mut delivered = 0;
        for (key, handle) in &self.handles {
            if handle.params.channel() != channel || !handle.params.matches(data) {
                continue;
            }
            for (consumer, tx) in &handle.consumers {
                if deliver(key, *consumer, tx, Delivery::Data(data.clone())) {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Send a lifecycle marker to every consumer.
    pub(crate) fn broadcast(&self, marker: Delivery) {
        for (key, handle) in &self.handles {
            for (consumer, tx) in &handle.consumers {
                deliver(key, *consumer, tx, marker.clone());
            }
        }
    }

    /// Drop every consumer sender and refuse new subscriptions.
    pub(crate) fn close(&mut self) {
        self.closed = true;
        self.handles.clear();
    }

    fn consumer_count(&self) -> usize {
        self.handles.values().map(|h| h.consumers.len()).sum()
    }
}

fn deliver(key: &str, consumer: u64, tx: &mpsc::Sender<Delivery>, item: Delivery) -> bool {
    match tx.try_send(item) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!(key, consumer, "consumer buffer full, dropping event");
            false
        }
        // Consumer is mid-release.
        Err(TrySendError::Closed(_)) => false,
    }
}

/// Owns the registry and the connection handle; creates consumer streams.
pub(crate) struct Multiplexer {
    registry: SharedRegistry,
    connection: Connection,
    max_subscriptions: usize,
    buffer_size: usize,
    request_timeout: Duration,
}

impl Multiplexer {
    pub(crate) fn new(
        registry: SharedRegistry,
        connection: Connection,
        max_subscriptions: usize,
        buffer_size: usize,
        request_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            connection,
            max_subscriptions,
            buffer_size: buffer_size.max(1),
            request_timeout,
        }
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Join or create the handle for `params` and wait for the server's ack.
    ///
    /// A consumer joining an existing handle does not cause a second
    /// server-side subscribe; it waits on the same acknowledgement.
    pub(crate) async fn subscribe<T: Decode>(
        self: &Arc<Self>,
        params: SubscriptionParams,
    ) -> Result<SubscriptionStream<T>, WsError> {
        let key = params.key();
        let channel = params.channel();

        let (consumer_id, rx, joined) = {
            let mut reg = lock(&self.registry);
            if reg.closed {
                return Err(WsError::closed());
            }
            let active = reg.handles.len();
            let consumer_id = reg.next_consumer;
            let (tx, rx) = mpsc::channel(self.buffer_size);
            let joined = match reg.handles.entry(key.clone()) {
                Entry::Occupied(mut e) => {
                    e.get_mut().consumers.insert(consumer_id, tx);
                    true
                }
                Entry::Vacant(e) => {
                    if active >= self.max_subscriptions {
                        return Err(WsError::SubscriptionLimit {
                            max: self.max_subscriptions,
                        });
                    }
                    let wire = params.to_wire();
                    e.insert(Handle {
                        params,
                        wire,
                        consumers: HashMap::from([(consumer_id, tx)]),
                        subscribed_epoch: None,
                    });
                    false
                }
            };
            reg.next_consumer += 1;
            (consumer_id, rx, joined)
        };

        // Dropping the stream on any error below releases the share.
        let stream = SubscriptionStream::new(key.clone(), consumer_id, rx, Arc::downgrade(self));
        debug!(%channel, key = %key, consumer = consumer_id, joined, "subscribing");

        let (reply, ack) = oneshot::channel();
        self.connection.send(Command::Subscribe {
            key: key.clone(),
            reply,
        })?;

        match tokio::time::timeout(self.request_timeout, ack).await {
            Ok(Ok(Ok(_))) => {
                info!(%channel, key = %key, consumer = consumer_id, "subscribed");
                Ok(stream)
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(WsError::closed()),
            Err(_) => {
                warn!(%channel, key = %key, "subscribe not acknowledged in time");
                Err(WsError::Transport(TransportError::Timeout {
                    ms: self.request_timeout.as_millis() as u64,
                }))
            }
        }
    }

    /// Remove one consumer; the last one out unsubscribes on the server.
    pub(crate) fn release(&self, key: &str, consumer_id: u64) {
        let removed = {
            let mut reg = lock(&self.registry);
            let Some(handle) = reg.handles.get_mut(key) else {
                return;
            };
            handle.consumers.remove(&consumer_id);
            if handle.consumers.is_empty() {
                reg.handles.remove(key)
            } else {
                None
            }
        };

        if let Some(handle) = removed {
            debug!(key, "last consumer released");
            // Fails only once the connection is closed, when nothing is subscribed anyway.
            let _ = self.connection.send(Command::Unsubscribe {
                key: key.to_string(),
                channel: handle.params.channel(),
                params: handle.wire,
                subscribed_epoch: handle.subscribed_epoch,
            });
        }
    }

    /// Distinct server-side subscriptions.
    pub(crate) fn subscription_count(&self) -> usize {
        lock(&self.registry).handles.len()
    }

    pub(crate) fn consumer_count(&self) -> usize {
        lock(&self.registry).consumer_count()
    }
}
