//! The connection task: sole owner of the socket.
//!
//! Callers talk to it through an unbounded command queue; every write goes
//! through that queue so frames are never interleaved. State transitions:
//!
//! ```text
//! Connecting ──ok──▶ Open ──lost──▶ Reconnecting{1} ──ok──▶ Open ...
//!     └──fail──▶ Reconnecting{1} ──fail──▶ Reconnecting{n+1}
//! shutdown, or a bounded policy running out ──▶ Closed
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use podkit_core::policy::ReconnectPolicy;
use podkit_core::{Connector, FrameSink, FrameStream, TransportError};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::channel::Channel;
use crate::error::WsError;
use crate::frame::{self, Inbound, Method};
use crate::multiplexer::{lock, Delivery, SharedRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Reconnecting { attempt: u32 },
    /// Terminal.
    Closed,
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

type Reply = oneshot::Sender<Result<Value, WsError>>;

pub(crate) enum Command {
    /// Make sure the handle under `key` is subscribed in the current epoch.
    Subscribe { key: String, reply: Reply },
    Unsubscribe {
        key: String,
        channel: Channel,
        params: Option<Value>,
        subscribed_epoch: Option<u64>,
    },
    Shutdown,
}

/// Caller-side handle to the connection task.
pub(crate) struct Connection {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl Connection {
    /// Spawn the task. Must be called inside a tokio runtime.
    pub(crate) fn spawn(
        connector: Arc<dyn Connector>,
        policy: ReconnectPolicy,
        registry: SharedRegistry,
        request_timeout: Duration,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Connecting);
        let task = ConnectionTask {
            connector,
            policy,
            registry,
            request_timeout,
            commands: command_rx,
            state: state_tx,
            pending: HashMap::new(),
            inflight: HashMap::new(),
            parked: HashMap::new(),
            next_id: 1,
            epoch: 0,
        };
        tokio::spawn(task.run());
        Self { commands, state }
    }

    pub(crate) fn send(&self, command: Command) -> Result<(), WsError> {
        self.commands.send(command).map_err(|_| WsError::closed())
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Ask the task to stop and wait until it has.
    pub(crate) async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
        let mut state = self.state.clone();
        let _ = state.wait_for(ConnectionState::is_closed).await;
    }
}

/// Outbound correlation entry.
struct Pending {
    replies: Vec<Reply>,
    /// Set for subscribe requests.
    key: Option<String>,
    submitted_at: Instant,
}

enum Exit {
    Shutdown,
    Lost,
}

struct ConnectionTask {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    registry: SharedRegistry,
    /// Unanswered requests older than this with nobody waiting are forgotten.
    request_timeout: Duration,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ConnectionState>,
    pending: HashMap<u64, Pending>,
    /// Handle key to the id of its unanswered subscribe.
    inflight: HashMap<String, u64>,
    /// Subscribe replies received while no socket was open.
    parked: HashMap<String, Vec<Reply>>,
    next_id: u64,
    /// Incremented on every successful connect.
    epoch: u64,
}

impl ConnectionTask {
    async fn run(mut self) {
        let url = self.connector.url().to_string();
        let mut attempt: u32 = 0;

        loop {
            if attempt > 0 {
                let Some(delay) = self.policy.delay(attempt) else {
                    warn!(url = %url, attempt, "reconnect attempts exhausted");
                    break;
                };
                self.state.send_replace(ConnectionState::Reconnecting { attempt });
                info!(url = %url, attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
                if !self.idle(delay).await {
                    break;
                }
            }

            let (sink, stream) = match self.connect().await {
                None => break,
                Some(Ok(io)) => io,
                Some(Err(e)) => {
                    warn!(url = %url, attempt, error = %e, "connect failed");
                    attempt += 1;
                    continue;
                }
            };

            self.epoch += 1;
            attempt = 0;
            info!(url = %url, epoch = self.epoch, "connected");
            self.state.send_replace(ConnectionState::Open);

            match self.serve(sink, stream).await {
                Exit::Shutdown => break,
                Exit::Lost => {
                    self.on_lost();
                    attempt = 1;
                }
            }
        }

        self.close();
        info!(url = %url, "connection closed");
    }

    /// `None` if shutdown was requested while connecting.
    async fn connect(&mut self) -> Option<Result<(FrameSink, FrameStream), TransportError>> {
        let connector = Arc::clone(&self.connector);
        let mut connecting = connector.connect();
        loop {
            tokio::select! {
                result = &mut connecting => return Some(result),
                command = self.commands.recv() => {
                    if !self.park(command) {
                        return None;
                    }
                }
            }
        }
    }

    /// Sleep out a reconnect delay; `false` if shutdown was requested.
    async fn idle(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = self.commands.recv() => {
                    if !self.park(command) {
                        return false;
                    }
                }
            }
        }
    }

    /// Handle a command while no socket is open; `false` means stop.
    fn park(&mut self, command: Option<Command>) -> bool {
        match command {
            None | Some(Command::Shutdown) => false,
            Some(Command::Subscribe { key, reply }) => {
                self.parked.entry(key).or_default().push(reply);
                true
            }
            Some(Command::Unsubscribe { key, .. }) => {
                self.parked.remove(&key);
                true
            }
        }
    }

    async fn serve(&mut self, mut sink: FrameSink, mut stream: FrameStream) -> Exit {
        // Resubscribe everything before the first inbound frame is read.
        let handles = lock(&self.registry).resubscribe_all(self.epoch);
        let mut parked = std::mem::take(&mut self.parked);
        for (key, channel, params) in handles {
            let replies = parked.remove(&key).unwrap_or_default();
            let id = self.track(Some(key), replies);
            debug!(%channel, id, "subscribe");
            if let Err(e) = sink.send(frame::request(id, Method::Subscribe, channel, params.as_ref())).await {
                warn!(error = %e, "write failed");
                // Nothing of this request reached the wire; its waiters and
                // the untouched parked ones wait for the next connection.
                if let Some(Pending { key: Some(key), replies, .. }) = self.pending.remove(&id) {
                    self.inflight.remove(&key);
                    parked.entry(key).or_default().extend(replies);
                }
                self.parked = parked;
                return Exit::Lost;
            }
        }
        // Parked for handles released before the socket came up.
        for reply in parked.into_values().flatten() {
            let _ = reply.send(Ok(Value::Null));
        }

        if self.epoch > 1 {
            lock(&self.registry).broadcast(Delivery::Reconnected);
        }

        let mut sweep = tokio::time::interval_at(Instant::now() + self.request_timeout, self.request_timeout);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = sweep.tick() => self.expire_stale(),
                command = self.commands.recv() => {
                    let outbound = match command {
                        None | Some(Command::Shutdown) => {
                            let _ = sink.close().await;
                            return Exit::Shutdown;
                        }
                        Some(Command::Subscribe { key, reply }) => self.on_subscribe(key, reply),
                        Some(Command::Unsubscribe { key, channel, params, subscribed_epoch }) => {
                            self.on_unsubscribe(key, channel, params, subscribed_epoch)
                        }
                    };
                    if let Some(text) = outbound {
                        if let Err(e) = sink.send(text).await {
                            warn!(error = %e, "write failed");
                            return Exit::Lost;
                        }
                    }
                }
                inbound = stream.next() => match inbound {
                    Some(Ok(text)) => self.on_frame(&text),
                    Some(Err(e)) => {
                        warn!(error = %e, "receive failed");
                        return Exit::Lost;
                    }
                    None => return Exit::Lost,
                },
            }
        }
    }

    fn track(&mut self, key: Option<String>, replies: Vec<Reply>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        if let Some(key) = &key {
            self.inflight.insert(key.clone(), id);
        }
        self.pending.insert(
            id,
            Pending {
                replies,
                key,
                submitted_at: Instant::now(),
            },
        );
        id
    }

    /// Forget requests that outlived `request_timeout` and have no live waiter:
    /// unacknowledged unsubscribes and subscribes whose callers timed out.
    fn expire_stale(&mut self) {
        let timeout = self.request_timeout;
        let stale: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| p.submitted_at.elapsed() >= timeout && p.replies.iter().all(|r| r.is_closed()))
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            let Some(pending) = self.pending.remove(&id) else {
                continue;
            };
            if let Some(key) = pending.key {
                if self.inflight.get(&key) == Some(&id) {
                    self.inflight.remove(&key);
                    if let Some(handle) = lock(&self.registry).handle_mut(&key) {
                        handle.subscribed_epoch = None;
                    }
                }
            }
            debug!(id, "expired unanswered request");
        }
    }

    fn on_subscribe(&mut self, key: String, reply: Reply) -> Option<String> {
        if let Some(pending) = self.inflight.get(&key).and_then(|id| self.pending.get_mut(id)) {
            pending.replies.push(reply);
            return None;
        }

        let (channel, params) = {
            let mut reg = lock(&self.registry);
            match reg.handle_mut(&key) {
                Some(handle) if handle.subscribed_epoch != Some(self.epoch) => {
                    handle.subscribed_epoch = Some(self.epoch);
                    (handle.params.channel(), handle.wire.clone())
                }
                // Already acknowledged in this epoch, or released meanwhile.
                _ => {
                    let _ = reply.send(Ok(Value::Null));
                    return None;
                }
            }
        };

        let id = self.track(Some(key), vec![reply]);
        debug!(%channel, id, "subscribe");
        Some(frame::request(id, Method::Subscribe, channel, params.as_ref()))
    }

    fn on_unsubscribe(
        &mut self,
        key: String,
        channel: Channel,
        params: Option<Value>,
        subscribed_epoch: Option<u64>,
    ) -> Option<String> {
        self.inflight.remove(&key);
        if subscribed_epoch != Some(self.epoch) {
            return None;
        }
        let id = self.track(None, Vec::new());
        debug!(%channel, id, "unsubscribe");
        Some(frame::request(id, Method::Unsubscribe, channel, params.as_ref()))
    }

    fn on_frame(&mut self, text: &str) {
        match frame::parse(text) {
            Ok(Inbound::Response { id, result }) => self.on_response(id, result),
            Ok(Inbound::Push { channel, data }) => match channel.parse::<Channel>() {
                Ok(channel) => {
                    let delivered = lock(&self.registry).dispatch(channel, &data);
                    trace!(%channel, delivered, "push");
                }
                Err(reason) => warn!(%reason, "discarding push"),
            },
            Err(reason) => warn!(%reason, "discarding malformed frame"),
        }
    }

    fn on_response(&mut self, id: u64, result: Result<Value, podkit_core::JsonRpcError>) {
        let Some(pending) = self.pending.remove(&id) else {
            warn!(id, "discarding response to unknown request");
            return;
        };

        let current = pending
            .key
            .as_ref()
            .filter(|key| self.inflight.get(*key) == Some(&id))
            .cloned();
        if let Some(key) = current {
            self.inflight.remove(&key);
            if result.is_err() {
                // Let the next subscribe for this key go back on the wire.
                if let Some(handle) = lock(&self.registry).handle_mut(&key) {
                    handle.subscribed_epoch = None;
                }
            }
        }

        let result = result.map_err(|e| WsError::Server {
            code: e.code,
            message: e.message,
        });
        let elapsed_ms = pending.submitted_at.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => debug!(id, elapsed_ms, "request acknowledged"),
            Err(e) => warn!(id, elapsed_ms, error = %e, "request rejected"),
        }
        for reply in pending.replies {
            let _ = reply.send(result.clone());
        }
    }

    fn on_lost(&mut self) {
        let rejected = self.pending.len();
        for (_, pending) in self.pending.drain() {
            for reply in pending.replies {
                let _ = reply.send(Err(WsError::lost()));
            }
        }
        self.inflight.clear();
        lock(&self.registry).broadcast(Delivery::Disconnected);
        warn!(epoch = self.epoch, rejected, "connection lost");
    }

    fn close(&mut self) {
        lock(&self.registry).close();

        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Subscribe { reply, .. } = command {
                let _ = reply.send(Err(WsError::closed()));
            }
        }
        let waiting = self.pending.drain().flat_map(|(_, p)| p.replies);
        let parked = self.parked.drain().flat_map(|(_, replies)| replies);
        for reply in waiting.chain(parked) {
            let _ = reply.send(Err(WsError::closed()));
        }
        self.inflight.clear();

        self.state.send_replace(ConnectionState::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Refusing;

    #[async_trait]
    impl Connector for Refusing {
        async fn connect(&self) -> Result<(FrameSink, FrameStream), TransportError> {
            Err(TransportError::NetworkUnavailable("connection refused".into()))
        }

        fn url(&self) -> &str {
            "memory://refusing"
        }
    }

    fn task(request_timeout: Duration) -> ConnectionTask {
        let (_commands, command_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Open);
        ConnectionTask {
            connector: Arc::new(Refusing),
            policy: ReconnectPolicy::Never,
            registry: SharedRegistry::default(),
            request_timeout,
            commands: command_rx,
            state,
            pending: HashMap::new(),
            inflight: HashMap::new(),
            parked: HashMap::new(),
            next_id: 1,
            epoch: 1,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stale_requests_without_waiters_expire() {
        let mut task = task(Duration::from_secs(1));
        let unsubscribe = task.track(None, Vec::new());
        let (abandoned_tx, abandoned_rx) = oneshot::channel();
        drop(abandoned_rx);
        let abandoned = task.track(Some("bids".into()), vec![abandoned_tx]);
        let (waiting_tx, _waiting_rx) = oneshot::channel();
        let waiting = task.track(Some("orderbook".into()), vec![waiting_tx]);

        tokio::time::advance(Duration::from_millis(999)).await;
        task.expire_stale();
        assert_eq!(task.pending.len(), 3);

        tokio::time::advance(Duration::from_millis(1)).await;
        task.expire_stale();
        assert!(!task.pending.contains_key(&unsubscribe));
        assert!(!task.pending.contains_key(&abandoned));
        assert!(!task.inflight.contains_key("bids"));
        assert!(task.pending.contains_key(&waiting), "a live waiter keeps its entry");
        assert_eq!(task.inflight.get("orderbook"), Some(&waiting));
    }

    #[tokio::test(start_paused = true)]
    async fn late_ack_for_expired_request_is_discarded() {
        let mut task = task(Duration::from_secs(1));
        let id = task.track(None, Vec::new());
        tokio::time::advance(Duration::from_secs(1)).await;
        task.expire_stale();

        task.on_frame(&format!(r#"{{"id":{id},"result":true}}"#));
        assert!(task.pending.is_empty());
    }
}
