//! WebSocket client for the debate-relay service
//!
//! The socket is redialled with backoff whenever it drops. Open subscriptions
//! keep their local handles and are re-issued on every new link; requests made
//! while the link is down fail as transient.

use async_trait::async_trait;
use debate_protocol::{
    ClientMessage, ParticipantId, RequestId, ServerMessage, SessionId, SignalId, SignalMessage,
    SubscriptionId,
};
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

use super::{
    Ack, AckHandle, InboundSignal, InboxSink, ParticipantRegistry, RegistryEvent, RegistrySink,
    RelayChannel, Subscription,
};
use crate::config::RetryPolicy;
use crate::error::RelayError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const PING_INTERVAL: Duration = Duration::from_secs(30);

type RelayStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Where an open subscription delivers, and what re-opens it
#[derive(Clone)]
enum Sink {
    Inbox {
        session_id: SessionId,
        recipient: ParticipantId,
        sink: InboxSink,
    },
    Registry {
        session_id: SessionId,
        sink: RegistrySink,
    },
}

impl Sink {
    fn subscribe_message(&self, request_id: RequestId) -> ClientMessage {
        match self {
            Sink::Inbox {
                session_id,
                recipient,
                ..
            } => ClientMessage::SubscribeInbox {
                request_id,
                session_id: session_id.clone(),
                recipient: recipient.clone(),
            },
            Sink::Registry { session_id, .. } => ClientMessage::WatchSession {
                request_id,
                session_id: session_id.clone(),
            },
        }
    }
}

#[derive(Default)]
struct Routes {
    /// Writer of the current link; None while reconnecting
    outgoing: Option<mpsc::UnboundedSender<ClientMessage>>,
    pending: HashMap<RequestId, oneshot::Sender<ServerMessage>>,
    /// Subscribe requests waiting for `Subscribed`, mapped to the local handle
    pending_subscriptions: HashMap<RequestId, u64>,
    /// Open subscriptions by local handle
    subscriptions: HashMap<u64, Sink>,
    /// Relay-assigned ids on the current link
    remote_ids: HashMap<SubscriptionId, u64>,
}

impl Routes {
    fn sink_for(&self, remote_id: SubscriptionId) -> Option<&Sink> {
        self.remote_ids
            .get(&remote_id)
            .and_then(|local| self.subscriptions.get(local))
    }

    fn remote_id_of(&self, local: u64) -> Option<SubscriptionId> {
        self.remote_ids
            .iter()
            .find(|(_, handle)| **handle == local)
            .map(|(remote_id, _)| *remote_id)
    }
}

/// Read half of one socket; its writer and ping tasks die with it
struct Link {
    read: SplitStream<RelayStream>,
    tasks: [JoinHandle<()>; 2],
}

impl Drop for Link {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

struct Connection {
    url: String,
    policy: RetryPolicy,
    next_request: AtomicU64,
    next_subscription: AtomicU64,
    routes: Mutex<Routes>,
    shutdown: watch::Sender<bool>,
}

impl Connection {
    fn routes(&self) -> MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn unavailable(&self) -> RelayError {
        if self.is_shut_down() {
            RelayError::Closed
        } else {
            RelayError::Transient("relay reconnecting".into())
        }
    }

    async fn request(
        &self,
        build: impl FnOnce(RequestId) -> ClientMessage,
        subscription: Option<(u64, Sink)>,
    ) -> Result<ServerMessage, RelayError> {
        if self.is_shut_down() {
            return Err(RelayError::Closed);
        }

        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut routes = self.routes();
            let Some(outgoing) = routes.outgoing.clone() else {
                return Err(self.unavailable());
            };
            if outgoing.send(build(request_id)).is_err() {
                return Err(self.unavailable());
            }
            routes.pending.insert(request_id, tx);
            if let Some((local, sink)) = subscription {
                routes.subscriptions.insert(local, sink);
                routes.pending_subscriptions.insert(request_id, local);
            }
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(ServerMessage::Error { message, .. })) => Err(RelayError::Rejected(message)),
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(RelayError::Transient("relay connection lost".into())),
            Err(_) => {
                self.forget(request_id);
                Err(RelayError::Transient(format!(
                    "relay did not answer request {} in time",
                    request_id
                )))
            }
        }
    }

    fn forget(&self, request_id: RequestId) {
        let mut routes = self.routes();
        routes.pending.remove(&request_id);
        routes.pending_subscriptions.remove(&request_id);
    }

    fn handle_message(self: &Arc<Self>, message: ServerMessage) {
        if let Some(request_id) = message.request_id() {
            let mut routes = self.routes();
            // Map the subscription before releasing the lock so pushes that
            // follow the response on the wire find it.
            if let ServerMessage::Subscribed {
                subscription_id, ..
            } = &message
            {
                if let Some(local) = routes.pending_subscriptions.remove(&request_id) {
                    if routes.subscriptions.contains_key(&local) {
                        routes.remote_ids.insert(*subscription_id, local);
                    } else if let Some(outgoing) = &routes.outgoing {
                        // Closed while the subscribe was in flight
                        let _ = outgoing.send(ClientMessage::Unsubscribe {
                            request_id: self.next_request.fetch_add(1, Ordering::Relaxed),
                            subscription_id: *subscription_id,
                        });
                    }
                }
            } else if let Some(local) = routes.pending_subscriptions.remove(&request_id) {
                tracing::warn!("Relay refused subscription {}", local);
            }
            if let Some(tx) = routes.pending.remove(&request_id) {
                let _ = tx.send(message);
            }
            return;
        }

        match message {
            ServerMessage::Signal {
                subscription_id,
                document,
            } => {
                let routes = self.routes();
                let Some(Sink::Inbox {
                    session_id, sink, ..
                }) = routes.sink_for(subscription_id)
                else {
                    tracing::debug!("Signal for unknown subscription {}", subscription_id);
                    return;
                };
                let signal_id = document.id;
                match document.into_message() {
                    Ok(message) => {
                        let handle: Arc<dyn AckHandle> = self.clone();
                        let ack = Ack::new(session_id.clone(), signal_id, handle);
                        let _ = sink.send(InboundSignal { message, ack });
                    }
                    Err(e) => {
                        tracing::warn!("Discarding malformed signal {}: {}", signal_id, e);
                        if let Some(outgoing) = &routes.outgoing {
                            let _ = outgoing.send(ClientMessage::Ack {
                                request_id: self.next_request.fetch_add(1, Ordering::Relaxed),
                                session_id: session_id.clone(),
                                signal_id,
                            });
                        }
                    }
                }
            }
            ServerMessage::Participants {
                subscription_id,
                participants,
            } => {
                if let Some(Sink::Registry { sink, .. }) = self.routes().sink_for(subscription_id)
                {
                    let _ = sink.send(RegistryEvent::Participants(participants));
                }
            }
            ServerMessage::SessionState {
                subscription_id,
                state,
            } => {
                if let Some(Sink::Registry { sink, .. }) = self.routes().sink_for(subscription_id)
                {
                    let _ = sink.send(RegistryEvent::State(state));
                }
            }
            ServerMessage::Error { message, .. } => {
                tracing::warn!("Relay error: {}", message);
            }
            ServerMessage::Pong => {}
            other => tracing::debug!("Unhandled relay message: {:?}", other),
        }
    }

    /// Start the writer and ping tasks for a fresh socket and re-open every subscription
    fn attach(&self, stream: RelayStream) -> Link {
        let (mut write, read) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<ClientMessage>();

        // Spawn task to handle outgoing messages
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let json = match serde_json::to_string(&msg) {
                    Ok(j) => j,
                    Err(e) => {
                        tracing::error!("Failed to serialize relay message: {}", e);
                        continue;
                    }
                };

                if write.send(Message::Text(json.into())).await.is_err() {
                    tracing::error!("Failed to send relay message");
                    break;
                }
            }
        });

        // Start ping task
        let ping_tx = tx.clone();
        let ping = tokio::spawn(async move {
            let mut interval = tokio::time::interval(PING_INTERVAL);
            loop {
                interval.tick().await;
                if ping_tx.send(ClientMessage::Ping).is_err() {
                    break;
                }
            }
        });

        let mut guard = self.routes();
        let routes = &mut *guard;
        for (local, sink) in &routes.subscriptions {
            let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
            routes.pending_subscriptions.insert(request_id, *local);
            let _ = tx.send(sink.subscribe_message(request_id));
        }
        if !routes.subscriptions.is_empty() {
            tracing::info!("Re-opening {} relay subscriptions", routes.subscriptions.len());
        }
        routes.outgoing = Some(tx);

        Link {
            read,
            tasks: [writer, ping],
        }
    }

    async fn read_until_closed(self: &Arc<Self>, link: &mut Link) {
        while let Some(result) = link.read.next().await {
            match result {
                Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(msg) => self.handle_message(msg),
                    Err(e) => tracing::warn!("Unparseable relay message: {}", e),
                },
                Ok(Message::Close(_)) => {
                    tracing::info!("Relay closed the connection");
                    break;
                }
                Err(e) => {
                    tracing::error!("Relay WebSocket error: {}", e);
                    break;
                }
                _ => {}
            }
        }
    }

    /// Fail in-flight requests and mark every registry feed stale
    fn link_lost(&self) {
        let mut routes = self.routes();
        routes.outgoing = None;
        // Dropping the reply senders fails waiting requests as transient
        routes.pending.clear();
        routes.pending_subscriptions.clear();
        routes.remote_ids.clear();
        for sink in routes.subscriptions.values() {
            if let Sink::Registry { sink, .. } = sink {
                let _ = sink.send(RegistryEvent::Stale);
            }
        }
    }

    async fn redial(&self) -> RelayStream {
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            tokio::time::sleep(self.policy.backoff(attempt)).await;
            match dial(&self.url).await {
                Ok(stream) => {
                    tracing::info!("Reconnected to relay at {} (attempt {})", self.url, attempt);
                    return stream;
                }
                Err(e) => tracing::warn!("Reconnect attempt {} failed: {}", attempt, e),
            }
        }
    }

    async fn supervise(self: Arc<Self>, mut link: Link, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = self.read_until_closed(&mut link) => {}
            }
            drop(link);
            self.link_lost();
            tracing::warn!("Lost relay connection to {}, reconnecting", self.url);

            let stream = tokio::select! {
                _ = shutdown.changed() => return,
                stream = self.redial() => stream,
            };
            link = self.attach(stream);
        }
        self.link_lost();
    }
}

#[async_trait]
impl AckHandle for Connection {
    async fn ack(&self, session_id: &SessionId, signal_id: SignalId) -> Result<(), RelayError> {
        let session_id = session_id.clone();
        self.request(
            |request_id| ClientMessage::Ack {
                request_id,
                session_id,
                signal_id,
            },
            None,
        )
        .await
        .map(|_| ())
    }
}

async fn dial(url: &str) -> Result<RelayStream, RelayError> {
    let (stream, _) = connect_async(url)
        .await
        .map_err(|e| RelayError::Transient(format!("connect to {}: {}", url, e)))?;
    Ok(stream)
}

/// Relay reached over a WebSocket connection
#[derive(Clone)]
pub struct RemoteRelay {
    connection: Arc<Connection>,
}

impl RemoteRelay {
    pub async fn connect(url: &str) -> Result<Self, RelayError> {
        Self::connect_with(url, RetryPolicy::default()).await
    }

    /// Connect once, then redial with `policy`'s backoff whenever the socket drops
    pub async fn connect_with(url: &str, policy: RetryPolicy) -> Result<Self, RelayError> {
        let stream = dial(url).await?;
        let (shutdown, _) = watch::channel(false);
        let connection = Arc::new(Connection {
            url: url.to_string(),
            policy,
            next_request: AtomicU64::new(1),
            next_subscription: AtomicU64::new(1),
            routes: Mutex::new(Routes::default()),
            shutdown,
        });

        let link = connection.attach(stream);
        let shutdown = connection.shutdown.subscribe();
        tokio::spawn(connection.clone().supervise(link, shutdown));

        tracing::info!("Connected to relay at {}", url);
        Ok(Self { connection })
    }

    /// Register `uid` as a session participant
    pub async fn join(&self, session_id: &SessionId, uid: &ParticipantId) -> Result<(), RelayError> {
        let (session_id, uid) = (session_id.clone(), uid.clone());
        self.connection
            .request(
                |request_id| ClientMessage::JoinSession {
                    request_id,
                    session_id,
                    uid,
                },
                None,
            )
            .await
            .map(|_| ())
    }

    /// Remove `uid` from the session participants
    pub async fn leave(&self, session_id: &SessionId, uid: &ParticipantId) -> Result<(), RelayError> {
        let (session_id, uid) = (session_id.clone(), uid.clone());
        self.connection
            .request(
                |request_id| ClientMessage::LeaveSession {
                    request_id,
                    session_id,
                    uid,
                },
                None,
            )
            .await
            .map(|_| ())
    }

    pub fn is_connected(&self) -> bool {
        self.connection.routes().outgoing.is_some()
    }

    /// Drop the socket and stop reconnecting; later requests fail with `Closed`
    pub fn close(&self) {
        self.connection.shutdown.send_replace(true);
    }

    async fn open_subscription(&self, sink: Sink) -> Result<Subscription, RelayError> {
        let local = self.connection.next_subscription.fetch_add(1, Ordering::Relaxed);
        let response = self
            .connection
            .request(|request_id| sink.subscribe_message(request_id), Some((local, sink.clone())))
            .await;

        match response {
            Ok(ServerMessage::Subscribed { .. }) => Ok(Subscription::new(local)),
            other => {
                self.connection.routes().subscriptions.remove(&local);
                match other {
                    Err(e) => Err(e),
                    Ok(response) => Err(RelayError::Rejected(format!(
                        "unexpected response to subscribe: {:?}",
                        response
                    ))),
                }
            }
        }
    }

    async fn close_subscription(&self, subscription: &Subscription) {
        let remote_id = {
            let mut routes = self.connection.routes();
            if routes.subscriptions.remove(&subscription.id()).is_none() {
                return;
            }
            let remote_id = routes.remote_id_of(subscription.id());
            if let Some(remote_id) = remote_id {
                routes.remote_ids.remove(&remote_id);
            }
            remote_id
        };
        // Not open on the current link; nothing to tell the relay
        let Some(subscription_id) = remote_id else {
            return;
        };

        if let Err(e) = self
            .connection
            .request(
                |request_id| ClientMessage::Unsubscribe {
                    request_id,
                    subscription_id,
                },
                None,
            )
            .await
        {
            tracing::debug!("Unsubscribe {} failed: {}", subscription_id, e);
        }
    }
}

#[async_trait]
impl RelayChannel for RemoteRelay {
    async fn publish(
        &self,
        session_id: &SessionId,
        message: &SignalMessage,
    ) -> Result<SignalId, RelayError> {
        let session_id = session_id.clone();
        let signal = message.to_draft();
        let response = self
            .connection
            .request(
                |request_id| ClientMessage::Publish {
                    request_id,
                    session_id,
                    signal,
                },
                None,
            )
            .await?;

        match response {
            ServerMessage::Published { signal_id, .. } => Ok(signal_id),
            other => Err(RelayError::Rejected(format!(
                "unexpected response to publish: {:?}",
                other
            ))),
        }
    }

    async fn subscribe_inbox(
        &self,
        session_id: &SessionId,
        recipient: &ParticipantId,
        sink: InboxSink,
    ) -> Result<Subscription, RelayError> {
        self.open_subscription(Sink::Inbox {
            session_id: session_id.clone(),
            recipient: recipient.clone(),
            sink,
        })
        .await
    }

    async fn unsubscribe(&self, subscription: &Subscription) {
        self.close_subscription(subscription).await
    }
}

#[async_trait]
impl ParticipantRegistry for RemoteRelay {
    async fn watch(
        &self,
        session_id: &SessionId,
        sink: RegistrySink,
    ) -> Result<Subscription, RelayError> {
        self.open_subscription(Sink::Registry {
            session_id: session_id.clone(),
            sink,
        })
        .await
    }

    async fn unwatch(&self, subscription: &Subscription) {
        self.close_subscription(subscription).await
    }
}
