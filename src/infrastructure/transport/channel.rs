/// Client side of the signaling transport
///
/// A `SignalingChannel` carries `ClientMessage`s to the relay and fans relay
/// messages out to every subscriber. It runs either over a WebSocket or
/// in-process against a `SignalingRelay` (loopback); both behave the same.
use crate::application::negotiation::SignalSender;
use crate::domain::relay::{RelayConnection, SignalingRelay};
use crate::domain::shared::{MeshError, ParticipantId, Result};
use crate::domain::signaling::{ClientMessage, ServerMessage};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// What subscribers receive
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Message(ServerMessage),
    /// The transport is gone; nothing follows
    Disconnected,
}

#[derive(Debug, Clone)]
struct ChannelState {
    participant_id: Option<ParticipantId>,
    connected: bool,
}

type Listeners = HashMap<u64, mpsc::UnboundedSender<ChannelEvent>>;

struct ChannelInner {
    outgoing: mpsc::UnboundedSender<ClientMessage>,
    listeners: Mutex<Listeners>,
    next_listener: AtomicU64,
    state: watch::Sender<ChannelState>,
    shutdown: watch::Sender<bool>,
}

impl ChannelInner {
    fn listeners(&self) -> MutexGuard<'_, Listeners> {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn dispatch(&self, message: ServerMessage) {
        if let ServerMessage::Welcome { participant_id } = &message {
            debug!("Relay assigned participant id {}", participant_id);
            let id = participant_id.clone();
            self.state.send_modify(|state| state.participant_id = Some(id));
        }

        for listener in self.listeners().values() {
            let _ = listener.send(ChannelEvent::Message(message.clone()));
        }
    }

    fn mark_disconnected(&self) {
        let was_connected = self
            .state
            .send_if_modified(|state| std::mem::replace(&mut state.connected, false));
        if was_connected {
            info!("Signaling channel disconnected");
            for (_, listener) in self.listeners().drain() {
                let _ = listener.send(ChannelEvent::Disconnected);
            }
        }
    }
}

/// Handle to a signaling transport; clones share the transport
#[derive(Clone)]
pub struct SignalingChannel {
    inner: Arc<ChannelInner>,
}

impl SignalingChannel {
    fn with_outgoing(outgoing: mpsc::UnboundedSender<ClientMessage>) -> Self {
        let (state, _) = watch::channel(ChannelState {
            participant_id: None,
            connected: true,
        });
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(ChannelInner {
                outgoing,
                listeners: Mutex::new(HashMap::new()),
                next_listener: AtomicU64::new(0),
                state,
                shutdown,
            }),
        }
    }

    /// Connect to a relay WebSocket endpoint (`ws://host:port/signaling`)
    pub async fn connect(url: &str) -> Result<Self> {
        let (socket, _) = connect_async(url)
            .await
            .map_err(|e| MeshError::Transport(e.to_string()))?;
        let (mut sink, mut stream) = socket.split();
        info!("Connected to relay at {}", url);

        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let channel = Self::with_outgoing(outgoing_tx);
        let inner = Arc::downgrade(&channel.inner);
        let mut shutdown = channel.inner.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    message = outgoing_rx.recv() => {
                        let Some(message) = message else { break };
                        let text = match serde_json::to_string(&message) {
                            Ok(text) => text,
                            Err(e) => {
                                warn!("Failed to encode signaling message: {}", e);
                                continue;
                            }
                        };
                        if let Err(e) = sink.send(Message::Text(text)).await {
                            warn!("WebSocket send failed: {}", e);
                            break;
                        }
                    }

                    frame = stream.next() => match frame {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<ServerMessage>(&text) {
                                Ok(message) => match inner.upgrade() {
                                    Some(inner) => inner.dispatch(message),
                                    None => break,
                                },
                                Err(e) => warn!("Unparseable frame from relay: {}", e),
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("WebSocket error: {}", e);
                            break;
                        }
                    },

                    _ = shutdown.changed() => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }

            if let Some(inner) = inner.upgrade() {
                inner.mark_disconnected();
            }
        });

        Ok(channel)
    }

    /// In-process channel to `relay`
    pub fn loopback(relay: Arc<SignalingRelay>) -> Self {
        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<ServerMessage>();
        let channel = Self::with_outgoing(outgoing_tx);
        let inner = Arc::downgrade(&channel.inner);
        let mut shutdown = channel.inner.shutdown.subscribe();

        tokio::spawn(async move {
            let mut connection = RelayConnection::open(relay, inbound_tx);
            loop {
                tokio::select! {
                    biased;

                    message = outgoing_rx.recv() => match message {
                        Some(message) => connection.handle(message).await,
                        None => break,
                    },

                    Some(message) = inbound_rx.recv() => match inner.upgrade() {
                        Some(inner) => inner.dispatch(message),
                        None => break,
                    },

                    _ = shutdown.changed() => break,
                }
            }

            connection.close().await;
            if let Some(inner) = inner.upgrade() {
                inner.mark_disconnected();
            }
        });

        channel
    }

    /// Channel with nothing behind it: sends land in the returned receiver
    /// and relay traffic is fed in with `inject`
    #[cfg(test)]
    pub(crate) fn scripted() -> (Self, mpsc::UnboundedReceiver<ClientMessage>) {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        (Self::with_outgoing(outgoing_tx), outgoing_rx)
    }

    #[cfg(test)]
    pub(crate) fn inject(&self, message: ServerMessage) {
        self.inner.dispatch(message);
    }

    /// Queue a message for the relay
    pub fn send(&self, message: ClientMessage) -> Result<()> {
        if !self.is_connected() {
            return Err(MeshError::TransportDisconnected);
        }
        self.inner
            .outgoing
            .send(message)
            .map_err(|_| MeshError::TransportDisconnected)
    }

    /// Receive every relay message from now on, until the token is dropped
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_listener.fetch_add(1, Ordering::SeqCst);
        if self.is_connected() {
            self.inner.listeners().insert(id, tx);
        } else {
            let _ = tx.send(ChannelEvent::Disconnected);
        }
        Subscription {
            id,
            events: rx,
            channel: Arc::downgrade(&self.inner),
        }
    }

    /// Participant id from the relay's welcome
    pub async fn participant_id(&self) -> Result<ParticipantId> {
        let mut state = self.inner.state.subscribe();
        let id = state
            .wait_for(|state| state.participant_id.is_some() || !state.connected)
            .await
            .map_err(|_| MeshError::TransportDisconnected)?
            .participant_id
            .clone();
        id.ok_or(MeshError::TransportDisconnected)
    }

    /// Close the transport. Subscribers receive `Disconnected`.
    pub fn disconnect(&self) {
        self.inner.shutdown.send_replace(true);
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.borrow().connected
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners().len()
    }
}

impl SignalSender for SignalingChannel {
    fn send(&self, message: ClientMessage) -> Result<()> {
        SignalingChannel::send(self, message)
    }
}

/// Disposal token for a channel subscription
pub struct Subscription {
    id: u64,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    channel: Weak<ChannelInner>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ChannelEvent> {
        self.events.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.channel.upgrade() {
            inner.listeners().remove(&self.id);
        }
    }
}
