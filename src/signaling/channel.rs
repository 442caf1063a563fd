//! WebSocket signaling channel: one connection per room, text frames carrying one envelope each.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::envelope::Envelope;
use crate::config::ClientConfig;
use crate::error::{Result, SessionError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub type CloseHandler = Box<dyn FnOnce() + Send>;

/// What the channel hands to its single consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Envelope(Envelope),
    /// A frame that could not be parsed; the frame itself is dropped.
    Malformed(SessionError),
}

pub type Inbound = mpsc::UnboundedReceiver<ChannelEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    Closed,
}

struct Lifecycle {
    state: ChannelState,
    on_close: Option<CloseHandler>,
}

struct Shared {
    lifecycle: Mutex<Lifecycle>,
    closed_tx: watch::Sender<bool>,
}

impl Shared {
    fn new() -> Arc<Self> {
        let (closed_tx, _) = watch::channel(false);
        Arc::new(Self {
            lifecycle: Mutex::new(Lifecycle {
                state: ChannelState::Open,
                on_close: None,
            }),
            closed_tx,
        })
    }

    fn state(&self) -> ChannelState {
        self.lifecycle.lock().state
    }

    /// Transition to `Closed`; only the first call has any effect.
    fn mark_closed(&self, reason: &str) {
        let handler = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state == ChannelState::Closed {
                return;
            }
            lifecycle.state = ChannelState::Closed;
            lifecycle.on_close.take()
        };
        info!("Signaling channel closed ({})", reason);
        self.closed_tx.send_replace(true);
        if let Some(handler) = handler {
            handler();
        }
    }
}

/// Observes channel closure; checked by negotiation at every suspension point.
#[derive(Clone)]
pub struct CloseSignal {
    rx: watch::Receiver<bool>,
}

impl CloseSignal {
    fn new(shared: &Shared) -> Self {
        Self {
            rx: shared.closed_tx.subscribe(),
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the channel has closed.
    pub async fn wait(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

pub struct SignalingChannel {
    room_id: String,
    name: String,
    outbound: mpsc::UnboundedSender<String>,
    inbound: Option<Inbound>,
    shared: Arc<Shared>,
}

impl SignalingChannel {
    /// Connect to the signaling server for `room_id` under the display name `name`.
    pub async fn open(config: &ClientConfig, room_id: &str, name: &str) -> Result<Self> {
        let endpoint = config
            .signaling_endpoint(room_id, name)
            .map_err(|e| SessionError::Connect(e.to_string()))?;

        info!("Connecting to signaling server: {}", endpoint);
        let (ws_stream, _) = connect_async(endpoint.as_str())
            .await
            .map_err(|e| SessionError::Connect(format!("Failed to connect: {}", e)))?;
        info!("Connected to signaling server for room {}", room_id);

        let (write, read) = ws_stream.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let shared = Shared::new();

        // Subscribed before spawning so a close that lands first is still seen.
        let sender_closed = CloseSignal::new(&shared);
        let receiver_closed = CloseSignal::new(&shared);
        tokio::spawn(Self::sender_task(write, outbound_rx, shared.clone(), sender_closed));
        tokio::spawn(Self::receiver_task(read, inbound_tx, shared.clone(), receiver_closed));

        Ok(Self {
            room_id: room_id.to_owned(),
            name: name.to_owned(),
            outbound: outbound_tx,
            inbound: Some(inbound_rx),
            shared,
        })
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// Serialize and transmit. Fails with `ChannelNotReady` once the channel is closed.
    pub fn send(&self, envelope: &Envelope) -> Result<()> {
        if !self.is_open() {
            return Err(SessionError::ChannelNotReady);
        }
        let frame = envelope.to_frame()?;
        debug!("Sending signaling frame: {}", frame);
        self.outbound.send(frame).map_err(|_| {
            self.shared.mark_closed("sender task gone");
            SessionError::ChannelNotReady
        })
    }

    /// Hand out the inbound stream. Only the first caller gets it.
    pub fn take_inbound(&mut self) -> Option<Inbound> {
        self.inbound.take()
    }

    /// Register the close handler. Fires exactly once: immediately if already closed.
    pub fn on_close<F>(&self, handler: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut lifecycle = self.shared.lifecycle.lock();
        if lifecycle.state == ChannelState::Closed {
            drop(lifecycle);
            handler();
        } else {
            lifecycle.on_close = Some(Box::new(handler));
        }
    }

    pub fn close_signal(&self) -> CloseSignal {
        CloseSignal::new(&self.shared)
    }

    pub fn close(&self) {
        self.shared.mark_closed("closed locally");
    }

    async fn sender_task(
        mut write: SplitSink<WsStream, Message>,
        mut rx: mpsc::UnboundedReceiver<String>,
        shared: Arc<Shared>,
        mut closed: CloseSignal,
    ) {
        loop {
            tokio::select! {
                // Frames accepted by `send` go out before the close frame.
                biased;
                Some(frame) = rx.recv() => {
                    if let Err(e) = write.send(Message::Text(frame)).await {
                        error!("Failed to send WebSocket message: {}", e);
                        shared.mark_closed("transport error");
                        break;
                    }
                }
                _ = closed.wait() => break,
            }
        }
        if let Err(e) = write.close().await {
            debug!("WebSocket close handshake failed: {}", e);
        }
        debug!("Sender task terminated");
    }

    async fn receiver_task(
        mut read: SplitStream<WsStream>,
        inbound: mpsc::UnboundedSender<ChannelEvent>,
        shared: Arc<Shared>,
        mut closed: CloseSignal,
    ) {
        loop {
            let next = tokio::select! {
                _ = closed.wait() => break,
                next = read.next() => next,
            };
            match next {
                Some(Ok(Message::Text(text))) => route_frame(&text, &inbound),
                Some(Ok(Message::Binary(_))) => {
                    let _ = inbound.send(ChannelEvent::Malformed(SessionError::MalformedEnvelope(
                        "binary frame".to_owned(),
                    )));
                }
                Some(Ok(Message::Close(_))) | None => {
                    shared.mark_closed("closed by server");
                    break;
                }
                Some(Err(e)) => {
                    error!("WebSocket error: {}", e);
                    shared.mark_closed("transport error");
                    break;
                }
                Some(Ok(_)) => {}
            }
        }
        debug!("Receiver task terminated");
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.shared.mark_closed("dropped");
    }
}

fn route_frame(text: &str, inbound: &mpsc::UnboundedSender<ChannelEvent>) {
    debug!("Received signaling frame: {}", text);
    let event = match Envelope::from_frame(text) {
        Ok(envelope) => ChannelEvent::Envelope(envelope),
        Err(e) => {
            warn!("Dropping signaling frame: {}", e);
            ChannelEvent::Malformed(e)
        }
    };
    let _ = inbound.send(event);
}

/// The server side of a channel that never touched the network.
#[cfg(test)]
pub(crate) struct RemoteEnd {
    inbound: mpsc::UnboundedSender<ChannelEvent>,
    outbound: mpsc::UnboundedReceiver<String>,
    shared: Arc<Shared>,
}

#[cfg(test)]
impl RemoteEnd {
    pub(crate) fn push_frame(&self, text: &str) {
        route_frame(text, &self.inbound);
    }

    pub(crate) fn push(&self, value: serde_json::Value) {
        self.push_frame(&value.to_string());
    }

    /// Next frame the client sent, parsed back into JSON.
    pub(crate) fn try_recv(&mut self) -> Option<serde_json::Value> {
        self.outbound
            .try_recv()
            .ok()
            .map(|frame| serde_json::from_str(&frame).expect("client sent invalid JSON"))
    }

    pub(crate) fn drain(&mut self) -> Vec<serde_json::Value> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    pub(crate) fn close(&self) {
        self.shared.mark_closed("closed by server");
    }
}

#[cfg(test)]
impl SignalingChannel {
    pub(crate) fn detached(room_id: &str, name: &str) -> (Self, RemoteEnd) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let shared = Shared::new();
        let channel = Self {
            room_id: room_id.to_owned(),
            name: name.to_owned(),
            outbound: outbound_tx,
            inbound: Some(inbound_rx),
            shared: shared.clone(),
        };
        let remote = RemoteEnd {
            inbound: inbound_tx,
            outbound: outbound_rx,
            shared,
        };
        (channel, remote)
    }
}
