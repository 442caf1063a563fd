//! One call: a signaling channel, its negotiation, and its chat log, driven as a single ordered task.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::track::track_remote::TrackRemote;

use crate::chat::{ChatLog, ChatMessage};
use crate::config::ClientConfig;
use crate::error::{Result, SessionError};
use crate::router::{MessageRouter, Routed};
use crate::signaling::{ChannelEvent, CloseSignal, Inbound, SignalingChannel};
use crate::webrtc::{
    LocalMedia, MediaSource, NegotiationController, NegotiationState, PeerEvent, PeerEvents,
    PeerTransport, WebRtcPeer,
};

/// Everything the host may want to show to the user.
#[derive(Debug, Clone)]
pub enum SessionEvent<T> {
    StateChanged(NegotiationState),
    LocalMedia(LocalMedia),
    /// A track of the first remote stream, ready to be attached to a renderer.
    RemoteMedia(T),
    Chat(ChatMessage),
    Notice(SessionError),
    Ended,
}

#[derive(Debug)]
enum Command {
    SendChat(String),
    Call,
    Leave,
}

/// Host side of a running session.
pub struct SessionHandle<T> {
    commands: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedReceiver<SessionEvent<T>>,
}

impl<T> SessionHandle<T> {
    pub fn send_chat(&self, content: impl Into<String>) -> Result<()> {
        self.command(Command::SendChat(content.into()))
    }

    /// Take the caller role and send an offer.
    pub fn call(&self) -> Result<()> {
        self.command(Command::Call)
    }

    pub fn leave(&self) -> Result<()> {
        self.command(Command::Leave)
    }

    /// Next event, or `None` once the session task is gone.
    pub async fn next_event(&mut self) -> Option<SessionEvent<T>> {
        self.events.recv().await
    }

    fn command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| SessionError::ChannelClosed)
    }
}

pub struct Session<P: PeerTransport> {
    channel: SignalingChannel,
    inbound: Inbound,
    negotiation: NegotiationController<P>,
    peer_events: PeerEvents<P::Track>,
    chat: ChatLog,
    events: mpsc::UnboundedSender<SessionEvent<P::Track>>,
    commands: mpsc::UnboundedReceiver<Command>,
}

/// Open the channel, acquire media, build the peer connection, in that order.
pub async fn join(
    config: &ClientConfig,
    room_id: &str,
    name: &str,
    media_source: &dyn MediaSource,
) -> Result<(Session<WebRtcPeer>, SessionHandle<Arc<TrackRemote>>)> {
    let channel = SignalingChannel::open(config, room_id, name).await?;
    let media = acquire_media(&channel, media_source).await?;
    let (peer, peer_events) = WebRtcPeer::connect(&config.ice_servers).await?;
    Session::new(channel, media, peer, peer_events).await
}

/// Wait for local capture, giving up if the channel closes first.
pub async fn acquire_media(
    channel: &SignalingChannel,
    media_source: &dyn MediaSource,
) -> Result<LocalMedia> {
    let mut closed = channel.close_signal();
    tokio::select! {
        biased;
        _ = closed.wait() => Err(SessionError::ChannelClosed),
        media = media_source.acquire() => media.map_err(|e| match e {
            SessionError::MediaUnavailable(_) => e,
            other => SessionError::MediaUnavailable(other.to_string()),
        }),
    }
}

impl<P: PeerTransport> Session<P> {
    /// Requires an open channel and acquired media; no session exists otherwise.
    pub async fn new(
        mut channel: SignalingChannel,
        media: LocalMedia,
        peer: P,
        peer_events: PeerEvents<P::Track>,
    ) -> Result<(Self, SessionHandle<P::Track>)> {
        if !channel.is_open() {
            return Err(SessionError::ChannelNotReady);
        }
        let inbound = channel
            .take_inbound()
            .ok_or(SessionError::ChannelNotReady)?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let close_events = events_tx.clone();
        channel.on_close(move || {
            let _ = close_events.send(SessionEvent::Notice(SessionError::ChannelClosed));
        });

        let mut negotiation =
            NegotiationController::new(channel.name(), peer, channel.close_signal());
        let state_events = events_tx.clone();
        negotiation.on_state_change(move |state| {
            let _ = state_events.send(SessionEvent::StateChanged(state));
        });
        negotiation.start(media.clone()).await?;
        let _ = events_tx.send(SessionEvent::LocalMedia(media));

        info!(
            "Session ready in room {} as {}",
            channel.room_id(),
            channel.name()
        );

        let session = Self {
            channel,
            inbound,
            negotiation,
            peer_events,
            chat: ChatLog::new(),
            events: events_tx,
            commands: commands_rx,
        };
        let handle = SessionHandle {
            commands: commands_tx,
            events: events_rx,
        };
        Ok((session, handle))
    }

    pub fn chat(&self) -> &ChatLog {
        &self.chat
    }

    pub fn state(&self) -> NegotiationState {
        self.negotiation.state()
    }

    /// Process channel, peer and host input one at a time until the channel closes.
    pub async fn run(mut self) {
        let mut closed = self.channel.close_signal();
        loop {
            tokio::select! {
                biased;
                _ = closed.wait() => break,
                command = self.commands.recv() => match command {
                    Some(Command::Leave) | None => break,
                    Some(command) => self.handle_command(command, &mut closed).await,
                },
                Some(event) = self.inbound.recv() => self.handle_inbound(event, &mut closed).await,
                Some(event) = self.peer_events.recv() => self.handle_peer_event(event),
            }
        }
        self.shutdown().await;
    }

    async fn handle_inbound(&mut self, event: ChannelEvent, closed: &mut CloseSignal) {
        let mut router = MessageRouter::new(&self.channel, &mut self.negotiation, &mut self.chat);
        let outcome = tokio::select! {
            biased;
            _ = closed.wait() => {
                debug!("Channel closed mid-dispatch, discarding in-flight step");
                return;
            }
            outcome = router.route(event) => outcome,
        };
        match outcome {
            Ok(Routed::Chat(message)) => self.emit(SessionEvent::Chat(message)),
            Ok(_) => {}
            Err(e) => self.report(e),
        }
    }

    async fn handle_command(&mut self, command: Command, closed: &mut CloseSignal) {
        match command {
            Command::SendChat(content) => {
                let sent = self.chat.send(&self.channel, &content, self.channel.name());
                match sent {
                    Ok(message) => self.emit(SessionEvent::Chat(message)),
                    Err(e) => {
                        if let Some(message) = self.chat.latest().cloned() {
                            self.emit(SessionEvent::Chat(message));
                        }
                        self.report(e);
                    }
                }
            }
            Command::Call => {
                let outcome = tokio::select! {
                    biased;
                    _ = closed.wait() => return,
                    outcome = self.negotiation.initiate(&self.channel) => outcome,
                };
                if let Err(e) = outcome {
                    self.report(e);
                }
            }
            Command::Leave => {}
        }
    }

    fn handle_peer_event(&mut self, event: PeerEvent<P::Track>) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                if let Err(e) = self
                    .negotiation
                    .handle_local_candidate(&self.channel, candidate)
                {
                    self.report(e);
                }
            }
            PeerEvent::GatheringComplete => debug!("Local candidate gathering complete"),
            PeerEvent::RemoteTrack(track) => {
                if let Some(track) = self.negotiation.handle_remote_track(track) {
                    self.emit(SessionEvent::RemoteMedia(track));
                }
            }
        }
    }

    async fn shutdown(mut self) {
        info!("Ending session in room {}", self.channel.room_id());
        self.negotiation.close().await;
        self.channel.close();
        let _ = self.events.send(SessionEvent::Ended);
    }

    /// Channel closure is announced by the close handler; everything else reaches the host here.
    fn report(&self, e: SessionError) {
        if e == SessionError::ChannelClosed {
            return;
        }
        warn!("{}", e);
        self.emit(SessionEvent::Notice(e));
    }

    fn emit(&self, event: SessionEvent<P::Track>) {
        let _ = self.events.send(event);
    }
}
