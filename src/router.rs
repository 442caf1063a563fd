//! Dispatches each inbound envelope by its type tag.

use tracing::{debug, warn};

use crate::chat::{ChatLog, ChatMessage};
use crate::error::{Result, SessionError};
use crate::signaling::{ChannelEvent, Envelope, Signal, SignalingChannel};
use crate::webrtc::{NegotiationController, PeerTransport};

/// What handling an envelope changed.
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    Chat(ChatMessage),
    Offer,
    Answer,
    Candidate,
}

pub struct MessageRouter<'a, P: PeerTransport> {
    channel: &'a SignalingChannel,
    negotiation: &'a mut NegotiationController<P>,
    chat: &'a mut ChatLog,
}

impl<'a, P: PeerTransport> MessageRouter<'a, P> {
    pub fn new(
        channel: &'a SignalingChannel,
        negotiation: &'a mut NegotiationController<P>,
        chat: &'a mut ChatLog,
    ) -> Self {
        Self {
            channel,
            negotiation,
            chat,
        }
    }

    pub async fn route(&mut self, event: ChannelEvent) -> Result<Routed> {
        match event {
            ChannelEvent::Envelope(envelope) => self.dispatch(envelope).await,
            ChannelEvent::Malformed(e) => Err(e),
        }
    }

    /// Completes every negotiation step for this envelope before returning.
    pub async fn dispatch(&mut self, envelope: Envelope) -> Result<Routed> {
        let signal = Signal::decode(envelope).inspect_err(|e| {
            warn!("Dropping envelope: {}", e);
        })?;
        debug!("Dispatching {} envelope", signal.kind());

        match signal {
            Signal::Chat { from, content } => {
                let from = from.ok_or_else(|| {
                    SessionError::MalformedEnvelope("chat envelope without 'from'".to_owned())
                })?;
                let message = ChatMessage::new(from, content);
                self.chat.append(message.clone());
                Ok(Routed::Chat(message))
            }
            Signal::Offer { from, description } => {
                self.negotiation
                    .handle_offer(self.channel, from.as_deref(), description)
                    .await?;
                Ok(Routed::Offer)
            }
            Signal::Answer { description, .. } => {
                self.negotiation.handle_answer(description).await?;
                Ok(Routed::Answer)
            }
            Signal::Candidate { candidate, .. } => {
                self.negotiation.handle_candidate(candidate).await?;
                Ok(Routed::Candidate)
            }
            Signal::Error { message } => Err(SessionError::NegotiationRejected(message)),
        }
    }
}
