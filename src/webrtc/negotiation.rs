//! Offer/answer/candidate state machine for the session's single peer connection.

use std::collections::VecDeque;
use std::fmt;
use tracing::{debug, error, info, warn};

use super::media::LocalMedia;
use super::peer::{PeerTransport, RemoteTrack};
use crate::error::{Result, SessionError};
use crate::signaling::{CloseSignal, IceCandidate, SessionDescription, Signal, SignalingChannel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    AwaitingRemote,
    Offering,
    Answering,
    Connected,
    Closed,
}

impl NegotiationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AwaitingRemote => "awaiting remote",
            Self::Offering => "offering",
            Self::Answering => "answering",
            Self::Connected => "connected",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type StateObserver = Box<dyn Fn(NegotiationState) + Send + Sync>;

pub struct NegotiationController<P: PeerTransport> {
    identity: String,
    on_state_change: Option<StateObserver>,
    peer: P,
    peer_closed: bool,
    state: NegotiationState,
    channel_closed: CloseSignal,
    local_media: Option<LocalMedia>,
    /// Set once the remote description has been applied; candidates wait in `pending_remote` until then.
    has_remote_description: bool,
    pending_remote: VecDeque<IceCandidate>,
    /// Local candidates found before our own description went out.
    description_sent: bool,
    pending_local: Vec<IceCandidate>,
    remote_stream: Option<String>,
    remote_tracks: Vec<P::Track>,
}

impl<P: PeerTransport> NegotiationController<P> {
    pub fn new(identity: impl Into<String>, peer: P, channel_closed: CloseSignal) -> Self {
        Self {
            identity: identity.into(),
            on_state_change: None,
            peer,
            peer_closed: false,
            state: NegotiationState::Idle,
            channel_closed,
            local_media: None,
            has_remote_description: false,
            pending_remote: VecDeque::new(),
            description_sent: false,
            pending_local: Vec::new(),
            remote_stream: None,
            remote_tracks: Vec::new(),
        }
    }

    pub fn on_state_change<F>(&mut self, observer: F)
    where
        F: Fn(NegotiationState) + Send + Sync + 'static,
    {
        self.on_state_change = Some(Box::new(observer));
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn local_media(&self) -> Option<&LocalMedia> {
        self.local_media.as_ref()
    }

    /// Tracks of the first remote stream, in arrival order.
    pub fn remote_tracks(&self) -> &[P::Track] {
        &self.remote_tracks
    }

    pub fn queued_candidates(&self) -> usize {
        self.pending_remote.len()
    }

    /// Attach the acquired local media and start waiting for the remote side.
    pub async fn start(&mut self, media: LocalMedia) -> Result<()> {
        self.require_state("start negotiation", &[NegotiationState::Idle])?;
        if self.channel_closed.is_closed() {
            return Err(SessionError::ChannelClosed);
        }
        let result = self.peer.add_local_media(&media).await;
        self.settle(result).await?;
        self.local_media = Some(media);
        self.transition(NegotiationState::AwaitingRemote);
        Ok(())
    }

    /// Caller side: create and send an offer.
    pub async fn initiate(&mut self, channel: &SignalingChannel) -> Result<()> {
        self.require_state("send an offer", &[NegotiationState::AwaitingRemote])?;
        self.transition(NegotiationState::Offering);

        let result = self.peer.create_offer().await;
        let offer = self.settle(result).await?;
        let result = self.peer.set_local_description(offer.clone()).await;
        self.settle(result).await?;

        self.send_description(channel, Signal::offer(offer)).await
    }

    pub async fn handle_offer(
        &mut self,
        channel: &SignalingChannel,
        from: Option<&str>,
        offer: SessionDescription,
    ) -> Result<()> {
        match self.state {
            NegotiationState::AwaitingRemote => {}
            NegotiationState::Offering => self.resolve_glare(from).await?,
            state => return Err(invalid("accept an offer", state)),
        }
        self.transition(NegotiationState::Answering);

        let result = self.peer.set_remote_description(offer).await;
        if let Err(e @ SessionError::MalformedEnvelope(_)) = result {
            // Nothing was applied; the offer is dropped and we keep waiting.
            self.transition(NegotiationState::AwaitingRemote);
            return Err(e);
        }
        self.settle(result).await?;
        self.remote_description_applied().await?;

        let result = self.peer.create_answer().await;
        let answer = self.settle(result).await?;
        let result = self.peer.set_local_description(answer.clone()).await;
        self.settle(result).await?;

        self.send_description(channel, Signal::answer(answer)).await?;
        self.transition(NegotiationState::Connected);
        Ok(())
    }

    pub async fn handle_answer(&mut self, answer: SessionDescription) -> Result<()> {
        self.require_state("accept an answer", &[NegotiationState::Offering])?;

        let result = self.peer.set_remote_description(answer).await;
        if let Err(e @ SessionError::MalformedEnvelope(_)) = result {
            return Err(e);
        }
        self.settle(result).await?;
        self.remote_description_applied().await?;
        self.transition(NegotiationState::Connected);
        Ok(())
    }

    /// Apply a remote candidate, or queue it until the remote description is in place.
    pub async fn handle_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        if self.state == NegotiationState::Closed {
            return Err(invalid("apply a candidate", self.state));
        }
        self.peer.check_candidate(&candidate)?;
        if !self.has_remote_description {
            debug!("Queueing remote candidate until remote description is set");
            self.pending_remote.push_back(candidate);
            return Ok(());
        }
        self.apply_candidate(candidate).await
    }

    /// Forward a locally gathered candidate, holding it until our description has been sent.
    pub fn handle_local_candidate(
        &mut self,
        channel: &SignalingChannel,
        candidate: IceCandidate,
    ) -> Result<()> {
        if self.state == NegotiationState::Closed {
            debug!("Dropping local candidate after close");
            return Ok(());
        }
        if !self.description_sent {
            self.pending_local.push(candidate);
            return Ok(());
        }
        channel.send(&Signal::candidate(candidate).encode()?)
    }

    /// Record a remote track. Returns it when it belongs to the first remote stream.
    pub fn handle_remote_track(&mut self, track: P::Track) -> Option<P::Track> {
        if self.state == NegotiationState::Closed {
            return None;
        }
        let stream_id = track.stream_id();
        let other_stream = self
            .remote_stream
            .as_ref()
            .is_some_and(|first| *first != stream_id);
        if other_stream {
            debug!("Ignoring track of additional remote stream {}", stream_id);
            return None;
        }
        if self.remote_stream.is_none() {
            info!("Remote stream {} available", stream_id);
            self.remote_stream = Some(stream_id);
        }
        self.remote_tracks.push(track.clone());
        Some(track)
    }

    /// Tear down the peer connection and release local media. Safe to call repeatedly.
    pub async fn close(&mut self) {
        self.transition(NegotiationState::Closed);
        self.pending_remote.clear();
        self.pending_local.clear();
        self.remote_tracks.clear();
        self.local_media = None;
        if !self.peer_closed {
            self.peer_closed = true;
            if let Err(e) = self.peer.close().await {
                warn!("{}", e);
            }
        }
    }

    /// Both sides offered at once. The lower identity yields and answers instead.
    async fn resolve_glare(&mut self, from: Option<&str>) -> Result<()> {
        let Some(remote) = from else {
            warn!("Offer collision with an unidentified peer, keeping our offer");
            return Err(invalid("accept an offer", self.state));
        };
        if self.identity.as_str() >= remote {
            info!("Offer collision with {}, keeping our offer", remote);
            return Err(invalid("accept an offer", self.state));
        }
        info!("Offer collision with {}, rolling back our offer", remote);
        let result = self.peer.rollback().await;
        self.settle(result).await?;
        self.description_sent = false;
        self.pending_local.clear();
        self.transition(NegotiationState::AwaitingRemote);
        Ok(())
    }

    async fn remote_description_applied(&mut self) -> Result<()> {
        self.has_remote_description = true;
        while let Some(candidate) = self.pending_remote.pop_front() {
            self.apply_candidate(candidate).await?;
        }
        Ok(())
    }

    async fn apply_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        let result = self.peer.add_ice_candidate(candidate).await;
        self.checkpoint().await?;
        match result {
            Ok(()) => Ok(()),
            Err(e @ SessionError::MalformedEnvelope(_)) => Err(e),
            Err(e) => {
                // Duplicates and stale candidates are hints the agent may refuse.
                warn!("Ignoring rejected candidate: {}", e);
                Ok(())
            }
        }
    }

    async fn send_description(&mut self, channel: &SignalingChannel, signal: Signal) -> Result<()> {
        if let Err(e) = channel.send(&signal.encode()?) {
            self.close().await;
            return Err(if e == SessionError::ChannelNotReady {
                SessionError::ChannelClosed
            } else {
                e
            });
        }
        self.description_sent = true;
        for candidate in std::mem::take(&mut self.pending_local) {
            channel.send(&Signal::candidate(candidate).encode()?)?;
        }
        Ok(())
    }

    /// Runs after every suspension point: a result that lands after the channel closed is discarded.
    async fn checkpoint(&mut self) -> Result<()> {
        if self.channel_closed.is_closed() {
            debug!("Discarding negotiation result, channel closed");
            self.close().await;
            return Err(SessionError::ChannelClosed);
        }
        Ok(())
    }

    async fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        self.checkpoint().await?;
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                error!("Negotiation failed while {}: {}", self.state, e);
                self.close().await;
                Err(e)
            }
        }
    }

    fn require_state(&self, operation: &'static str, allowed: &[NegotiationState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(invalid(operation, self.state))
        }
    }

    fn transition(&mut self, next: NegotiationState) {
        if self.state != next {
            info!("Negotiation {} -> {}", self.state, next);
            self.state = next;
            if let Some(observer) = &self.on_state_change {
                observer(next);
            }
        }
    }
}

fn invalid(operation: &'static str, state: NegotiationState) -> SessionError {
    SessionError::InvalidState {
        operation,
        state: state.as_str(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::RemoteEnd;
    use crate::webrtc::testing::{candidate, FakePeer, FakeTrack, OFFER_SDP};
    use serde_json::json;

    async fn ready(name: &str) -> (NegotiationController<FakePeer>, FakePeer, SignalingChannel, RemoteEnd) {
        let (channel, remote) = SignalingChannel::detached("r1", name);
        let peer = FakePeer::default();
        let mut controller = NegotiationController::new(name, peer.clone(), channel.close_signal());
        controller.start(LocalMedia::new(name)).await.unwrap();
        (controller, peer, channel, remote)
    }

    fn offer() -> SessionDescription {
        SessionDescription::offer(OFFER_SDP)
    }

    #[tokio::test]
    async fn start_moves_to_awaiting_remote() {
        let (controller, peer, _channel, _remote) = ready("alice").await;
        assert_eq!(controller.state(), NegotiationState::AwaitingRemote);
        assert!(controller.local_media().is_some());
        assert!(peer.calls()[0].starts_with("add_local_media:"));
    }

    #[tokio::test]
    async fn start_refuses_closed_channel() {
        let (channel, remote) = SignalingChannel::detached("r1", "alice");
        remote.close();
        let mut controller =
            NegotiationController::new("alice", FakePeer::default(), channel.close_signal());
        let err = controller.start(LocalMedia::new("alice")).await.unwrap_err();
        assert_eq!(err, SessionError::ChannelClosed);
        assert_eq!(controller.state(), NegotiationState::Idle);
    }

    #[tokio::test]
    async fn offer_produces_exactly_one_answer() {
        let (mut controller, peer, channel, mut remote) = ready("alice").await;
        controller
            .handle_offer(&channel, Some("bob"), offer())
            .await
            .unwrap();

        assert_eq!(controller.state(), NegotiationState::Connected);
        assert_eq!(
            remote.drain(),
            vec![json!({"type": "answer", "data": {"type": "answer", "sdp": "v=0 answer"}})]
        );
        assert_eq!(
            &peer.calls()[1..],
            &["set_remote:Offer", "create_answer", "set_local:Answer"]
        );
    }

    #[tokio::test]
    async fn early_candidates_apply_in_order_after_remote_description() {
        let (mut controller, peer, channel, _remote) = ready("alice").await;
        for c in ["c1", "c2", "c3"] {
            controller.handle_candidate(candidate(c)).await.unwrap();
        }
        assert_eq!(controller.queued_candidates(), 3);
        assert!(peer.applied_candidates().is_empty());

        controller
            .handle_offer(&channel, Some("bob"), offer())
            .await
            .unwrap();

        assert_eq!(peer.applied_candidates(), vec!["c1", "c2", "c3"]);
        assert_eq!(controller.queued_candidates(), 0);
        assert!(!peer.calls().iter().any(|c| c.starts_with("premature:")));
    }

    #[tokio::test]
    async fn candidates_after_remote_description_apply_immediately() {
        let (mut controller, peer, channel, _remote) = ready("alice").await;
        controller
            .handle_offer(&channel, Some("bob"), offer())
            .await
            .unwrap();
        controller.handle_candidate(candidate("late")).await.unwrap();
        assert_eq!(peer.applied_candidates(), vec!["late"]);
    }

    #[tokio::test]
    async fn unparsable_candidate_is_reported_and_not_queued() {
        let (mut controller, peer, channel, _remote) = ready("alice").await;
        let err = controller
            .handle_candidate(candidate("garbage"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::MalformedEnvelope(_)));
        assert_eq!(controller.queued_candidates(), 0);
        assert_eq!(controller.state(), NegotiationState::AwaitingRemote);

        controller
            .handle_offer(&channel, Some("bob"), offer())
            .await
            .unwrap();
        let err = controller
            .handle_candidate(candidate("garbage"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::MalformedEnvelope(_)));
        assert!(peer.applied_candidates().is_empty());
        assert_eq!(controller.state(), NegotiationState::Connected);
    }

    #[tokio::test]
    async fn duplicate_candidate_is_a_quiet_no_op() {
        let (mut controller, peer, channel, _remote) = ready("alice").await;
        controller
            .handle_offer(&channel, Some("bob"), offer())
            .await
            .unwrap();
        controller.handle_candidate(candidate("dup")).await.unwrap();
        controller.handle_candidate(candidate("dup")).await.unwrap();
        assert_eq!(peer.applied_candidates(), vec!["dup"]);
        assert_eq!(controller.state(), NegotiationState::Connected);
    }

    #[tokio::test]
    async fn answer_after_answering_an_offer_is_rejected() {
        let (mut controller, peer, channel, _remote) = ready("alice").await;
        controller
            .handle_offer(&channel, Some("bob"), offer())
            .await
            .unwrap();
        let calls_before = peer.calls();

        let err = controller
            .handle_answer(SessionDescription::answer("v=0"))
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::InvalidState { .. }));
        assert_eq!(controller.state(), NegotiationState::Connected);
        assert_eq!(peer.calls(), calls_before);
    }

    #[tokio::test]
    async fn answer_without_offer_is_rejected() {
        let (mut controller, _peer, _channel, _remote) = ready("alice").await;
        let err = controller
            .handle_answer(SessionDescription::answer("v=0"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            SessionError::InvalidState {
                operation: "accept an answer",
                state: "awaiting remote"
            }
        );
        assert_eq!(controller.state(), NegotiationState::AwaitingRemote);
    }

    #[tokio::test]
    async fn caller_path_reaches_connected_on_answer() {
        let (mut controller, peer, channel, mut remote) = ready("alice").await;
        controller.initiate(&channel).await.unwrap();
        assert_eq!(controller.state(), NegotiationState::Offering);
        let sent = remote.drain();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["type"], "offer");
        assert_eq!(sent[0]["data"]["type"], "offer");

        controller.handle_candidate(candidate("early")).await.unwrap();
        controller
            .handle_answer(SessionDescription::answer("v=0"))
            .await
            .unwrap();
        assert_eq!(controller.state(), NegotiationState::Connected);
        assert_eq!(peer.applied_candidates(), vec!["early"]);
        assert!(remote.drain().is_empty());
    }

    #[tokio::test]
    async fn local_candidates_wait_for_our_description() {
        let (mut controller, _peer, channel, mut remote) = ready("alice").await;
        controller
            .handle_local_candidate(&channel, candidate("mine"))
            .unwrap();
        assert!(remote.drain().is_empty());

        controller
            .handle_offer(&channel, Some("bob"), offer())
            .await
            .unwrap();
        let kinds: Vec<_> = remote.drain().into_iter().map(|v| v["type"].clone()).collect();
        assert_eq!(kinds, vec![json!("answer"), json!("candidate")]);

        controller
            .handle_local_candidate(&channel, candidate("later"))
            .unwrap();
        assert_eq!(
            remote.drain(),
            vec![json!({"type": "candidate", "data": {"candidate": "later", "sdpMid": "0", "sdpMLineIndex": 0}})]
        );
    }

    #[tokio::test]
    async fn glare_lower_identity_yields() {
        let (mut controller, peer, channel, mut remote) = ready("alice").await;
        controller.initiate(&channel).await.unwrap();
        remote.drain();

        controller
            .handle_offer(&channel, Some("bob"), offer())
            .await
            .unwrap();
        assert_eq!(controller.state(), NegotiationState::Connected);
        assert!(peer.calls().contains(&"rollback".to_owned()));
        assert_eq!(remote.drain()[0]["type"], "answer");
    }

    #[tokio::test]
    async fn glare_higher_identity_keeps_its_offer() {
        let (mut controller, peer, channel, _remote) = ready("zoe").await;
        controller.initiate(&channel).await.unwrap();
        let err = controller
            .handle_offer(&channel, Some("bob"), offer())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidState { .. }));
        assert_eq!(controller.state(), NegotiationState::Offering);
        assert!(!peer.calls().contains(&"rollback".to_owned()));
    }

    #[tokio::test]
    async fn unparsable_offer_keeps_waiting() {
        let (mut controller, _peer, channel, mut remote) = ready("alice").await;
        let err = controller
            .handle_offer(&channel, Some("bob"), SessionDescription::offer("garbage"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::MalformedEnvelope(_)));
        assert_eq!(controller.state(), NegotiationState::AwaitingRemote);
        assert!(remote.drain().is_empty());
    }

    #[tokio::test]
    async fn failed_negotiation_closes_controller() {
        let (mut controller, peer, channel, _remote) = ready("alice").await;
        let err = controller
            .handle_offer(&channel, Some("bob"), SessionDescription::offer("incompatible"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Negotiation(_)));
        assert_eq!(controller.state(), NegotiationState::Closed);
        assert_eq!(peer.calls().last().map(String::as_str), Some("close"));

        let err = controller.handle_candidate(candidate("c")).await.unwrap_err();
        assert_eq!(
            err,
            SessionError::InvalidState {
                operation: "apply a candidate",
                state: "closed"
            }
        );
    }

    #[tokio::test]
    async fn answer_resolving_after_close_is_discarded() {
        let (mut controller, peer, channel, mut remote) = ready("alice").await;
        let gate = peer.hold_answers();

        let closer = tokio::spawn(async move {
            tokio::task::yield_now().await;
            remote.close();
            gate.notify_one();
            remote
        });
        let err = controller
            .handle_offer(&channel, Some("bob"), offer())
            .await
            .unwrap_err();
        let mut remote = closer.await.unwrap();

        assert_eq!(err, SessionError::ChannelClosed);
        assert_eq!(controller.state(), NegotiationState::Closed);
        assert!(!peer.calls().contains(&"set_local:Answer".to_owned()));
        assert!(remote.drain().is_empty());
        assert!(controller.local_media().is_none());
    }

    #[tokio::test]
    async fn only_first_remote_stream_is_surfaced() {
        let (mut controller, _peer, _channel, _remote) = ready("alice").await;
        assert!(controller
            .handle_remote_track(FakeTrack::new("audio", "s1"))
            .is_some());
        assert!(controller
            .handle_remote_track(FakeTrack::new("video", "s1"))
            .is_some());
        assert!(controller
            .handle_remote_track(FakeTrack::new("video", "s2"))
            .is_none());
        assert_eq!(controller.remote_tracks().len(), 2);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (mut controller, peer, _channel, _remote) = ready("alice").await;
        controller.close().await;
        controller.close().await;
        let closes = peer.calls().iter().filter(|c| *c == "close").count();
        assert_eq!(closes, 1);
        assert_eq!(controller.state(), NegotiationState::Closed);
    }
}
