//! In-memory peer used by the negotiation and session tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;

use super::media::LocalMedia;
use super::peer::{PeerTransport, RemoteTrack};
use crate::error::{Result, SessionError};
use crate::signaling::{IceCandidate, SessionDescription};

pub(crate) const OFFER_SDP: &str = "v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\ns=-\r\nt=0 0\r\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FakeTrack {
    pub(crate) id: String,
    pub(crate) stream_id: String,
}

impl FakeTrack {
    pub(crate) fn new(id: &str, stream_id: &str) -> Self {
        Self {
            id: id.to_owned(),
            stream_id: stream_id.to_owned(),
        }
    }
}

impl RemoteTrack for FakeTrack {
    fn stream_id(&self) -> String {
        self.stream_id.clone()
    }
}

#[derive(Default)]
struct Recorded {
    calls: Vec<String>,
    applied: Vec<String>,
    has_remote: bool,
}

/// Records every call. Rejects candidates before a remote description and literal duplicates,
/// the way a real ICE agent does. The candidate text "garbage" does not parse.
#[derive(Clone, Default)]
pub(crate) struct FakePeer {
    recorded: Arc<Mutex<Recorded>>,
    answer_gate: Arc<Mutex<Option<Arc<Notify>>>>,
}

impl FakePeer {
    pub(crate) fn calls(&self) -> Vec<String> {
        self.recorded.lock().calls.clone()
    }

    pub(crate) fn applied_candidates(&self) -> Vec<String> {
        self.recorded.lock().applied.clone()
    }

    /// Make `create_answer` suspend until the returned handle is notified.
    pub(crate) fn hold_answers(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.answer_gate.lock() = Some(gate.clone());
        gate
    }

    fn record(&self, call: impl Into<String>) {
        self.recorded.lock().calls.push(call.into());
    }
}

#[async_trait]
impl PeerTransport for FakePeer {
    type Track = FakeTrack;

    async fn add_local_media(&self, media: &LocalMedia) -> Result<()> {
        self.record(format!("add_local_media:{}", media.stream_id()));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        self.record("create_offer");
        Ok(SessionDescription::offer(OFFER_SDP))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let gate = self.answer_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.record("create_answer");
        Ok(SessionDescription::answer("v=0 answer"))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.record(format!("set_local:{:?}", description.sdp_type));
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        match description.sdp.as_str() {
            "garbage" => Err(SessionError::MalformedEnvelope("invalid SDP".to_owned())),
            "incompatible" => Err(SessionError::Negotiation("no common codec".to_owned())),
            _ => {
                let mut recorded = self.recorded.lock();
                recorded
                    .calls
                    .push(format!("set_remote:{:?}", description.sdp_type));
                recorded.has_remote = true;
                Ok(())
            }
        }
    }

    async fn rollback(&self) -> Result<()> {
        self.record("rollback");
        Ok(())
    }

    fn check_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        if candidate.candidate == "garbage" {
            return Err(SessionError::MalformedEnvelope(
                "invalid ICE candidate".to_owned(),
            ));
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.check_candidate(&candidate)?;
        let mut recorded = self.recorded.lock();
        if !recorded.has_remote {
            recorded.calls.push(format!("premature:{}", candidate.candidate));
            return Err(SessionError::Negotiation(
                "remote description not set".to_owned(),
            ));
        }
        if recorded.applied.contains(&candidate.candidate) {
            return Err(SessionError::Negotiation("duplicate candidate".to_owned()));
        }
        recorded.applied.push(candidate.candidate);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.record("close");
        Ok(())
    }
}

pub(crate) fn candidate(text: &str) -> IceCandidate {
    IceCandidate {
        candidate: text.to_owned(),
        sdp_mid: Some("0".to_owned()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}
