mod media;
mod negotiation;
mod peer;

#[cfg(test)]
pub(crate) mod testing;

pub use media::{LocalMedia, MediaSource, SampleCapture};
pub use negotiation::{NegotiationController, NegotiationState};
pub use peer::{PeerEvent, PeerEvents, PeerTransport, RemoteTrack, WebRtcPeer};
