mod channel;
mod envelope;

pub use channel::{ChannelEvent, ChannelState, CloseSignal, Inbound, SignalingChannel};
pub use envelope::{Envelope, IceCandidate, SdpType, SessionDescription, Signal};

#[cfg(test)]
pub(crate) use channel::RemoteEnd;
