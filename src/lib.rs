mod chat;
mod cli;
mod config;
mod error;
mod router;
mod session;
mod signaling;
mod webrtc;

pub use chat::{ChatLog, ChatMessage};
pub use cli::Cli;
pub use config::{load_config, save_config, ClientConfig, ConfigError};
pub use error::{Result, SessionError};
pub use router::{MessageRouter, Routed};
pub use session::{acquire_media, join, Session, SessionEvent, SessionHandle};
pub use signaling::{
    ChannelEvent, ChannelState, CloseSignal, Envelope, IceCandidate, SdpType,
    SessionDescription, Signal, SignalingChannel,
};
pub use webrtc::{
    LocalMedia, MediaSource, NegotiationController, NegotiationState, PeerEvent, PeerEvents,
    PeerTransport, RemoteTrack, SampleCapture, WebRtcPeer,
};

use clap::Parser;
use tracing_subscriber::EnvFilter;

pub fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("duocall=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(cli::run(cli))
}
