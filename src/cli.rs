//! Terminal host: joins a room, prints what the session reports, sends typed lines as chat.

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::config::{load_config, save_config, ClientConfig};
use crate::session::{self, SessionEvent};
use crate::webrtc::{RemoteTrack, SampleCapture};

#[derive(Parser, Debug)]
#[command(name = "duocall", version, about = "Two-party call and chat over a signaling server")]
pub struct Cli {
    /// Room to join
    pub room: String,

    /// Display name (defaults to the saved username)
    #[arg(short, long)]
    pub name: Option<String>,

    /// Signaling server, ws:// or wss://
    #[arg(long, env = "DUOCALL_SIGNALING_URL")]
    pub server: Option<String>,

    /// STUN/TURN url, repeatable; replaces the configured list
    #[arg(long = "ice-server")]
    pub ice_servers: Vec<String>,

    /// Send the offer instead of waiting for one
    #[arg(long)]
    pub call: bool,

    /// Persist name and server for next time
    #[arg(long)]
    pub save: bool,
}

impl Cli {
    pub fn apply(&self, mut config: ClientConfig) -> ClientConfig {
        if let Some(name) = &self.name {
            config.username = name.clone();
        }
        if let Some(server) = &self.server {
            config.signaling_url = server.clone();
        }
        if !self.ice_servers.is_empty() {
            config.ice_servers = self.ice_servers.clone();
        }
        config
    }
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = cli.apply(load_config());
    if cli.save {
        save_config(&config)?;
    }

    let capture = SampleCapture::new(config.username.clone());
    let (session, mut handle) =
        session::join(&config, &cli.room, &config.username, &capture).await?;
    let task = tokio::spawn(session.run());

    if cli.call {
        handle.call()?;
    }

    println!(
        "Joined room {} as {}. Type to chat, /call to offer, /quit to leave.",
        cli.room, config.username
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            event = handle.next_event() => match event {
                Some(SessionEvent::Ended) | None => break,
                Some(event) => print_event(event),
            },
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) => match line.trim() {
                    "" => {}
                    "/quit" => handle.leave()?,
                    "/call" => handle.call()?,
                    text => handle.send_chat(text)?,
                },
                None => {
                    stdin_open = false;
                    handle.leave()?;
                }
            },
        }
    }

    task.await?;
    Ok(())
}

fn print_event<T: RemoteTrack>(event: SessionEvent<T>) {
    match event {
        SessionEvent::StateChanged(state) => println!("* {}", state),
        SessionEvent::LocalMedia(media) => println!("* local media {}", media.stream_id()),
        SessionEvent::RemoteMedia(track) => println!("* remote media {}", track.stream_id()),
        SessionEvent::Chat(message) => println!("<{}> {}", message.from, message.content),
        SessionEvent::Notice(e) => eprintln!("! {}", e),
        SessionEvent::Ended => println!("* session ended"),
    }
}
