use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use signal_core::{decode, encode_to_string, Envelope, EnvelopeKind};
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use crate::config::ServerArgs;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "signal-road")]
#[command(about = "WebRTC signaling relay and probe client")]
pub struct Cli {
    #[command(flatten)]
    pub server: ServerArgs,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the relay (default when no command is given)
    Serve,

    /// Join a session, optionally send an offer, and print what the relay delivers
    Probe {
        /// Relay URL (e.g., ws://localhost:8080)
        #[arg(short, long, default_value = "ws://localhost:8080")]
        url: String,

        /// Session ID to join
        #[arg(short, long)]
        session: String,

        /// SDP to send as an offer once joined
        #[arg(long)]
        offer: Option<String>,

        /// How long to keep listening before leaving
        #[arg(long, default_value_t = 10)]
        listen_secs: u64,
    },
}

fn session_url(url: &str, session: &str) -> String {
    format!("{}/ws/{}", url.trim_end_matches('/'), session)
}

/// Pulls our own peer id out of the join acknowledgement. The relay echoes
/// the join to the new member with `from` set to the assigned id.
fn joined_peer_id(envelope: &Envelope) -> Option<String> {
    if envelope.kind() != EnvelopeKind::Join {
        return None;
    }
    envelope
        .payload()
        .get("peerId")
        .and_then(Value::as_str)
        .filter(|peer_id| *peer_id == envelope.sender())
        .map(str::to_string)
}

pub async fn run_probe(
    url: String,
    session: String,
    offer: Option<String>,
    listen_secs: u64,
) -> Result<()> {
    let ws_url = session_url(&url, &session);
    debug!(url = %ws_url, "connecting probe");

    let (ws_stream, _) = match timeout(CONNECT_TIMEOUT, connect_async(ws_url.as_str())).await {
        Ok(result) => result.with_context(|| format!("failed to connect to {ws_url}"))?,
        Err(_) => bail!("connection timeout - is the relay running?"),
    };
    let (mut write, mut read) = ws_stream.split();

    let peer_id = timeout(CONNECT_TIMEOUT, async {
        while let Some(frame) = read.next().await {
            let Message::Text(text) = frame? else {
                continue;
            };
            let envelope = decode(text.as_bytes())?;
            print_envelope(&envelope)?;
            if envelope.kind() == EnvelopeKind::Error {
                return Err(anyhow!("join rejected: {}", envelope.payload()));
            }
            if let Some(peer_id) = joined_peer_id(&envelope) {
                return Ok::<_, anyhow::Error>(peer_id);
            }
        }
        Err(anyhow!("connection closed before join was acknowledged"))
    })
    .await
    .map_err(|_| anyhow!("timed out waiting for join acknowledgement"))??;

    debug!(peer_id = %peer_id, session_id = %session, "probe joined");

    if let Some(sdp) = offer {
        let text = encode_to_string(&Envelope::offer(peer_id.as_str(), None, &sdp))?;
        write.send(Message::Text(text.into())).await?;
    }

    let deadline = Instant::now() + Duration::from_secs(listen_secs);
    loop {
        let frame = match tokio::time::timeout_at(deadline, read.next()).await {
            Ok(Some(frame)) => frame?,
            Ok(None) | Err(_) => break,
        };
        match frame {
            Message::Text(text) => match decode(text.as_bytes()) {
                Ok(envelope) => print_envelope(&envelope)?,
                Err(err) => warn!(error = %err, "undecodable frame from relay"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    let leave = Envelope::leave(&session, &peer_id, "left");
    let _ = write.send(Message::Text(encode_to_string(&leave)?.into())).await;
    let _ = write.close().await;
    Ok(())
}

fn print_envelope(envelope: &Envelope) -> Result<()> {
    println!("{}", encode_to_string(envelope)?);
    Ok(())
}
