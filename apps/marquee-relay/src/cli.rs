use anyhow::Result;
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use crate::protocol::{ClientMessage, ServerMessage};

#[derive(Parser, Debug)]
#[command(name = "marquee-relay")]
#[command(about = "Marquee pairing relay server and probe client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Pair with a display code and print everything the relay pushes back
    Probe {
        /// Relay URL (e.g., ws://localhost:4617)
        #[arg(short, long, default_value = "ws://localhost:4617")]
        url: String,

        /// 4-character display code to pair with
        #[arg(short, long)]
        code: String,

        /// Seconds to keep listening for pushed state before exiting
        #[arg(short, long, default_value_t = 5)]
        listen: u64,
    },
}

/// Connects as a remote, pairs with `code`, prints the roster and whatever
/// the display pushes during the listen window.
pub async fn run_probe(url: String, code: String, listen: u64) -> Result<()> {
    let ws_url = format!("{}/ws", url.trim_end_matches('/'));
    debug!("connecting to {ws_url}");

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&ws_url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => return Err(anyhow::anyhow!("connection failed: {err}")),
        Err(_) => {
            return Err(anyhow::anyhow!(
                "connection timeout - is the relay running at {url}?"
            ))
        }
    };
    let (mut write, mut read) = ws_stream.split();

    let pair_text = serde_json::to_string(&ClientMessage::PairRemote { code: code.clone() })?;
    write.send(Message::Text(pair_text.into())).await?;

    // First reply settles the pairing before anything else is interesting.
    let paired = timeout(Duration::from_secs(5), async {
        while let Some(frame) = read.next().await {
            if let Message::Text(text) = frame? {
                match serde_json::from_str::<ServerMessage>(&text)? {
                    ServerMessage::PairSuccess {
                        code,
                        project_name,
                        display_name,
                        displays,
                        current_state,
                    } => {
                        println!("paired with {display_name} ({code}) in project {project_name}");
                        for display in &displays {
                            let marker = if display.is_occupied { "*" } else { " " };
                            println!("  {marker} {} {}", display.code, display.display_name);
                        }
                        if let Some(state) = current_state {
                            println!("cached state: {state}");
                        }
                        return Ok::<_, anyhow::Error>(());
                    }
                    ServerMessage::PairError { message } => {
                        return Err(anyhow::anyhow!("pair failed: {message}"));
                    }
                    _ => {}
                }
            }
        }
        Err(anyhow::anyhow!("connection closed before pairing settled"))
    })
    .await;

    match paired {
        Ok(result) => result?,
        Err(_) => return Err(anyhow::anyhow!("timeout waiting for pair response")),
    }

    // Keep the window open and narrate the push traffic.
    let deadline = Instant::now() + Duration::from_secs(listen);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let frame = match timeout(remaining, read.next()).await {
            Ok(Some(frame)) => frame?,
            Ok(None) => break,
            Err(_) => break,
        };
        if let Message::Text(text) = frame {
            match serde_json::from_str::<ServerMessage>(&text) {
                Ok(ServerMessage::DisplayState {
                    state,
                    current_display_code,
                    ..
                }) => println!("state from {current_display_code}: {state}"),
                Ok(ServerMessage::SecondLevelUpdate { selected_units, .. }) => {
                    println!("second-level selection: {} unit(s)", selected_units.len())
                }
                Ok(ServerMessage::DisplayListUpdate { displays }) => {
                    println!("roster update: {} display(s)", displays.len())
                }
                Ok(ServerMessage::DisplayGone { code }) => {
                    println!("display {code} disconnected");
                    break;
                }
                Ok(other) => debug!(?other, "ignoring"),
                Err(err) => debug!(%err, "unparseable frame"),
            }
        }
    }

    write.send(Message::Close(None)).await?;
    Ok(())
}
