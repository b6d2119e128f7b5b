use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, error, warn};

use crate::hub::TopicHub;
use crate::protocol::{generate_connection_id, ClientMessage, ConnectionId, ServerMessage};
use crate::registry::Registry;

/// Shared state handed to every route.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub hub: TopicHub,
}

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let conn = generate_connection_id();
    let (mut sender, mut receiver) = socket.split();

    // Everything addressed to this peer funnels through one channel; a
    // dedicated task forwards it onto the socket.
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    state.hub.attach(conn, tx.clone());

    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(err) => error!(%conn, %err, "failed to encode outbound message"),
            }
        }
        debug!(%conn, "writer task ended");
    });

    debug!(%conn, "websocket connected");

    while let Some(frame) = receiver.next().await {
        let msg = match frame {
            Ok(msg) => msg,
            Err(err) => {
                debug!(%conn, %err, "websocket read error");
                break;
            }
        };

        match msg {
            Message::Text(text) => dispatch(&state, conn, &tx, &text),
            // Binary frames carrying UTF-8 JSON are accepted for clients
            // that cannot send text frames.
            Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                Ok(text) => dispatch(&state, conn, &tx, &text),
                Err(_) => debug!(%conn, "non-UTF8 binary frame ignored"),
            },
            Message::Close(_) => {
                debug!(%conn, "close frame received");
                break;
            }
            _ => {}
        }
    }

    // The reconciler restores every invariant the dropped connection
    // touched, then the hub forgets the channel.
    state.registry.release_connection(conn);
    debug!(%conn, "websocket disconnected");
}

fn dispatch(
    state: &AppState,
    conn: ConnectionId,
    tx: &UnboundedSender<ServerMessage>,
    text: &str,
) {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(msg) => handle_client_message(state, conn, tx, msg),
        Err(err) => {
            warn!(%conn, %err, "unparseable client message");
            let _ = tx.send(ServerMessage::Error {
                message: format!("invalid message format: {err}"),
            });
        }
    }
}

/// Registry operations are synchronous in-memory work, so the whole
/// dispatch is too; the direct reply goes out on the caller's own channel.
fn handle_client_message(
    state: &AppState,
    conn: ConnectionId,
    tx: &UnboundedSender<ServerMessage>,
    message: ClientMessage,
) {
    match message {
        ClientMessage::RegisterDisplay {
            code,
            project_name,
            display_name,
        } => {
            let reply = match state
                .registry
                .register_display(conn, &project_name, &code, display_name)
            {
                Ok(reg) => ServerMessage::RegisteredDisplay {
                    code: reg.code,
                    project_name: reg.project_name,
                },
                Err(err) => ServerMessage::RegisterError {
                    message: err.to_string(),
                },
            };
            let _ = tx.send(reply);
        }

        ClientMessage::PairRemote { code } => {
            let reply = match state.registry.pair_remote(conn, &code) {
                Ok(pair) => ServerMessage::PairSuccess {
                    code: pair.code,
                    project_name: pair.project_name,
                    display_name: pair.display_name,
                    displays: pair.displays,
                    current_state: pair.current_state,
                },
                Err(err) => ServerMessage::PairError {
                    message: err.to_string(),
                },
            };
            let _ = tx.send(reply);
        }

        ClientMessage::SwitchDisplay {
            new_code,
            project_name,
        } => {
            let reply = match state
                .registry
                .switch_display(conn, &new_code, project_name.as_deref())
            {
                Ok(switch) => ServerMessage::SwitchSuccess {
                    code: switch.code,
                    display_name: switch.display_name,
                    displays: switch.displays,
                },
                Err(err) => ServerMessage::SwitchError {
                    message: err.to_string(),
                },
            };
            let _ = tx.send(reply);
        }

        ClientMessage::RemoteCommand {
            code,
            command,
            payload,
        } => {
            state.registry.relay_command(&code, command, payload);
        }

        ClientMessage::DisplayState {
            code,
            project_name,
            state: display_state,
        } => {
            state
                .registry
                .update_display_state(conn, &code, &project_name, display_state);
        }

        ClientMessage::SecondLevelUpdate { selected_units } => {
            state.registry.update_second_level(conn, selected_units);
        }

        ClientMessage::Ping => {
            let _ = tx.send(ServerMessage::Pong);
        }
    }
}
