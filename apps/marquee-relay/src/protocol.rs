use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Identity of one WebSocket connection, minted at upgrade time.
pub type ConnectionId = Uuid;

pub fn generate_connection_id() -> ConnectionId {
    Uuid::new_v4()
}

/// One roster entry: a project's display as shown to every peer.
/// `is_occupied` is derived from the pairing state, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplaySummary {
    pub code: String,
    pub display_name: String,
    pub is_occupied: bool,
    pub project_name: String,
}

/// Messages sent from a peer to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// A display announces its code under a project.
    #[serde(rename_all = "camelCase")]
    RegisterDisplay {
        code: String,
        project_name: String,
        #[serde(default)]
        display_name: Option<String>,
    },
    /// A remote asks to control the display holding `code`.
    PairRemote { code: String },
    /// A paired remote moves to another display in the same project.
    #[serde(rename_all = "camelCase")]
    SwitchDisplay {
        new_code: String,
        #[serde(default)]
        project_name: Option<String>,
    },
    /// Fire-and-forget command relayed to the code's topic.
    RemoteCommand {
        code: String,
        command: String,
        #[serde(default)]
        payload: Option<Value>,
    },
    /// A display pushes its current application state.
    #[serde(rename_all = "camelCase")]
    DisplayState {
        code: String,
        project_name: String,
        state: Value,
    },
    /// A display pushes its drill-down selection.
    #[serde(rename_all = "camelCase")]
    SecondLevelUpdate {
        #[serde(default)]
        selected_units: Vec<Value>,
    },
    /// Heartbeat.
    Ping,
}

/// Messages sent from the relay to a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    RegisteredDisplay { code: String, project_name: String },
    RegisterError { message: String },
    #[serde(rename_all = "camelCase")]
    PairSuccess {
        code: String,
        project_name: String,
        display_name: String,
        displays: Vec<DisplaySummary>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        current_state: Option<Value>,
    },
    PairError { message: String },
    /// Broadcast to the code topic when a remote takes the display.
    Paired { code: String },
    #[serde(rename_all = "camelCase")]
    SwitchSuccess {
        code: String,
        display_name: String,
        displays: Vec<DisplaySummary>,
    },
    SwitchError { message: String },
    DisplayListUpdate { displays: Vec<DisplaySummary> },
    RemoteCommand {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    #[serde(rename_all = "camelCase")]
    DisplayState {
        state: Value,
        current_display: String,
        current_display_code: String,
        project_name: String,
    },
    #[serde(rename_all = "camelCase")]
    SecondLevelUpdate {
        selected_units: Vec<Value>,
        current_display: String,
        current_display_code: String,
        project_name: String,
    },
    /// Unicast to a paired remote whose display's connection dropped.
    DisplayGone { code: String },
    Pong,
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[timebox::timeout]
    fn register_display_wire_shape() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "register_display",
            "code": "1111",
            "projectName": "harborview",
        }))
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::RegisterDisplay {
                code: "1111".into(),
                project_name: "harborview".into(),
                display_name: None,
            }
        );
    }

    #[timebox::timeout]
    fn pair_success_uses_camel_case_fields() {
        let msg = ServerMessage::PairSuccess {
            code: "1111".into(),
            project_name: "harborview".into(),
            display_name: "Lobby".into(),
            displays: vec![DisplaySummary {
                code: "1111".into(),
                display_name: "Lobby".into(),
                is_occupied: true,
                project_name: "harborview".into(),
            }],
            current_state: None,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "pair_success");
        assert_eq!(value["projectName"], "harborview");
        assert_eq!(value["displays"][0]["isOccupied"], true);
        // Absent cached state is omitted entirely, not serialized as null.
        assert!(value.get("currentState").is_none());
    }

    #[timebox::timeout]
    fn ping_round_trips() {
        let text = serde_json::to_string(&ClientMessage::Ping).unwrap();
        assert_eq!(text, r#"{"type":"ping"}"#);
        let back: ClientMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(back, ClientMessage::Ping);
    }

    #[timebox::timeout]
    fn remote_command_payload_is_optional() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "remote_command",
            "code": "1111",
            "command": "request_homes",
        }))
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::RemoteCommand {
                code: "1111".into(),
                command: "request_homes".into(),
                payload: None,
            }
        );
    }

    #[timebox::timeout]
    fn display_state_push_shape() {
        let msg = ServerMessage::DisplayState {
            state: json!({"firstLevelFilter": {"selectedBuildings": []}}),
            current_display: "Lobby".into(),
            current_display_code: "1111".into(),
            project_name: "harborview".into(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "display_state");
        assert_eq!(value["currentDisplayCode"], "1111");
        assert_eq!(value["projectName"], "harborview");
    }
}
