use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::RegistryError;
use crate::hub::TopicHub;
use crate::protocol::{ConnectionId, DisplaySummary, ServerMessage};

pub fn code_topic(code: &str) -> String {
    format!("pair:{code}")
}

pub fn project_topic(project_name: &str) -> String {
    format!("project:{project_name}")
}

/// One addressable target a remote can control.
#[derive(Debug, Clone)]
pub struct Display {
    pub code: String,
    pub display_name: String,
    pub project_name: String,
    pub owner: ConnectionId,
    pub paired_remote: Option<ConnectionId>,
    pub last_state: Option<Value>,
    pub last_second_level: Option<Value>,
    pub registered_at: DateTime<Utc>,
}

impl Display {
    fn summary(&self) -> DisplaySummary {
        DisplaySummary {
            code: self.code.clone(),
            display_name: self.display_name.clone(),
            is_occupied: self.paired_remote.is_some(),
            project_name: self.project_name.clone(),
        }
    }
}

/// What a remote connection is currently bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RemotePairing {
    project_name: String,
    code: String,
}

/// Role tag assigned at the first successful register/pair. The `Display`
/// variant doubles as the connection -> display reverse index.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ConnectionRole {
    Display { project_name: String, code: String },
    Remote,
}

#[derive(Default)]
struct RegistryInner {
    /// project name -> displays in registration order.
    projects: HashMap<String, Vec<Display>>,
    /// code -> projects holding that code, in registration order. Kept
    /// consistent with every insert/delete; the first entry is what a
    /// project-less lookup resolves to.
    code_index: HashMap<String, Vec<String>>,
    pairings: HashMap<ConnectionId, RemotePairing>,
    roles: HashMap<ConnectionId, ConnectionRole>,
}

impl RegistryInner {
    fn roster(&self, project_name: &str) -> Vec<DisplaySummary> {
        self.projects
            .get(project_name)
            .map(|displays| displays.iter().map(Display::summary).collect())
            .unwrap_or_default()
    }

    fn display(&self, project_name: &str, code: &str) -> Option<&Display> {
        self.projects
            .get(project_name)?
            .iter()
            .find(|d| d.code == code)
    }

    fn display_mut(&mut self, project_name: &str, code: &str) -> Option<&mut Display> {
        self.projects
            .get_mut(project_name)?
            .iter_mut()
            .find(|d| d.code == code)
    }

    /// Project a bare code resolves to, first registrant winning.
    fn project_for_code(&self, code: &str) -> Option<String> {
        self.code_index.get(code)?.first().cloned()
    }

    fn unindex_code(&mut self, code: &str, project_name: &str) {
        if let Some(projects) = self.code_index.get_mut(code) {
            if let Some(pos) = projects.iter().position(|p| p == project_name) {
                projects.remove(pos);
            }
            if projects.is_empty() {
                self.code_index.remove(code);
            }
        }
    }
}

#[derive(Debug)]
pub struct Registered {
    pub code: String,
    pub project_name: String,
    pub displays: Vec<DisplaySummary>,
}

#[derive(Debug)]
pub struct PairOutcome {
    pub code: String,
    pub project_name: String,
    pub display_name: String,
    pub displays: Vec<DisplaySummary>,
    pub current_state: Option<Value>,
}

#[derive(Debug)]
pub struct SwitchOutcome {
    pub code: String,
    pub display_name: String,
    pub displays: Vec<DisplaySummary>,
}

/// The process-wide directory of projects, displays and active pairings.
///
/// One mutex is the whole synchronization story: every operation locks,
/// mutates, pushes its multiplexer effects (non-blocking sends) and
/// returns, so no operation ever observes another's partial effect and the
/// lock is never held across a suspension point.
pub struct Registry {
    inner: Mutex<RegistryInner>,
    hub: TopicHub,
}

impl Registry {
    pub fn new(hub: TopicHub) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            hub,
        }
    }

    /// A display announces `code` under `project_name`. Creates the project
    /// on first use, subscribes the owner to its code and project topics and
    /// broadcasts the grown roster to the project.
    pub fn register_display(
        &self,
        conn: ConnectionId,
        project_name: &str,
        code: &str,
        display_name: Option<String>,
    ) -> Result<Registered, RegistryError> {
        let project_name = project_name.trim();
        if project_name.is_empty() {
            return Err(RegistryError::ProjectNameRequired);
        }

        let mut inner = self.inner.lock();
        match inner.roles.get(&conn) {
            Some(ConnectionRole::Remote) => {
                return Err(RegistryError::role_conflict(
                    "connection is already acting as a remote",
                ))
            }
            Some(ConnectionRole::Display { .. }) => {
                return Err(RegistryError::role_conflict(
                    "connection already owns a display",
                ))
            }
            None => {}
        }
        if inner.display(project_name, code).is_some() {
            return Err(RegistryError::DuplicateCodeInProject {
                code: code.to_string(),
                project_name: project_name.to_string(),
            });
        }

        let display_name = display_name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| format!("Display {code}"));
        let display = Display {
            code: code.to_string(),
            display_name,
            project_name: project_name.to_string(),
            owner: conn,
            paired_remote: None,
            last_state: None,
            last_second_level: None,
            registered_at: Utc::now(),
        };
        inner
            .projects
            .entry(project_name.to_string())
            .or_default()
            .push(display);
        inner
            .code_index
            .entry(code.to_string())
            .or_default()
            .push(project_name.to_string());
        inner.roles.insert(
            conn,
            ConnectionRole::Display {
                project_name: project_name.to_string(),
                code: code.to_string(),
            },
        );

        let displays = inner.roster(project_name);
        self.hub.subscribe(conn, &code_topic(code));
        self.hub.subscribe(conn, &project_topic(project_name));
        self.hub.broadcast(
            &project_topic(project_name),
            &ServerMessage::DisplayListUpdate {
                displays: displays.clone(),
            },
        );
        info!(%conn, project = project_name, code, "display registered");

        Ok(Registered {
            code: code.to_string(),
            project_name: project_name.to_string(),
            displays,
        })
    }

    /// Global lookup by bare code, the way a remote addresses a display.
    pub fn find_display_by_code(
        &self,
        code: &str,
    ) -> Result<(String, DisplaySummary), RegistryError> {
        let inner = self.inner.lock();
        let project_name = inner
            .project_for_code(code)
            .ok_or_else(|| RegistryError::CodeNotFound {
                code: code.to_string(),
            })?;
        let summary = inner
            .display(&project_name, code)
            .map(Display::summary)
            .ok_or_else(|| RegistryError::CodeNotFound {
                code: code.to_string(),
            })?;
        Ok((project_name, summary))
    }

    /// A remote takes the display holding `code`. A prior pairing held by
    /// this remote is released first (superseded, never an error); the
    /// vacated project hears about it. Returns the roster plus the
    /// display's cached state so the remote can render immediately.
    pub fn pair_remote(
        &self,
        conn: ConnectionId,
        code: &str,
    ) -> Result<PairOutcome, RegistryError> {
        let mut inner = self.inner.lock();
        if matches!(inner.roles.get(&conn), Some(ConnectionRole::Display { .. })) {
            return Err(RegistryError::role_conflict(
                "connection is already registered as a display",
            ));
        }

        let project_name =
            inner
                .project_for_code(code)
                .ok_or_else(|| RegistryError::CodeNotFound {
                    code: code.to_string(),
                })?;
        let (display_name, current_state) = {
            let display = inner
                .display(&project_name, code)
                .ok_or_else(|| RegistryError::CodeNotFound {
                    code: code.to_string(),
                })?;
            if display.paired_remote.is_some_and(|r| r != conn) {
                return Err(RegistryError::DisplayOccupied {
                    code: code.to_string(),
                });
            }
            (display.display_name.clone(), display.last_state.clone())
        };

        // Release the superseded pairing, if any.
        let mut vacated: Option<RemotePairing> = None;
        if let Some(prior) = inner.pairings.get(&conn).cloned() {
            if prior.code != code || prior.project_name != project_name {
                if let Some(old) = inner.display_mut(&prior.project_name, &prior.code) {
                    old.paired_remote = None;
                }
                vacated = Some(prior);
            }
        }

        if let Some(display) = inner.display_mut(&project_name, code) {
            display.paired_remote = Some(conn);
        }
        inner.pairings.insert(
            conn,
            RemotePairing {
                project_name: project_name.clone(),
                code: code.to_string(),
            },
        );
        inner.roles.insert(conn, ConnectionRole::Remote);

        if let Some(prior) = vacated {
            self.hub.unsubscribe(conn, &code_topic(&prior.code));
            if prior.project_name != project_name {
                self.hub
                    .unsubscribe(conn, &project_topic(&prior.project_name));
            }
            self.hub.broadcast(
                &project_topic(&prior.project_name),
                &ServerMessage::DisplayListUpdate {
                    displays: inner.roster(&prior.project_name),
                },
            );
        }

        let displays = inner.roster(&project_name);
        self.hub.subscribe(conn, &code_topic(code));
        self.hub.subscribe(conn, &project_topic(&project_name));
        self.hub.broadcast(
            &code_topic(code),
            &ServerMessage::Paired {
                code: code.to_string(),
            },
        );
        self.hub.broadcast(
            &project_topic(&project_name),
            &ServerMessage::DisplayListUpdate {
                displays: displays.clone(),
            },
        );
        info!(%conn, project = %project_name, code, "remote paired");

        Ok(PairOutcome {
            code: code.to_string(),
            project_name,
            display_name,
            displays,
            current_state,
        })
    }

    /// A paired remote moves to another display within its project. All
    /// effects are one atomic step: release the old display, take the new
    /// one, move the topic subscriptions, broadcast the roster and replay
    /// the new display's cached state.
    pub fn switch_display(
        &self,
        conn: ConnectionId,
        new_code: &str,
        claimed_project: Option<&str>,
    ) -> Result<SwitchOutcome, RegistryError> {
        let mut inner = self.inner.lock();
        let pairing = inner
            .pairings
            .get(&conn)
            .cloned()
            .ok_or(RegistryError::NotPaired)?;
        if claimed_project.is_some_and(|p| p != pairing.project_name) {
            return Err(RegistryError::CrossProjectSwitch {
                code: new_code.to_string(),
            });
        }

        let (display_name, replay_state) = match inner.display(&pairing.project_name, new_code) {
            Some(display) => {
                if display.paired_remote.is_some_and(|r| r != conn) {
                    return Err(RegistryError::DisplayOccupied {
                        code: new_code.to_string(),
                    });
                }
                (display.display_name.clone(), display.last_state.clone())
            }
            None => {
                // Invalid target: a code living in another project is
                // distinguished from a code living nowhere.
                return if inner.code_index.contains_key(new_code) {
                    Err(RegistryError::CrossProjectSwitch {
                        code: new_code.to_string(),
                    })
                } else {
                    Err(RegistryError::CodeNotFound {
                        code: new_code.to_string(),
                    })
                };
            }
        };

        if let Some(old) = inner.display_mut(&pairing.project_name, &pairing.code) {
            old.paired_remote = None;
        }
        if let Some(display) = inner.display_mut(&pairing.project_name, new_code) {
            display.paired_remote = Some(conn);
        }
        inner.pairings.insert(
            conn,
            RemotePairing {
                project_name: pairing.project_name.clone(),
                code: new_code.to_string(),
            },
        );

        if pairing.code != new_code {
            self.hub.unsubscribe(conn, &code_topic(&pairing.code));
        }
        self.hub.subscribe(conn, &code_topic(new_code));
        let displays = inner.roster(&pairing.project_name);
        self.hub.broadcast(
            &project_topic(&pairing.project_name),
            &ServerMessage::DisplayListUpdate {
                displays: displays.clone(),
            },
        );
        if let Some(state) = replay_state {
            self.hub.unicast(
                conn,
                ServerMessage::DisplayState {
                    state,
                    current_display: display_name.clone(),
                    current_display_code: new_code.to_string(),
                    project_name: pairing.project_name.clone(),
                },
            );
        }
        info!(
            %conn,
            project = %pairing.project_name,
            from = %pairing.code,
            to = new_code,
            "remote switched display"
        );

        Ok(SwitchOutcome {
            code: new_code.to_string(),
            display_name,
            displays,
        })
    }

    /// Stateless fan-out of a command to whoever listens on the code's
    /// topic. Touches no registry state and validates no sender identity:
    /// holding a code is the whole capability.
    pub fn relay_command(&self, code: &str, command: String, payload: Option<Value>) {
        let topic = code_topic(code);
        if self.hub.subscriber_count(&topic) == 0 {
            debug!(code, %command, "command relayed to empty topic");
        }
        self.hub
            .broadcast(&topic, &ServerMessage::RemoteCommand { command, payload });
    }

    /// A display pushes fresh application state: cache it and hand it to
    /// the paired remote only. State is addressed, never project-public.
    pub fn update_display_state(
        &self,
        conn: ConnectionId,
        code: &str,
        project_name: &str,
        state: Value,
    ) {
        let mut inner = self.inner.lock();
        let Some(display) = inner.display_mut(project_name, code) else {
            debug!(%conn, project = project_name, code, "state push for unknown display dropped");
            return;
        };
        if display.owner != conn {
            let owner = display.owner;
            debug!(%conn, %owner, code, "state push from non-owner connection");
        }
        display.last_state = Some(state.clone());
        let target = display.paired_remote;
        let display_name = display.display_name.clone();
        if let Some(remote) = target {
            self.hub.unicast(
                remote,
                ServerMessage::DisplayState {
                    state,
                    current_display: display_name,
                    current_display_code: code.to_string(),
                    project_name: project_name.to_string(),
                },
            );
        }
    }

    /// A display pushes its drill-down selection about itself; the caller
    /// is resolved through the role reverse index, no code supplied.
    pub fn update_second_level(&self, conn: ConnectionId, selected_units: Vec<Value>) {
        let mut inner = self.inner.lock();
        let Some(ConnectionRole::Display { project_name, code }) = inner.roles.get(&conn).cloned()
        else {
            warn!(%conn, "second-level update from a non-display connection dropped");
            return;
        };
        let Some(display) = inner.display_mut(&project_name, &code) else {
            return;
        };
        display.last_second_level = Some(Value::Array(selected_units.clone()));
        let target = display.paired_remote;
        let display_name = display.display_name.clone();
        if let Some(remote) = target {
            self.hub.unicast(
                remote,
                ServerMessage::SecondLevelUpdate {
                    selected_units,
                    current_display: display_name,
                    current_display_code: code,
                    project_name,
                },
            );
        }
    }

    /// Disconnect reconciler. Runs for every connection teardown; both
    /// scans always execute since at most one can match a single role.
    pub fn release_connection(&self, conn: ConnectionId) {
        let mut inner = self.inner.lock();

        // Display-ownership scan: the dropped connection's display dies
        // with it, cached state included.
        if let Some(ConnectionRole::Display { project_name, code }) = inner.roles.get(&conn).cloned()
        {
            let removed = inner.projects.get_mut(&project_name).and_then(|displays| {
                displays
                    .iter()
                    .position(|d| d.code == code)
                    .map(|pos| displays.remove(pos))
            });
            if let Some(display) = removed {
                inner.unindex_code(&code, &project_name);
                if let Some(remote) = display.paired_remote {
                    // The remote's session is orphaned: tell it, drop the
                    // pairing and free it to pair again. Its project
                    // subscription stays so roster updates keep flowing.
                    inner.pairings.remove(&remote);
                    self.hub.unsubscribe(remote, &code_topic(&code));
                    self.hub.unicast(
                        remote,
                        ServerMessage::DisplayGone { code: code.clone() },
                    );
                }
                let emptied = inner
                    .projects
                    .get(&project_name)
                    .map_or(true, |displays| displays.is_empty());
                if emptied {
                    inner.projects.remove(&project_name);
                    info!(project = %project_name, "last display left, project removed");
                } else {
                    self.hub.broadcast(
                        &project_topic(&project_name),
                        &ServerMessage::DisplayListUpdate {
                            displays: inner.roster(&project_name),
                        },
                    );
                }
                info!(%conn, project = %project_name, %code, "display connection released");
            }
        }

        // Remote-pairing scan: free the display this remote held.
        if let Some(pairing) = inner.pairings.remove(&conn) {
            if let Some(display) = inner.display_mut(&pairing.project_name, &pairing.code) {
                display.paired_remote = None;
            }
            self.hub.broadcast(
                &project_topic(&pairing.project_name),
                &ServerMessage::DisplayListUpdate {
                    displays: inner.roster(&pairing.project_name),
                },
            );
            info!(%conn, project = %pairing.project_name, code = %pairing.code, "remote connection released");
        }

        inner.roles.remove(&conn);
        self.hub.detach(conn);
    }

    /// Snapshot of every project's roster, sorted by project name for a
    /// stable HTTP response.
    pub fn snapshot(&self) -> Vec<(String, Vec<DisplaySummary>)> {
        let inner = self.inner.lock();
        let mut projects: Vec<(String, Vec<DisplaySummary>)> = inner
            .projects
            .keys()
            .map(|name| (name.clone(), inner.roster(name)))
            .collect();
        projects.sort_by(|a, b| a.0.cmp(&b.0));
        projects
    }

    pub fn project_roster(&self, project_name: &str) -> Option<Vec<DisplaySummary>> {
        let inner = self.inner.lock();
        inner
            .projects
            .contains_key(project_name)
            .then(|| inner.roster(project_name))
    }

    /// Full display records of one project, for the status endpoint.
    pub fn project_displays(&self, project_name: &str) -> Option<Vec<Display>> {
        let inner = self.inner.lock();
        inner.projects.get(project_name).cloned()
    }

    /// (projects, displays) totals for the health endpoint.
    pub fn counts(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        let displays = inner.projects.values().map(Vec::len).sum();
        (inner.projects.len(), displays)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::generate_connection_id;
    use serde_json::json;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    fn setup() -> (Registry, TopicHub) {
        let hub = TopicHub::new();
        (Registry::new(hub.clone()), hub)
    }

    fn connect(hub: &TopicHub) -> (ConnectionId, UnboundedReceiver<ServerMessage>) {
        let conn = generate_connection_id();
        let (tx, rx) = unbounded_channel();
        hub.attach(conn, tx);
        (conn, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn last_roster(messages: &[ServerMessage]) -> Option<&Vec<DisplaySummary>> {
        messages.iter().rev().find_map(|msg| match msg {
            ServerMessage::DisplayListUpdate { displays } => Some(displays),
            _ => None,
        })
    }

    #[timebox::timeout]
    fn duplicate_code_in_project_is_rejected() {
        let (registry, hub) = setup();
        let (d1, _rx1) = connect(&hub);
        let (d2, _rx2) = connect(&hub);

        registry.register_display(d1, "P", "1111", None).unwrap();
        let err = registry
            .register_display(d2, "P", "1111", None)
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::DuplicateCodeInProject {
                code: "1111".into(),
                project_name: "P".into(),
            }
        );

        // The same code is fine under another project.
        registry.register_display(d2, "Q", "1111", None).unwrap();
    }

    #[timebox::timeout]
    fn project_name_is_required() {
        let (registry, hub) = setup();
        let (d, _rx) = connect(&hub);
        let err = registry.register_display(d, "   ", "1111", None).unwrap_err();
        assert_eq!(err, RegistryError::ProjectNameRequired);
    }

    #[timebox::timeout]
    fn display_name_defaults_from_code() {
        let (registry, hub) = setup();
        let (d, _rx) = connect(&hub);
        let reg = registry.register_display(d, "P", "4242", None).unwrap();
        assert_eq!(reg.displays[0].display_name, "Display 4242");

        let (d2, _rx2) = connect(&hub);
        let reg = registry
            .register_display(d2, "P", "4243", Some("Lobby".into()))
            .unwrap();
        assert_eq!(reg.displays[1].display_name, "Lobby");
    }

    #[timebox::timeout]
    fn roster_keeps_registration_order() {
        let (registry, hub) = setup();
        for code in ["3333", "1111", "2222"] {
            let (d, _rx) = connect(&hub);
            registry.register_display(d, "P", code, None).unwrap();
        }
        let roster = registry.project_roster("P").unwrap();
        let codes: Vec<&str> = roster.iter().map(|d| d.code.as_str()).collect();
        assert_eq!(codes, ["3333", "1111", "2222"]);
    }

    #[timebox::timeout]
    fn pairing_marks_occupied_and_relays_commands() {
        let (registry, hub) = setup();
        let (d, mut rx_d) = connect(&hub);
        let (r, _rx_r) = connect(&hub);

        registry.register_display(d, "P", "1111", None).unwrap();
        let outcome = registry.pair_remote(r, "1111").unwrap();
        assert_eq!(outcome.project_name, "P");
        assert!(outcome.displays[0].is_occupied);

        let (_, summary) = registry.find_display_by_code("1111").unwrap();
        assert!(summary.is_occupied);

        drain(&mut rx_d);
        registry.relay_command("1111", "request_homes".into(), None);
        let received = drain(&mut rx_d);
        assert!(received.iter().any(|msg| matches!(
            msg,
            ServerMessage::RemoteCommand { command, .. } if command == "request_homes"
        )));
    }

    #[timebox::timeout]
    fn occupied_display_rejects_second_remote() {
        let (registry, hub) = setup();
        let (d, _rx_d) = connect(&hub);
        let (r1, _rx_r1) = connect(&hub);
        let (r2, _rx_r2) = connect(&hub);

        registry.register_display(d, "P", "1111", None).unwrap();
        registry.pair_remote(r1, "1111").unwrap();

        let err = registry.pair_remote(r2, "1111").unwrap_err();
        assert_eq!(
            err,
            RegistryError::DisplayOccupied {
                code: "1111".into()
            }
        );
        // Registry unchanged: r1 still holds the display.
        let (_, summary) = registry.find_display_by_code("1111").unwrap();
        assert!(summary.is_occupied);
    }

    #[timebox::timeout]
    fn pair_unknown_code_fails() {
        let (registry, hub) = setup();
        let (r, _rx) = connect(&hub);
        assert_eq!(
            registry.pair_remote(r, "9999").unwrap_err(),
            RegistryError::CodeNotFound {
                code: "9999".into()
            }
        );
    }

    #[timebox::timeout]
    fn repairing_supersedes_prior_pairing() {
        let (registry, hub) = setup();
        let (d1, mut rx_d1) = connect(&hub);
        let (d2, _rx_d2) = connect(&hub);
        let (r, _rx_r) = connect(&hub);

        registry.register_display(d1, "P", "1111", None).unwrap();
        registry.register_display(d2, "Q", "2222", None).unwrap();

        registry.pair_remote(r, "1111").unwrap();
        drain(&mut rx_d1);
        registry.pair_remote(r, "2222").unwrap();

        let (_, old) = registry.find_display_by_code("1111").unwrap();
        assert!(!old.is_occupied);
        let (_, new) = registry.find_display_by_code("2222").unwrap();
        assert!(new.is_occupied);

        // The vacated project heard about the release.
        let msgs = drain(&mut rx_d1);
        let roster = last_roster(&msgs).expect("vacated project roster broadcast");
        assert!(!roster[0].is_occupied);
    }

    #[timebox::timeout]
    fn pair_returns_cached_state_for_immediate_render() {
        let (registry, hub) = setup();
        let (d, _rx_d) = connect(&hub);
        let (r, _rx_r) = connect(&hub);

        registry.register_display(d, "P", "1111", None).unwrap();
        let state = json!({"firstLevelFilter": {"selectedBuildings": [7]}});
        registry.update_display_state(d, "1111", "P", state.clone());

        let outcome = registry.pair_remote(r, "1111").unwrap();
        assert_eq!(outcome.current_state, Some(state));
    }

    #[timebox::timeout]
    fn display_state_is_unicast_to_paired_remote_only() {
        let (registry, hub) = setup();
        let (d, _rx_d) = connect(&hub);
        let (r, mut rx_r) = connect(&hub);
        let (bystander, mut rx_b) = connect(&hub);

        registry.register_display(d, "P", "1111", None).unwrap();
        registry.register_display(bystander, "P", "2222", None).unwrap();
        registry.pair_remote(r, "1111").unwrap();
        drain(&mut rx_r);
        drain(&mut rx_b);

        registry.update_display_state(d, "1111", "P", json!({"page": 2}));

        let received = drain(&mut rx_r);
        let push = received
            .iter()
            .find_map(|msg| match msg {
                ServerMessage::DisplayState {
                    current_display_code,
                    project_name,
                    ..
                } => Some((current_display_code.clone(), project_name.clone())),
                _ => None,
            })
            .expect("remote should receive the state push");
        assert_eq!(push, ("1111".to_string(), "P".to_string()));

        // The other display in the project saw nothing: state is addressed.
        assert!(!drain(&mut rx_b)
            .iter()
            .any(|msg| matches!(msg, ServerMessage::DisplayState { .. })));
    }

    #[timebox::timeout]
    fn second_level_resolves_caller_through_reverse_index() {
        let (registry, hub) = setup();
        let (d, _rx_d) = connect(&hub);
        let (r, mut rx_r) = connect(&hub);

        registry.register_display(d, "P", "1111", None).unwrap();
        registry.pair_remote(r, "1111").unwrap();
        drain(&mut rx_r);

        registry.update_second_level(d, vec![json!({"unit_id": 12})]);
        let received = drain(&mut rx_r);
        assert!(received.iter().any(|msg| matches!(
            msg,
            ServerMessage::SecondLevelUpdate { selected_units, current_display_code, .. }
                if selected_units.len() == 1 && current_display_code == "1111"
        )));

        // A non-display caller is dropped without effect.
        registry.update_second_level(r, vec![json!(1)]);
        assert!(drain(&mut rx_r).is_empty());
    }

    #[timebox::timeout]
    fn switch_moves_pairing_within_project() {
        let (registry, hub) = setup();
        let (d1, _rx_d1) = connect(&hub);
        let (d2, _rx_d2) = connect(&hub);
        let (r, mut rx_r) = connect(&hub);

        registry.register_display(d1, "P", "1111", None).unwrap();
        registry
            .register_display(d2, "P", "2222", Some("Terrace".into()))
            .unwrap();
        registry.update_display_state(d2, "2222", "P", json!({"page": 9}));

        registry.pair_remote(r, "1111").unwrap();
        drain(&mut rx_r);

        let outcome = registry.switch_display(r, "2222", Some("P")).unwrap();
        assert_eq!(outcome.display_name, "Terrace");

        let (_, old) = registry.find_display_by_code("1111").unwrap();
        assert!(!old.is_occupied);
        let (_, new) = registry.find_display_by_code("2222").unwrap();
        assert!(new.is_occupied);

        // The cached state of the new display was replayed immediately.
        let received = drain(&mut rx_r);
        assert!(received.iter().any(|msg| matches!(
            msg,
            ServerMessage::DisplayState { current_display_code, .. }
                if current_display_code == "2222"
        )));
    }

    #[timebox::timeout]
    fn switch_rejects_cross_project_target() {
        let (registry, hub) = setup();
        let (d1, _rx_d1) = connect(&hub);
        let (d2, _rx_d2) = connect(&hub);
        let (r, _rx_r) = connect(&hub);

        registry.register_display(d1, "P", "1111", None).unwrap();
        registry.register_display(d2, "Q", "2222", None).unwrap();
        registry.pair_remote(r, "1111").unwrap();

        let err = registry.switch_display(r, "2222", None).unwrap_err();
        assert_eq!(
            err,
            RegistryError::CrossProjectSwitch {
                code: "2222".into()
            }
        );
        // The existing pairing is untouched.
        let (_, summary) = registry.find_display_by_code("1111").unwrap();
        assert!(summary.is_occupied);
    }

    #[timebox::timeout]
    fn switch_validates_target_and_pairing_state() {
        let (registry, hub) = setup();
        let (d1, _rx_d1) = connect(&hub);
        let (d2, _rx_d2) = connect(&hub);
        let (r1, _rx_r1) = connect(&hub);
        let (r2, _rx_r2) = connect(&hub);

        assert_eq!(
            registry.switch_display(r1, "1111", None).unwrap_err(),
            RegistryError::NotPaired
        );

        registry.register_display(d1, "P", "1111", None).unwrap();
        registry.register_display(d2, "P", "2222", None).unwrap();
        registry.pair_remote(r1, "1111").unwrap();
        registry.pair_remote(r2, "2222").unwrap();

        assert_eq!(
            registry.switch_display(r1, "9999", None).unwrap_err(),
            RegistryError::CodeNotFound {
                code: "9999".into()
            }
        );
        assert_eq!(
            registry.switch_display(r1, "2222", None).unwrap_err(),
            RegistryError::DisplayOccupied {
                code: "2222".into()
            }
        );
        // A stale projectName claim is an invalid target too.
        assert_eq!(
            registry.switch_display(r1, "1111", Some("Q")).unwrap_err(),
            RegistryError::CrossProjectSwitch {
                code: "1111".into()
            }
        );
    }

    #[timebox::timeout]
    fn display_disconnect_prunes_roster_and_orphans_remote() {
        let (registry, hub) = setup();
        let (d1, _rx_d1) = connect(&hub);
        let (d2, mut rx_d2) = connect(&hub);
        let (r, mut rx_r) = connect(&hub);

        registry.register_display(d1, "P", "1111", None).unwrap();
        registry.register_display(d2, "P", "2222", None).unwrap();
        registry.pair_remote(r, "1111").unwrap();
        drain(&mut rx_d2);
        drain(&mut rx_r);

        registry.release_connection(d1);

        // Remaining project members saw the shrunken roster.
        let msgs = drain(&mut rx_d2);
        let roster = last_roster(&msgs).expect("roster broadcast after display loss");
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].code, "2222");

        // The paired remote was told its display is gone and is unpaired.
        let remote_msgs = drain(&mut rx_r);
        assert!(remote_msgs
            .iter()
            .any(|msg| matches!(msg, ServerMessage::DisplayGone { code } if code == "1111")));
        assert_eq!(
            registry.switch_display(r, "2222", None).unwrap_err(),
            RegistryError::NotPaired
        );
        // ...and free to pair again right away.
        registry.pair_remote(r, "2222").unwrap();
    }

    #[timebox::timeout]
    fn last_display_removes_project_entirely() {
        let (registry, hub) = setup();
        let (d, _rx_d) = connect(&hub);
        registry.register_display(d, "P", "1111", None).unwrap();

        registry.release_connection(d);

        assert!(registry.project_roster("P").is_none());
        assert_eq!(
            registry.find_display_by_code("1111").unwrap_err(),
            RegistryError::CodeNotFound {
                code: "1111".into()
            }
        );

        // The freed code can be registered again as brand-new.
        let (d2, _rx_d2) = connect(&hub);
        registry.register_display(d2, "P", "1111", None).unwrap();
    }

    #[timebox::timeout]
    fn remote_disconnect_frees_display_for_next_pair() {
        let (registry, hub) = setup();
        let (d, mut rx_d) = connect(&hub);
        let (r1, _rx_r1) = connect(&hub);

        registry.register_display(d, "P", "1111", None).unwrap();
        registry.pair_remote(r1, "1111").unwrap();
        drain(&mut rx_d);

        registry.release_connection(r1);

        let msgs = drain(&mut rx_d);
        let roster = last_roster(&msgs).expect("roster broadcast after remote loss");
        assert!(!roster[0].is_occupied);

        let (r2, _rx_r2) = connect(&hub);
        registry.pair_remote(r2, "1111").unwrap();
    }

    #[timebox::timeout]
    fn dual_roles_are_rejected() {
        let (registry, hub) = setup();
        let (d, _rx_d) = connect(&hub);
        let (r, _rx_r) = connect(&hub);

        registry.register_display(d, "P", "1111", None).unwrap();
        registry.pair_remote(r, "1111").unwrap();

        assert!(matches!(
            registry.pair_remote(d, "1111").unwrap_err(),
            RegistryError::RoleConflict { .. }
        ));
        assert!(matches!(
            registry.register_display(r, "P", "2222", None).unwrap_err(),
            RegistryError::RoleConflict { .. }
        ));
        // One display per connection: the reverse index is single-valued.
        assert!(matches!(
            registry.register_display(d, "P", "3333", None).unwrap_err(),
            RegistryError::RoleConflict { .. }
        ));
    }

    #[timebox::timeout]
    fn code_index_survives_cross_project_collisions() {
        let (registry, hub) = setup();
        let (d1, _rx_d1) = connect(&hub);
        let (d2, _rx_d2) = connect(&hub);

        registry.register_display(d1, "P", "1111", None).unwrap();
        registry.register_display(d2, "Q", "1111", None).unwrap();

        // First registrant wins the bare-code lookup.
        let (project, _) = registry.find_display_by_code("1111").unwrap();
        assert_eq!(project, "P");

        // Once P's display is gone, the lookup falls through to Q's.
        registry.release_connection(d1);
        let (project, _) = registry.find_display_by_code("1111").unwrap();
        assert_eq!(project, "Q");
    }

    #[timebox::timeout]
    fn relay_to_unknown_code_is_a_noop() {
        let (registry, _hub) = setup();
        registry.relay_command("0000", "anything".into(), Some(json!({"k": 1})));
    }

    #[timebox::timeout]
    fn counts_track_projects_and_displays() {
        let (registry, hub) = setup();
        assert_eq!(registry.counts(), (0, 0));
        let (d1, _rx1) = connect(&hub);
        let (d2, _rx2) = connect(&hub);
        registry.register_display(d1, "P", "1111", None).unwrap();
        registry.register_display(d2, "Q", "2222", None).unwrap();
        assert_eq!(registry.counts(), (2, 2));
        registry.release_connection(d2);
        assert_eq!(registry.counts(), (1, 1));
    }
}
