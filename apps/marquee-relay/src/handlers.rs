use axum::{
    extract::{Path, State},
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::protocol::DisplaySummary;
use crate::registry::Display;
use crate::websocket::AppState;

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    status: &'static str,
    projects: usize,
    displays: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRoster {
    pub project_name: String,
    pub displays: Vec<DisplaySummary>,
}

#[derive(Debug, Serialize)]
pub struct ProjectStatusResponse {
    pub exists: bool,
    pub displays: Vec<DisplayDetail>,
}

/// One display as the status endpoint reports it: the roster entry plus
/// when it registered and whether it holds cached state to replay.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayDetail {
    pub code: String,
    pub display_name: String,
    pub is_occupied: bool,
    pub registered_at: DateTime<Utc>,
    pub has_cached_state: bool,
    pub has_second_level_state: bool,
}

impl From<Display> for DisplayDetail {
    fn from(display: Display) -> Self {
        Self {
            code: display.code,
            display_name: display.display_name,
            is_occupied: display.paired_remote.is_some(),
            registered_at: display.registered_at,
            has_cached_state: display.last_state.is_some(),
            has_second_level_state: display.last_second_level.is_some(),
        }
    }
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthStatus> {
    let (projects, displays) = state.registry.counts();
    Json(HealthStatus {
        status: "ok",
        projects,
        displays,
    })
}

/// GET /projects - every project's roster, for ops visibility.
pub async fn list_projects(State(state): State<AppState>) -> Json<Vec<ProjectRoster>> {
    let projects = state
        .registry
        .snapshot()
        .into_iter()
        .map(|(project_name, displays)| ProjectRoster {
            project_name,
            displays,
        })
        .collect();
    Json(projects)
}

/// GET /projects/:name - does the project exist, and what does it hold.
pub async fn get_project_status(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Json<ProjectStatusResponse> {
    match state.registry.project_displays(&name) {
        Some(displays) => Json(ProjectStatusResponse {
            exists: true,
            displays: displays.into_iter().map(DisplayDetail::from).collect(),
        }),
        None => Json(ProjectStatusResponse {
            exists: false,
            displays: Vec::new(),
        }),
    }
}
