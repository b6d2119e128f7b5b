use thiserror::Error;

/// Validation failures surfaced to the initiating peer. None of these are
/// fatal to the process, and none leave partial registry state behind.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("project name is required")]
    ProjectNameRequired,

    #[error("code {code} is already registered in project {project_name}")]
    DuplicateCodeInProject { code: String, project_name: String },

    #[error("no display is registered under code {code}")]
    CodeNotFound { code: String },

    #[error("display {code} belongs to a different project")]
    CrossProjectSwitch { code: String },

    #[error("display {code} is already paired with another remote")]
    DisplayOccupied { code: String },

    #[error("connection is not paired with any display")]
    NotPaired,

    #[error("{reason}")]
    RoleConflict { reason: String },
}

impl RegistryError {
    pub fn role_conflict(reason: impl Into<String>) -> Self {
        Self::RoleConflict {
            reason: reason.into(),
        }
    }
}
