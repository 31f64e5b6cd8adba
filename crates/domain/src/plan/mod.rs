//! Reconciliation steps: the atomic actions a plan is made of.

use serde::{Deserialize, Serialize};

use crate::state::Service;

/// A single reconciliation action. Plans execute all `CreateNetwork`
/// steps first, then container mutations, then all `RemoveNetwork` steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum Step {
    CreateNetwork {
        app_id: i64,
        name: String,
    },
    RemoveNetwork {
        app_id: i64,
        name: String,
    },
    Fetch {
        image: String,
    },
    StartContainer {
        app_id: i64,
        app_name: String,
        service: Service,
    },
    StopContainer {
        container_id: String,
    },
    RemoveContainer {
        container_id: String,
    },
    RestartContainer {
        container_id: String,
    },
}

impl Step {
    /// Short action name for logs and reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreateNetwork { .. } => "createNetwork",
            Self::RemoveNetwork { .. } => "removeNetwork",
            Self::Fetch { .. } => "fetch",
            Self::StartContainer { .. } => "startContainer",
            Self::StopContainer { .. } => "stopContainer",
            Self::RemoveContainer { .. } => "removeContainer",
            Self::RestartContainer { .. } => "restartContainer",
        }
    }

    /// The `(appId, serviceId)` this step acts for, when it targets a
    /// specific service.
    pub fn service_key(&self) -> Option<(i64, i64)> {
        match self {
            Self::StartContainer {
                app_id, service, ..
            } => Some((*app_id, service.service_id)),
            _ => None,
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CreateNetwork { app_id, name } => write!(f, "createNetwork {app_id}_{name}"),
            Self::RemoveNetwork { app_id, name } => write!(f, "removeNetwork {app_id}_{name}"),
            Self::Fetch { image } => write!(f, "fetch {image}"),
            Self::StartContainer {
                app_id, service, ..
            } => write!(f, "startContainer {}/{}", app_id, service.service_name),
            Self::StopContainer { container_id } => write!(f, "stopContainer {container_id}"),
            Self::RemoveContainer { container_id } => write!(f, "removeContainer {container_id}"),
            Self::RestartContainer { container_id } => {
                write!(f, "restartContainer {container_id}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_kind_and_display() {
        let step = Step::Fetch {
            image: "nginx@sha256:aaa".into(),
        };
        assert_eq!(step.kind(), "fetch");
        assert_eq!(step.to_string(), "fetch nginx@sha256:aaa");
    }

    #[test]
    fn test_step_serializes_tagged() {
        let step = Step::StopContainer {
            container_id: "c1".into(),
        };
        let value = serde_json::to_value(&step).unwrap();
        assert_eq!(value["action"], "StopContainer");
        assert_eq!(value["container_id"], "c1");
    }
}
