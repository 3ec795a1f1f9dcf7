//! Environment lifecycle events and the transitions they are allowed to make.
//!
//! Every status write goes through an [`EnvironmentEvent`]: the event names the
//! target state and the set of states it may leave from. The database update
//! is conditioned on that set, so a late or duplicated task cannot move a
//! record backwards.

use serde::{Deserialize, Serialize};

use crate::models::environment::EnvironmentStatus;
use EnvironmentStatus::*;

/// Things that can happen to a preview environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EnvironmentEvent {
    /// PR opened or reopened on a record that previously ended.
    Requeued,
    /// A worker picked up the provisioning task.
    ProvisioningStarted,
    /// Namespace and quota are in place.
    Provisioned,
    /// New commits arrived for a ready environment.
    UpdateRequested,
    /// Namespace verified for the new commits.
    Updated,
    /// PR closed or merged.
    DestroyRequested,
    /// Namespace deleted.
    Destroyed,
    /// Any step gave up.
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal transition {from} -> {to}")]
pub struct LifecycleError {
    pub from: EnvironmentStatus,
    pub to: EnvironmentStatus,
}

impl EnvironmentEvent {
    /// The state this event moves the environment into.
    pub fn target(&self) -> EnvironmentStatus {
        match self {
            EnvironmentEvent::Requeued => Pending,
            EnvironmentEvent::ProvisioningStarted => Provisioning,
            EnvironmentEvent::Provisioned => Ready,
            EnvironmentEvent::UpdateRequested => Updating,
            EnvironmentEvent::Updated => Ready,
            EnvironmentEvent::DestroyRequested => Destroying,
            EnvironmentEvent::Destroyed => Destroyed,
            EnvironmentEvent::Failed { .. } => Failed,
        }
    }

    /// States this event may be applied to.
    pub fn allowed_from(&self) -> &'static [EnvironmentStatus] {
        match self {
            EnvironmentEvent::Requeued => &[Failed, Destroyed],
            EnvironmentEvent::ProvisioningStarted => &[Pending],
            EnvironmentEvent::Provisioned => &[Provisioning],
            EnvironmentEvent::UpdateRequested => &[Ready],
            EnvironmentEvent::Updated => &[Updating],
            EnvironmentEvent::DestroyRequested => &[Pending, Provisioning, Ready, Updating, Failed],
            EnvironmentEvent::Destroyed => &[Destroying],
            // Ready is included so drift detection can flag a lost namespace.
            EnvironmentEvent::Failed { .. } => &[Pending, Provisioning, Ready, Updating, Destroying],
        }
    }

    pub fn permits(&self, current: EnvironmentStatus) -> bool {
        self.allowed_from().contains(&current)
    }

    /// Apply the event to a known status.
    pub fn apply(&self, current: EnvironmentStatus) -> Result<EnvironmentStatus, LifecycleError> {
        if self.permits(current) {
            Ok(self.target())
        } else {
            Err(LifecycleError {
                from: current,
                to: self.target(),
            })
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            EnvironmentEvent::Failed { reason } => Some(reason),
            _ => None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        EnvironmentEvent::Failed {
            reason: reason.into(),
        }
    }
}
