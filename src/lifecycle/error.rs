//! Error types for the session lifecycle.

use thiserror::Error;

use crate::batch::ProvisioningError;
use crate::command::CommandError;
use crate::control::ControlPlaneError;
use crate::domain::DomainError;
use crate::environment::EnvironmentError;
use crate::port::PortTimeoutError;

/// Errors that end a session early.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Raised when the environment cannot be prepared on disk.
    #[error("environment setup failed: {0}")]
    Environment(#[from] EnvironmentError),
    /// Raised when batch instances cannot be provisioned.
    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),
    /// Raised when a virtual domain cannot be acquired.
    #[error("failed to acquire domain: {0}")]
    Domain(#[from] DomainError),
    /// Raised when a machine never accepts SSH connections.
    #[error(transparent)]
    Unreachable(#[from] PortTimeoutError),
    /// Raised when the control-plane bootstrap fails.
    #[error("bootstrap failed: {0}")]
    Bootstrap(#[source] ControlPlaneError),
    /// Raised when machine 0's address cannot be determined.
    #[error("could not get machine 0 host: {message}")]
    HostResolution {
        /// Why resolution failed.
        message: String,
    },
    /// Raised when agent reconciliation or machine enlistment fails.
    #[error("environment preparation failed: {0}")]
    Prepare(#[source] ControlPlaneError),
    /// Raised when the upgrade run after the workload fails.
    #[error("upgrade failed: {0}")]
    Upgrade(#[source] ControlPlaneError),
    /// Raised when the workload fails.
    #[error(transparent)]
    Workload(#[from] WorkloadError),
}

impl LifecycleError {
    /// Short name of the failure class, shown next to the message.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Environment(_) => "EnvironmentError",
            Self::Provisioning(_) => "ProvisioningError",
            Self::Domain(_) => "DomainError",
            Self::Unreachable(_) => "PortTimeoutError",
            Self::Bootstrap(_) => "BootstrapFailure",
            Self::HostResolution { .. } => "HostResolutionError",
            Self::Prepare(_) | Self::Upgrade(_) | Self::Workload(_) => "WorkloadFailure",
        }
    }
}

/// Errors reported by a [`Workload`](super::Workload).
#[derive(Debug, Error)]
pub enum WorkloadError {
    /// Raised when a workload command cannot run or exits non-zero.
    #[error("workload command failed: {0}")]
    Command(#[from] CommandError),
    /// Raised when a control-plane call made by the workload fails.
    #[error("workload control-plane call failed: {0}")]
    Control(#[from] ControlPlaneError),
    /// Raised for any other workload failure.
    #[error("workload failed: {message}")]
    Failed {
        /// Description of the failure.
        message: String,
    },
}
