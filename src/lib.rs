//! Core library for the `stackrun` environment lifecycle orchestrator.
//!
//! The crate acquires machines for a throwaway juju environment (batch
//! instances or pre-existing virtual domains), bootstraps it, runs a
//! caller-supplied workload, and tears everything down again, capturing
//! logs from every machine when something fails.

pub mod batch;
pub mod command;
pub mod config;
pub mod control;
pub mod diagnostics;
pub mod domain;
pub mod environment;
pub mod lifecycle;
pub mod outcome;
pub mod poll;
pub mod port;
pub mod remote;
pub mod test_support;

pub use batch::{
    BatchApiError, BatchProvisioner, EucaClient, InstanceApi, InstanceFilter, InstanceRecord,
    InstanceSpec, ProvisioningError,
};
pub use command::{CommandEnv, CommandError, CommandOutput, CommandRunner, ProcessCommandRunner};
pub use config::{BatchConfig, ConfigError, HarnessConfig, RemoteConfig};
pub use control::{ControlPlane, ControlPlaneError, JujuCli, Status};
pub use diagnostics::{DiagnosticsCollector, DiagnosticsError, DiagnosticsReport};
pub use domain::{DomainApi, DomainError, DomainManager, DomainRef, VirshClient};
pub use environment::{Environment, EnvironmentError, ProviderKind, WorkHome};
pub use lifecycle::{
    Lifecycle, LifecycleError, LifecyclePhase, LifecycleTimings, SessionOutcome, SessionRequest,
    Workload, WorkloadError, WorkloadFuture,
};
pub use outcome::BestEffort;
pub use poll::Deadline;
pub use port::{PortState, PortTimeoutError, PortWaiter};
pub use remote::RemoteAccess;
