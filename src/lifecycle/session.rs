//! Session inputs, state and outcome.

use std::fmt;

use camino::Utf8PathBuf;
use uuid::Uuid;

use crate::batch::InstanceRecord;
use crate::diagnostics::DiagnosticsReport;
use crate::domain::AcquiredDomain;
use crate::environment::{Environment, EnvironmentOverrides};

use super::LifecycleError;
use super::teardown::TeardownReport;

/// Parameters of one session.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SessionRequest {
    /// Job name; becomes the environment name and the instance tag.
    pub job_name: String,
    /// Additional machines, or `name@locator` domains for virtualized
    /// environments.
    pub machines: Vec<String>,
    /// Externally supplied bootstrap host.
    pub bootstrap_host: Option<String>,
    /// Default series for the environment.
    pub series: Option<String>,
    /// Source of agent binaries.
    pub agent_url: Option<String>,
    /// Directory receiving diagnostics.
    pub log_dir: Utf8PathBuf,
    /// Leave the environment and its resources running at the end.
    pub keep_environment: bool,
    /// Upload locally built agent binaries during bootstrap.
    pub upload_tools: bool,
    /// Upgrade the environment to the client's version after the workload.
    pub upgrade: bool,
}

impl SessionRequest {
    /// Creates a request for `job_name` collecting diagnostics in `log_dir`.
    #[must_use]
    pub fn new(job_name: impl Into<String>, log_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            job_name: job_name.into(),
            log_dir: log_dir.into(),
            ..Self::default()
        }
    }

    pub(crate) fn overrides(&self, bootstrap_host: Option<&str>) -> EnvironmentOverrides {
        EnvironmentOverrides {
            name: self.job_name.clone(),
            series: self.series.clone(),
            bootstrap_host: bootstrap_host.map(str::to_owned),
            agent_url: self.agent_url.clone(),
        }
    }
}

/// Lifecycle states, in the order a successful session visits them.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LifecyclePhase {
    /// Nothing has happened yet.
    Start,
    /// Acquiring instances or domains.
    Provisioning,
    /// Writing session values into the environment.
    ConfiguringEnvironment,
    /// Waiting for SSH on every machine.
    WaitingForReachability,
    /// Bootstrapping the control plane.
    Bootstrapping,
    /// Preparing the environment and running the workload.
    Running,
    /// Releasing everything that was acquired.
    TearingDown,
    /// Finished successfully.
    Done,
    /// Failed after diagnostics were captured.
    AbortedWithDiagnostics,
    /// Failed without diagnostics.
    Failed,
}

impl LifecyclePhase {
    /// Lowercase name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Provisioning => "provisioning",
            Self::ConfiguringEnvironment => "configuring-environment",
            Self::WaitingForReachability => "waiting-for-reachability",
            Self::Bootstrapping => "bootstrapping",
            Self::Running => "running",
            Self::TearingDown => "tearing-down",
            Self::Done => "done",
            Self::AbortedWithDiagnostics => "aborted-with-diagnostics",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the orchestrator holds for one session.
///
/// The instances and domains recorded here are exactly the ones the session
/// is responsible for releasing.
#[derive(Clone, Debug)]
pub struct Session {
    /// Unique id attached to the session's log span.
    pub id: Uuid,
    /// Job name.
    pub job_name: String,
    /// The environment, renamed for the session once configured.
    pub environment: Environment,
    /// Instances created for the session.
    pub instances: Vec<InstanceRecord>,
    /// Domains acquired for the session.
    pub domains: Vec<AcquiredDomain>,
    /// Additional machines enlisted after bootstrap.
    pub machines: Vec<String>,
    /// Address of the bootstrap host, once known.
    pub bootstrap_host: Option<String>,
    /// Instance id of the bootstrap host when it was created here.
    pub bootstrap_id: Option<String>,
    /// Bootstrap descriptor path, once bootstrap has been attempted.
    pub descriptor: Option<Utf8PathBuf>,
    /// Whether batch instances were created.
    pub created_machines: bool,
    /// Whether resources are left running at the end.
    pub keep_environment: bool,
    /// Current phase.
    pub phase: LifecyclePhase,
}

impl Session {
    /// Starts a session for `environment`.
    #[must_use]
    pub fn new(environment: Environment, request: &SessionRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_name: request.job_name.clone(),
            environment,
            instances: Vec::new(),
            domains: Vec::new(),
            machines: request.machines.clone(),
            bootstrap_host: request.bootstrap_host.clone(),
            bootstrap_id: None,
            descriptor: None,
            created_machines: false,
            keep_environment: request.keep_environment,
            phase: LifecyclePhase::Start,
        }
    }

    pub(crate) fn enter(&mut self, phase: LifecyclePhase) {
        tracing::info!(from = %self.phase, to = %phase, "lifecycle transition");
        self.phase = phase;
    }
}

/// Result of a session: its final state, error, and best-effort records.
#[derive(Debug)]
pub struct SessionOutcome {
    /// Final session state.
    pub session: Session,
    /// Error that ended the session, if any.
    pub error: Option<LifecycleError>,
    /// Diagnostics captured after a failure.
    pub diagnostics: Option<DiagnosticsReport>,
    /// Teardown steps.
    pub teardown: TeardownReport,
}

impl SessionOutcome {
    /// Returns `true` when the session finished without error. Teardown
    /// failures do not count.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Process exit status: 0 on success, 1 otherwise.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        if self.is_success() { 0 } else { 1 }
    }

    /// Converts the outcome into a `Result`, keeping only the error.
    ///
    /// # Errors
    ///
    /// Returns the [`LifecycleError`] that ended the session.
    pub fn into_result(self) -> Result<(), LifecycleError> {
        self.error.map_or(Ok(()), Err)
    }
}
