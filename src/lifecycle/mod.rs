//! Session lifecycle orchestration.
//!
//! [`Lifecycle::run`] drives one session through provisioning, environment
//! configuration, reachability checks, bootstrap and the caller's workload
//! (optionally followed by an upgrade), then tears everything down in
//! reverse order of acquisition. Failures in bootstrap, the workload or the
//! upgrade trigger diagnostics capture before teardown.
//! Teardown always runs once, whichever phase failed, and its own failures
//! are recorded rather than raised.

mod error;
pub mod prepare;
mod provider;
mod session;
mod teardown;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::time::sleep;
use tracing::Instrument;

use crate::batch::{BatchProvisioner, InstanceApi};
use crate::command::CommandRunner;
use crate::control::ControlPlane;
use crate::diagnostics::{DiagnosticsCollector, DiagnosticsReport, DumpRequest};
use crate::domain::{DomainApi, DomainManager};
use crate::environment::{Environment, ProviderKind, WorkHome};
use crate::outcome::BestEffort;
use crate::poll::Deadline;
use crate::port::{
    PortCheck, PortState, PortTimeoutError, PortWaiter, SSH_PORT, STATE_SERVER_PORT, TcpCheck,
};

pub use error::{LifecycleError, WorkloadError};
pub use provider::{MANUAL_INSTANCE_COUNT, ProviderStrategy};
pub use session::{LifecyclePhase, Session, SessionOutcome, SessionRequest};
pub use teardown::{Release, TeardownReport, TeardownStack};

/// Addresses with this prefix are container placeholders, not the host.
const PLACEHOLDER_PREFIX: &str = "172.";
const BOOTSTRAP_MACHINE: &str = "0";

/// Future returned by [`Workload::run`].
pub type WorkloadFuture<'a> = Pin<Box<dyn Future<Output = Result<(), WorkloadError>> + Send + 'a>>;

/// Work run against a bootstrapped environment.
pub trait Workload: Send + Sync {
    /// Runs against `env`, whose state server is at `bootstrap_host`.
    fn run<'a>(&'a self, env: &'a Environment, bootstrap_host: &'a str) -> WorkloadFuture<'a>;
}

/// Bounds for every timed wait in a session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LifecycleTimings {
    /// SSH reachability wait per machine before bootstrap.
    pub reachability: Duration,
    /// Wait for machine 0 to report a usable address.
    pub host_resolution: Duration,
    /// Delay between environment destruction and stopping domains.
    pub domain_settle: Duration,
    /// Wait for agents to agree on a version before upgrading.
    pub reconcile: Duration,
    /// Wait for agents to report the target version.
    pub version_wait: Duration,
    /// Wait for agents to report the upgraded version after the workload.
    pub upgrade_wait: Duration,
    /// Upgrade wait for virtualized environments, whose machines are slower.
    pub virtualized_upgrade_wait: Duration,
    /// Timeout handed to each status query.
    pub status_timeout: Duration,
    /// Wait for the state server port to close after destruction.
    pub state_server_shutdown: Duration,
    /// Delay between polls.
    pub poll_interval: Duration,
}

impl Default for LifecycleTimings {
    fn default() -> Self {
        Self {
            reachability: Duration::from_secs(120),
            host_resolution: Duration::from_secs(600),
            domain_settle: Duration::from_secs(90),
            reconcile: Duration::from_secs(30),
            version_wait: Duration::from_secs(300),
            upgrade_wait: Duration::from_secs(600),
            virtualized_upgrade_wait: Duration::from_secs(1200),
            status_timeout: Duration::from_secs(60),
            state_server_shutdown: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl LifecycleTimings {
    /// Upgrade wait for an environment of `kind`.
    #[must_use]
    pub const fn upgrade_wait_for(&self, kind: ProviderKind) -> Duration {
        match kind {
            ProviderKind::Virtualized => self.virtualized_upgrade_wait,
            ProviderKind::Manual | ProviderKind::Generic => self.upgrade_wait,
        }
    }
}

struct Progress<'d, D> {
    session: Session,
    stack: TeardownStack,
    domains: DomainManager<&'d D>,
    diagnostics: Option<DiagnosticsReport>,
}

/// Orchestrates sessions over its collaborators.
#[derive(Debug)]
pub struct Lifecycle<C, I, D, R, P = TcpCheck> {
    control: C,
    provisioner: BatchProvisioner<I>,
    domain_api: D,
    collector: DiagnosticsCollector<R, P>,
    waiter: PortWaiter<P>,
    timings: LifecycleTimings,
    confirm_state_server_shutdown: bool,
    scratch_dir: Option<Utf8PathBuf>,
}

impl<C, I, D, R, P> Lifecycle<C, I, D, R, P>
where
    C: ControlPlane,
    I: InstanceApi,
    D: DomainApi,
    R: CommandRunner,
    P: PortCheck,
{
    /// Creates an orchestrator with default timings.
    #[must_use]
    pub fn new(
        control: C,
        provisioner: BatchProvisioner<I>,
        domain_api: D,
        collector: DiagnosticsCollector<R, P>,
        waiter: PortWaiter<P>,
    ) -> Self {
        Self {
            control,
            provisioner,
            domain_api,
            collector,
            waiter,
            timings: LifecycleTimings::default(),
            confirm_state_server_shutdown: false,
            scratch_dir: None,
        }
    }

    /// Overrides the wait bounds.
    #[must_use]
    pub const fn with_timings(mut self, timings: LifecycleTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Waits for the state server port to close after destroying the
    /// environment.
    #[must_use]
    pub const fn with_state_server_shutdown_check(mut self, enabled: bool) -> Self {
        self.confirm_state_server_shutdown = enabled;
        self
    }

    /// Creates temporary juju homes under `dir` instead of the system
    /// temporary directory.
    #[must_use]
    pub fn with_scratch_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    /// Borrow the control-plane client.
    #[must_use]
    pub const fn control(&self) -> &C {
        &self.control
    }

    /// Runs one session for `environment` and returns its outcome.
    ///
    /// Never panics on collaborator failures: the error that ended the
    /// session is returned in [`SessionOutcome::error`] after teardown.
    pub async fn run<W>(
        &self,
        environment: Environment,
        request: &SessionRequest,
        workload: &W,
    ) -> SessionOutcome
    where
        W: Workload + ?Sized,
    {
        let session = Session::new(environment, request);
        let span = tracing::info_span!("session", job = %request.job_name, id = %session.id);
        self.run_session(session, request, workload)
            .instrument(span)
            .await
    }

    async fn run_session<W>(
        &self,
        session: Session,
        request: &SessionRequest,
        workload: &W,
    ) -> SessionOutcome
    where
        W: Workload + ?Sized,
    {
        let mut progress = Progress {
            session,
            stack: TeardownStack::new(),
            domains: DomainManager::new(&self.domain_api),
            diagnostics: None,
        };

        let result = self.advance(&mut progress, request, workload).await;
        if let Err(err) = &result {
            tracing::error!(error = %err, kind = err.kind(), phase = %progress.session.phase, "session failed");
        }

        progress.session.enter(LifecyclePhase::TearingDown);
        let teardown = self.teardown(&mut progress).await;
        let terminal = match (&result, &progress.diagnostics) {
            (Ok(()), _) => LifecyclePhase::Done,
            (Err(_), Some(_)) => LifecyclePhase::AbortedWithDiagnostics,
            (Err(_), None) => LifecyclePhase::Failed,
        };
        progress.session.enter(terminal);

        SessionOutcome {
            session: progress.session,
            error: result.err(),
            diagnostics: progress.diagnostics,
            teardown,
        }
    }

    async fn advance<W>(
        &self,
        progress: &mut Progress<'_, D>,
        request: &SessionRequest,
        workload: &W,
    ) -> Result<(), LifecycleError>
    where
        W: Workload + ?Sized,
    {
        let strategy = ProviderStrategy::select(
            progress.session.environment.provider(),
            progress.session.bootstrap_host.is_some(),
        );
        tracing::info!(strategy = ?strategy, "selected provider strategy");

        progress.session.enter(LifecyclePhase::Provisioning);
        strategy
            .acquire(
                &self.provisioner,
                &mut progress.domains,
                &mut progress.session,
                &mut progress.stack,
            )
            .await?;

        progress.session.enter(LifecyclePhase::ConfiguringEnvironment);
        let overrides = request.overrides(progress.session.bootstrap_host.as_deref());
        progress.session.environment.apply(&overrides);

        progress.session.enter(LifecyclePhase::WaitingForReachability);
        if let Err(err) = self.wait_for_machines(&progress.session).await {
            progress.diagnostics = self
                .capture_bootstrap_failure(&progress.session, &request.log_dir)
                .await;
            return Err(err.into());
        }

        progress.session.enter(LifecyclePhase::Bootstrapping);
        self.bootstrap(progress, request).await?;

        progress.session.enter(LifecyclePhase::Running);
        let host = self.resolve_bootstrap_host(&progress.session).await?;
        progress.session.bootstrap_host = Some(host.clone());
        if let Err(err) = self
            .run_workload(&progress.session, request, &host, workload)
            .await
        {
            tracing::error!(error = %err, "workload failed; collecting diagnostics");
            progress.diagnostics = Some(
                self.capture_env_logs(&progress.session, &host, &request.log_dir)
                    .await,
            );
            return Err(err);
        }
        Ok(())
    }

    async fn wait_for_machines(&self, session: &Session) -> Result<(), PortTimeoutError> {
        let hosts = session.machines.iter().chain(session.bootstrap_host.as_ref());
        for host in hosts {
            tracing::info!(host = %host, "waiting for port 22");
            self.waiter
                .wait_for_port(host, SSH_PORT, self.timings.reachability, PortState::Open)
                .await?;
        }
        Ok(())
    }

    async fn bootstrap(
        &self,
        progress: &mut Progress<'_, D>,
        request: &SessionRequest,
    ) -> Result<(), LifecycleError> {
        let descriptor = progress.session.environment.descriptor_path();
        progress.session.descriptor = Some(descriptor);
        if progress.session.environment.remove_stale_descriptor()? {
            tracing::info!(env = %progress.session.environment.name, "removed stale bootstrap descriptor");
        }

        match self.bootstrap_in_work_home(&progress.session.environment, request).await {
            Ok(()) => {
                progress.stack.push(Release::Environment {
                    destroy: !progress.session.keep_environment,
                });
                Ok(())
            }
            Err(err) => {
                progress.diagnostics = self
                    .capture_bootstrap_failure(&progress.session, &request.log_dir)
                    .await;
                Err(err)
            }
        }
    }

    async fn bootstrap_in_work_home(
        &self,
        env: &Environment,
        request: &SessionRequest,
    ) -> Result<(), LifecycleError> {
        let work_home = match &self.scratch_dir {
            Some(dir) => WorkHome::create_in(env, dir)?,
            None => WorkHome::create(env)?,
        };
        self.control
            .bootstrap(env, request.upload_tools, work_home.path())
            .await
            .map_err(LifecycleError::Bootstrap)
    }

    async fn resolve_bootstrap_host(&self, session: &Session) -> Result<String, LifecycleError> {
        if let Some(host) = &session.bootstrap_host {
            return Ok(host.clone());
        }

        let mut deadline = Deadline::new(self.timings.host_resolution, self.timings.poll_interval);
        while let Some(remaining) = deadline.tick().await {
            let status = self
                .control
                .get_status(&session.environment, remaining)
                .await
                .map_err(|err| LifecycleError::HostResolution {
                    message: err.to_string(),
                })?;
            if let Some(address) = status
                .machine_address(BOOTSTRAP_MACHINE)
                .filter(|address| !address.starts_with(PLACEHOLDER_PREFIX))
            {
                tracing::info!(host = %address, "resolved bootstrap host");
                return Ok(address.to_owned());
            }
        }

        Err(LifecycleError::HostResolution {
            message: format!(
                "no usable address after {}s",
                self.timings.host_resolution.as_secs()
            ),
        })
    }

    async fn run_workload<W>(
        &self,
        session: &Session,
        request: &SessionRequest,
        host: &str,
        workload: &W,
    ) -> Result<(), LifecycleError>
    where
        W: Workload + ?Sized,
    {
        let env = &session.environment;
        prepare::prepare_environment(&self.control, env, &session.machines, &self.timings)
            .await
            .map_err(LifecycleError::Prepare)?;
        workload.run(env, host).await?;
        if request.upgrade {
            let version = prepare::assess_upgrade(&self.control, env, &self.timings)
                .await
                .map_err(LifecycleError::Upgrade)?;
            tracing::info!(version = %version, "upgrade completed");
        }
        Ok(())
    }

    const fn console(&self) -> Option<&dyn InstanceApi> {
        Some(self.provisioner.api())
    }

    async fn capture_bootstrap_failure(
        &self,
        session: &Session,
        log_dir: &Utf8Path,
    ) -> Option<DiagnosticsReport> {
        let host = session.bootstrap_host.as_deref()?;
        tracing::warn!(host = %host, "collecting logs from bootstrap host");
        let request = DumpRequest {
            bootstrap_host: Some(host),
            log_dir,
            host_id: session.bootstrap_id.as_deref(),
            descriptor: None,
        };
        Some(
            self.collector
                .dump_bootstrap_failure(&session.environment, host, self.console(), &request)
                .await,
        )
    }

    async fn capture_env_logs(
        &self,
        session: &Session,
        host: &str,
        log_dir: &Utf8Path,
    ) -> DiagnosticsReport {
        let request = DumpRequest {
            bootstrap_host: Some(host),
            log_dir,
            host_id: session.bootstrap_id.as_deref(),
            descriptor: session.descriptor.as_deref(),
        };
        self.collector
            .dump_env_logs(&self.control, &session.environment, self.console(), &request)
            .await
    }

    async fn teardown(&self, progress: &mut Progress<'_, D>) -> TeardownReport {
        let mut report = TeardownReport::default();
        let stack = std::mem::take(&mut progress.stack);
        for release in stack.unwind() {
            match release {
                Release::Environment { destroy } => {
                    self.release_environment(&progress.session, destroy, &mut report)
                        .await;
                }
                Release::Instances { job_name } => {
                    report.steps.push(BestEffort::from_result(
                        format!("destroy instances for job {job_name}"),
                        self.provisioner.destroy_instances(&job_name),
                    ));
                }
                Release::Domains => {
                    if !progress.domains.acquired().is_empty() {
                        tracing::info!(
                            seconds = self.timings.domain_settle.as_secs(),
                            "waiting for environment destruction to settle"
                        );
                        sleep(self.timings.domain_settle).await;
                    }
                    for released in progress.domains.release_all().await {
                        report.steps.push(released.outcome);
                    }
                }
            }
        }
        report
    }

    async fn release_environment(
        &self,
        session: &Session,
        destroy: bool,
        report: &mut TeardownReport,
    ) {
        let env = &session.environment;
        let status = self.control.juju(env, "status", &[]).await;
        if let Ok(output) = &status {
            tracing::info!(status = %output, "final status");
        }
        report
            .steps
            .push(BestEffort::from_result("print status", status));

        if !destroy {
            tracing::info!(env = %env.name, "keeping environment");
            return;
        }
        report.steps.push(BestEffort::from_result(
            "destroy environment",
            self.control.destroy_environment(env).await,
        ));

        if self.confirm_state_server_shutdown
            && let Some(host) = session.bootstrap_host.as_deref()
        {
            tracing::info!(host = %host, "waiting for state server port to close");
            let closed = self
                .waiter
                .wait_for_port(
                    host,
                    STATE_SERVER_PORT,
                    self.timings.state_server_shutdown,
                    PortState::Closed,
                )
                .await;
            report
                .steps
                .push(BestEffort::from_result("state server shutdown", closed));
        }
    }
}

#[cfg(test)]
mod tests;
