//! Shared fixtures and helpers for lifecycle BDD scenarios.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use rstest::fixture;
use stackrun::test_support::{
    CallLog, FakeDomainApi, FakeInstanceApi, RecordingControlPlane, ScriptedRunner,
    ScriptedWorkload, StaticPortCheck, status_of,
};
use stackrun::{
    BatchProvisioner, DiagnosticsCollector, Environment, InstanceSpec, Lifecycle,
    LifecyclePhase, LifecycleTimings, PortWaiter, RemoteAccess, SessionOutcome, SessionRequest,
};
use tempfile::TempDir;

pub type TestLifecycle =
    Lifecycle<RecordingControlPlane, FakeInstanceApi, FakeDomainApi, ScriptedRunner, StaticPortCheck>;

/// What a finished session looked like.
#[derive(Clone, Debug)]
pub struct SessionSummary {
    pub error_kind: Option<&'static str>,
    pub phase: LifecyclePhase,
    pub exit_code: i32,
    pub diagnostics: bool,
}

impl From<&SessionOutcome> for SessionSummary {
    fn from(outcome: &SessionOutcome) -> Self {
        Self {
            error_kind: outcome.error.as_ref().map(stackrun::LifecycleError::kind),
            phase: outcome.session.phase,
            exit_code: outcome.exit_code(),
            diagnostics: outcome.diagnostics.is_some(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct LifecycleContext {
    pub _dir: Arc<TempDir>,
    pub root: Utf8PathBuf,
    pub log: CallLog,
    pub control: RecordingControlPlane,
    pub instances: FakeInstanceApi,
    pub domains: FakeDomainApi,
    pub runner: ScriptedRunner,
    pub provider: String,
    pub machines: Vec<String>,
    pub workload: ScriptedWorkload,
    pub upgrade: bool,
    pub summary: Option<SessionSummary>,
}

#[fixture]
pub fn lifecycle_context() -> LifecycleContext {
    let dir = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
        .unwrap_or_else(|raw| panic!("non utf-8 tempdir: {}", raw.display()));
    std::fs::create_dir_all(root.join("logs")).unwrap_or_else(|err| panic!("mkdir logs: {err}"));
    let log = CallLog::new();
    LifecycleContext {
        _dir: Arc::new(dir),
        root,
        control: RecordingControlPlane::new()
            .with_log(log.clone())
            .with_status(status_of(&[("0", "10.0.0.5", "1.20.11")])),
        instances: FakeInstanceApi::new().with_log(log.clone()),
        domains: FakeDomainApi::new().with_log(log.clone()),
        runner: ScriptedRunner::new(),
        provider: String::from("openstack"),
        machines: Vec::new(),
        workload: ScriptedWorkload::new(),
        upgrade: false,
        summary: None,
        log,
    }
}

impl LifecycleContext {
    pub fn environment(&self) -> Environment {
        Environment::from_config(
            "base",
            BTreeMap::from([(String::from("type"), self.provider.clone())]),
            self.root.join("juju-home"),
        )
    }

    pub fn request(&self) -> SessionRequest {
        SessionRequest {
            machines: self.machines.clone(),
            upgrade: self.upgrade,
            ..SessionRequest::new("job-1", self.root.join("logs"))
        }
    }

    pub fn lifecycle(&self) -> TestLifecycle {
        let template = InstanceSpec {
            count: 0,
            image_id: String::from("ami-1"),
            instance_type: String::from("m1.large"),
            key_name: String::from("id_rsa"),
            security_group: String::from("manual-juju-test"),
        };
        let check = StaticPortCheck::open();
        let collector = DiagnosticsCollector::new(
            self.runner.clone(),
            RemoteAccess::new(self.runner.clone()),
            PortWaiter::new(check.clone()),
        )
        .with_reachability_timeout(Duration::from_secs(2));
        Lifecycle::new(
            self.control.clone(),
            BatchProvisioner::new(self.instances.clone(), template),
            self.domains.clone(),
            collector,
            PortWaiter::new(check),
        )
        .with_timings(LifecycleTimings {
            reachability: Duration::from_secs(2),
            host_resolution: Duration::from_secs(5),
            domain_settle: Duration::from_secs(90),
            reconcile: Duration::from_secs(3),
            version_wait: Duration::from_secs(5),
            upgrade_wait: Duration::from_secs(6),
            virtualized_upgrade_wait: Duration::from_secs(12),
            status_timeout: Duration::from_secs(1),
            state_server_shutdown: Duration::from_secs(3),
            poll_interval: Duration::from_secs(1),
        })
    }

    pub fn position(&self, prefix: &str) -> usize {
        self.log
            .position(prefix)
            .unwrap_or_else(|| panic!("{prefix} not logged in {:?}", self.log.entries()))
    }
}

pub fn domain_ref(name: &str) -> String {
    format!("{name}@qemu+ssh://{name}.local/system")
}
