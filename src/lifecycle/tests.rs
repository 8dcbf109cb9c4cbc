//! Unit tests for the session lifecycle.

use std::collections::{BTreeMap, BTreeSet};

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;
use crate::batch::{BatchApiError, InstanceRecord, InstanceSpec};
use crate::control::Status;
use crate::environment::ProviderKind;
use crate::remote::RemoteAccess;
use crate::test_support::{
    CallLog, ControlCall, FakeDomainApi, FakeInstanceApi, RecordingControlPlane, ScriptedRunner,
    ScriptedWorkload, StaticPortCheck, status_of,
};

type TestLifecycle =
    Lifecycle<RecordingControlPlane, FakeInstanceApi, FakeDomainApi, ScriptedRunner, StaticPortCheck>;

const VERSION: &str = "1.20.11";

struct Harness {
    _dir: TempDir,
    root: Utf8PathBuf,
    log: CallLog,
    control: RecordingControlPlane,
    instances: FakeInstanceApi,
    domains: FakeDomainApi,
    runner: ScriptedRunner,
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
            .unwrap_or_else(|raw| panic!("non utf-8 tempdir: {}", raw.display()));
        std::fs::create_dir_all(root.join("logs")).unwrap_or_else(|err| panic!("mkdir logs: {err}"));
        let log = CallLog::new();
        Self {
            _dir: dir,
            root,
            control: RecordingControlPlane::new()
                .with_log(log.clone())
                .with_status(status_of(&[("0", "10.0.0.5", VERSION)])),
            instances: FakeInstanceApi::new().with_log(log.clone()),
            domains: FakeDomainApi::new().with_log(log.clone()),
            runner: ScriptedRunner::new(),
            log,
        }
    }

    fn with_domains(mut self, domains: &[(&str, bool)]) -> Self {
        let mut api = FakeDomainApi::new().with_log(self.log.clone());
        for (name, running) in domains {
            api = api.with_domain(name, *running);
        }
        self.domains = api;
        self
    }

    fn writing_descriptor(mut self) -> Self {
        self.control = self.control.writing_descriptor();
        self
    }

    fn with_status(mut self, status: Status) -> Self {
        self.control = self.control.with_status(status);
        self
    }

    fn environment(&self, provider_type: &str) -> Environment {
        Environment::from_config(
            "base",
            BTreeMap::from([(String::from("type"), provider_type.to_owned())]),
            self.root.join("juju-home"),
        )
    }

    fn request(&self) -> SessionRequest {
        SessionRequest::new("job-1", self.root.join("logs"))
    }

    fn lifecycle(&self, check: &StaticPortCheck) -> TestLifecycle {
        let template = InstanceSpec {
            count: 0,
            image_id: String::from("ami-1"),
            instance_type: String::from("m1.large"),
            key_name: String::from("id_rsa"),
            security_group: String::from("manual-juju-test"),
        };
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
            PortWaiter::new(check.clone()),
        )
        .with_timings(test_timings())
    }

    fn seed_instances(&self) {
        self.instances.push_run(vec![
            InstanceRecord::new("i-1", "10.0.0.1"),
            InstanceRecord::new("i-2", "10.0.0.2"),
            InstanceRecord::new("i-3", "10.0.0.3"),
        ]);
    }

    fn position(&self, prefix: &str) -> usize {
        self.log
            .position(prefix)
            .unwrap_or_else(|| panic!("{prefix} not logged in {:?}", self.log.entries()))
    }
}

fn test_timings() -> LifecycleTimings {
    LifecycleTimings {
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
    }
}

#[fixture]
fn harness() -> Harness {
    Harness::new()
}

fn is_destroy(call: &ControlCall) -> bool {
    matches!(call, ControlCall::DestroyEnvironment(_))
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn manual_session_provisions_bootstraps_and_releases(harness: Harness) {
    harness.seed_instances();
    let workload = ScriptedWorkload::new().with_log(harness.log.clone());
    let lifecycle = harness.lifecycle(&StaticPortCheck::open());

    let outcome = lifecycle
        .run(harness.environment("manual"), &harness.request(), &workload)
        .await;

    assert!(outcome.is_success(), "unexpected error: {:?}", outcome.error);
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(outcome.session.phase, LifecyclePhase::Done);
    assert!(outcome.session.created_machines);
    assert_eq!(outcome.session.bootstrap_host.as_deref(), Some("10.0.0.1"));
    assert_eq!(outcome.session.bootstrap_id.as_deref(), Some("i-1"));
    assert_eq!(outcome.session.environment.name, "job-1");
    assert_eq!(
        outcome.session.environment.config.get("bootstrap-host").map(String::as_str),
        Some("10.0.0.1")
    );
    assert_eq!(
        harness.control.juju_commands(),
        vec![
            (String::from("add-machine"), vec![String::from("ssh:10.0.0.2")]),
            (String::from("add-machine"), vec![String::from("ssh:10.0.0.3")]),
            (String::from("status"), Vec::new()),
        ]
    );
    assert_eq!(workload.runs().len(), 1);
    assert_eq!(
        harness.instances.terminations(),
        vec![vec![
            String::from("i-1"),
            String::from("i-2"),
            String::from("i-3"),
        ]]
    );
    assert_eq!(
        outcome.teardown.step_names(),
        vec!["print status", "destroy environment", "destroy instances for job job-1"]
    );
    assert!(harness.position("control.bootstrap") < harness.position("workload.run"));
    assert!(
        harness.position("control.destroy_environment") < harness.position("batch.terminate")
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn kept_environment_is_left_running(harness: Harness) {
    harness.seed_instances();
    let lifecycle = harness.lifecycle(&StaticPortCheck::open());
    let request = SessionRequest {
        keep_environment: true,
        ..harness.request()
    };

    let outcome = lifecycle
        .run(harness.environment("manual"), &request, &ScriptedWorkload::new())
        .await;

    assert!(outcome.is_success());
    assert_eq!(outcome.teardown.step_names(), vec!["print status"]);
    assert_eq!(harness.control.count(is_destroy), 0);
    assert!(harness.instances.terminations().is_empty());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn virtualized_session_starts_and_stops_domains() {
    let harness = Harness::new().with_domains(&[("domA", true), ("domB", false)]);
    let lifecycle = harness.lifecycle(&StaticPortCheck::open());
    let request = SessionRequest {
        machines: vec![
            String::from("domA@qemu+ssh://h1"),
            String::from("domB@qemu+ssh://h2"),
        ],
        ..harness.request()
    };
    let started = tokio::time::Instant::now();

    let outcome = lifecycle
        .run(harness.environment("maas"), &request, &ScriptedWorkload::new())
        .await;

    assert!(outcome.is_success(), "unexpected error: {:?}", outcome.error);
    assert_eq!(harness.domains.starts(), vec![String::from("domB")]);
    assert_eq!(
        harness.domains.stops(),
        vec![String::from("domA"), String::from("domB")]
    );
    let flags = outcome
        .session
        .domains
        .iter()
        .map(|acquired| (acquired.domain.name.as_str(), acquired.already_running))
        .collect::<Vec<_>>();
    assert_eq!(flags, vec![("domA", true), ("domB", false)]);
    assert!(outcome.session.machines.is_empty());
    assert!(
        harness
            .control
            .juju_commands()
            .iter()
            .all(|(command, _)| command != "add-machine")
    );
    assert_eq!(outcome.session.bootstrap_host.as_deref(), Some("10.0.0.5"));
    assert!(harness.position("control.destroy_environment") < harness.position("domain.stop"));
    assert!(started.elapsed() >= Duration::from_secs(90));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn failed_domain_start_stops_every_domain_touched() {
    let harness =
        Harness::new().with_domains(&[("domA", false), ("domB", false), ("domC", false)]);
    harness.domains.fail_start("domB");
    let lifecycle = harness.lifecycle(&StaticPortCheck::open());
    let request = SessionRequest {
        machines: vec![
            String::from("domA@qemu+ssh://h1"),
            String::from("domB@qemu+ssh://h2"),
            String::from("domC@qemu+ssh://h3"),
        ],
        ..harness.request()
    };

    let outcome = lifecycle
        .run(harness.environment("maas"), &request, &ScriptedWorkload::new())
        .await;

    assert!(matches!(outcome.error, Some(LifecycleError::Domain(_))));
    assert_eq!(outcome.session.phase, LifecyclePhase::Failed);
    assert_eq!(
        harness.domains.starts(),
        vec![String::from("domA"), String::from("domB")]
    );
    assert_eq!(
        harness.domains.stops(),
        vec![String::from("domA"), String::from("domB")]
    );
    assert_eq!(outcome.session.domains.len(), 2);
    assert!(harness.control.calls().is_empty());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn failed_provisioning_releases_nothing(harness: Harness) {
    harness.instances.push_run_error(BatchApiError::Rejected {
        operation: String::from("run-instances"),
        message: String::from("quota exceeded"),
    });
    let workload = ScriptedWorkload::new();
    let lifecycle = harness.lifecycle(&StaticPortCheck::open());

    let outcome = lifecycle
        .run(harness.environment("manual"), &harness.request(), &workload)
        .await;

    let error = outcome.error.as_ref().unwrap_or_else(|| panic!("expected failure"));
    assert_eq!(error.kind(), "ProvisioningError");
    assert_eq!(outcome.exit_code(), 1);
    assert!(outcome.teardown.steps.is_empty());
    assert!(harness.instances.terminations().is_empty());
    assert!(harness.control.calls().is_empty());
    assert!(workload.runs().is_empty());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn unreachable_host_aborts_before_bootstrap(harness: Harness) {
    let lifecycle = harness.lifecycle(&StaticPortCheck::closed());
    let request = SessionRequest {
        bootstrap_host: Some(String::from("10.0.0.9")),
        ..harness.request()
    };

    let outcome = lifecycle
        .run(harness.environment("manual"), &request, &ScriptedWorkload::new())
        .await;

    assert!(matches!(
        outcome.error,
        Some(LifecycleError::Unreachable(ref err)) if err.host == "10.0.0.9" && err.port == 22
    ));
    assert_eq!(outcome.session.phase, LifecyclePhase::AbortedWithDiagnostics);
    let diagnostics = outcome
        .diagnostics
        .unwrap_or_else(|| panic!("diagnostics expected"));
    assert!(diagnostics.contains("logs for 10.0.0.9"));
    assert!(harness.control.calls().is_empty());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn bootstrap_failure_collects_logs_without_destroying(harness: Harness) {
    harness.control.fail("bootstrap");
    let lifecycle = harness.lifecycle(&StaticPortCheck::open());
    let request = SessionRequest {
        bootstrap_host: Some(String::from("10.0.0.9")),
        ..harness.request()
    };

    let outcome = lifecycle
        .run(harness.environment("manual"), &request, &ScriptedWorkload::new())
        .await;

    let error = outcome.error.as_ref().unwrap_or_else(|| panic!("expected failure"));
    assert_eq!(error.kind(), "BootstrapFailure");
    assert!(
        outcome
            .diagnostics
            .as_ref()
            .is_some_and(|report| report.contains("logs for 10.0.0.9"))
    );
    assert_eq!(harness.control.count(is_destroy), 0);
    assert!(outcome.teardown.steps.is_empty());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn unusable_scratch_dir_collects_bootstrap_diagnostics(harness: Harness) {
    let lifecycle = harness
        .lifecycle(&StaticPortCheck::open())
        .with_scratch_dir(harness.root.join("missing"));
    let request = SessionRequest {
        bootstrap_host: Some(String::from("10.0.0.9")),
        ..harness.request()
    };

    let outcome = lifecycle
        .run(harness.environment("manual"), &request, &ScriptedWorkload::new())
        .await;

    assert!(matches!(outcome.error, Some(LifecycleError::Environment(_))));
    assert_eq!(outcome.session.phase, LifecyclePhase::AbortedWithDiagnostics);
    assert!(
        outcome
            .diagnostics
            .as_ref()
            .is_some_and(|report| report.contains("logs for 10.0.0.9"))
    );
    assert_eq!(
        harness
            .control
            .count(|call| matches!(call, ControlCall::Bootstrap { .. })),
        0
    );
    assert!(outcome.teardown.steps.is_empty());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn workload_failure_collects_diagnostics_and_still_tears_down() {
    let harness = Harness::new().writing_descriptor();
    let lifecycle = harness.lifecycle(&StaticPortCheck::open());

    let outcome = lifecycle
        .run(
            harness.environment("openstack"),
            &harness.request(),
            &ScriptedWorkload::failing("token mismatch"),
        )
        .await;

    assert!(matches!(outcome.error, Some(LifecycleError::Workload(_))));
    assert_eq!(outcome.exit_code(), 1);
    assert_eq!(outcome.session.phase, LifecyclePhase::AbortedWithDiagnostics);
    let diagnostics = outcome
        .diagnostics
        .as_ref()
        .unwrap_or_else(|| panic!("diagnostics expected"));
    assert!(diagnostics.contains("logs for machine-0"));
    assert!(
        diagnostics
            .steps
            .contains(&BestEffort::completed("retain bootstrap descriptor"))
    );
    assert!(harness.root.join("logs/job-1.jenv").exists());
    assert_eq!(harness.control.count(is_destroy), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn placeholder_addresses_are_skipped_when_resolving_the_host(harness: Harness) {
    harness
        .control
        .push_status(status_of(&[("0", "172.16.0.2", VERSION)]));
    let workload = ScriptedWorkload::new();
    let lifecycle = harness.lifecycle(&StaticPortCheck::open());

    let outcome = lifecycle
        .run(harness.environment("openstack"), &harness.request(), &workload)
        .await;

    assert!(outcome.is_success(), "unexpected error: {:?}", outcome.error);
    assert_eq!(
        workload
            .runs()
            .first()
            .map(|run| run.bootstrap_host.as_str()),
        Some("10.0.0.5")
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn unresolved_host_fails_without_diagnostics() {
    let harness = Harness::new().with_status(status_of(&[]));
    let workload = ScriptedWorkload::new();
    let lifecycle = harness.lifecycle(&StaticPortCheck::open());

    let outcome = lifecycle
        .run(harness.environment("openstack"), &harness.request(), &workload)
        .await;

    assert!(matches!(
        outcome.error,
        Some(LifecycleError::HostResolution { .. })
    ));
    assert_eq!(outcome.session.phase, LifecyclePhase::Failed);
    assert!(outcome.diagnostics.is_none());
    assert!(workload.runs().is_empty());
    assert_eq!(harness.control.count(is_destroy), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn teardown_failures_are_recorded_not_raised(harness: Harness) {
    harness.seed_instances();
    harness.control.fail("destroy_environment");
    let lifecycle = harness.lifecycle(&StaticPortCheck::open());

    let outcome = lifecycle
        .run(harness.environment("manual"), &harness.request(), &ScriptedWorkload::new())
        .await;

    assert!(outcome.is_success());
    assert_eq!(outcome.teardown.failures().count(), 1);
    assert_eq!(harness.instances.terminations().len(), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn state_server_shutdown_is_confirmed_when_enabled(harness: Harness) {
    let lifecycle = harness
        .lifecycle(&StaticPortCheck::open())
        .with_state_server_shutdown_check(true);
    let request = SessionRequest {
        bootstrap_host: Some(String::from("10.0.0.9")),
        ..harness.request()
    };

    let outcome = lifecycle
        .run(harness.environment("manual"), &request, &ScriptedWorkload::new())
        .await;

    assert!(outcome.is_success());
    let last = outcome
        .teardown
        .steps
        .last()
        .unwrap_or_else(|| panic!("teardown steps expected"));
    assert_eq!(last.step(), "state server shutdown");
    assert!(last.is_failed(), "an open port never reports closed");
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn diverging_agents_are_upgraded_once(harness: Harness) {
    let control = RecordingControlPlane::new()
        .with_status(status_of(&[("0", "10.0.0.5", "1.18.4"), ("1", "10.0.0.6", VERSION)]));
    let env = harness.environment("openstack");

    let target = prepare::reconcile_agent_versions(&control, &env, &test_timings())
        .await
        .unwrap_or_else(|err| panic!("reconcile: {err}"));

    assert_eq!(target, VERSION);
    assert_eq!(
        control.juju_commands(),
        vec![(
            String::from("upgrade-juju"),
            vec![String::from("--version"), String::from(VERSION)]
        )]
    );
    assert!(control.calls().contains(&ControlCall::WaitForVersion {
        env: String::from("base"),
        version: String::from(VERSION),
    }));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn upgrade_runs_after_a_successful_workload_when_requested(harness: Harness) {
    let workload = ScriptedWorkload::new().with_log(harness.log.clone());
    let lifecycle = harness.lifecycle(&StaticPortCheck::open());
    let request = SessionRequest {
        upgrade: true,
        ..harness.request()
    };

    let outcome = lifecycle
        .run(harness.environment("openstack"), &request, &workload)
        .await;

    assert!(outcome.is_success(), "unexpected error: {:?}", outcome.error);
    let entries = harness.log.entries();
    let after_workload = &entries[harness.position("workload.run") + 1..];
    assert_eq!(
        after_workload.get(..6),
        Some(
            &[
                String::from("control.juju:status"),
                String::from("control.set_testing_tools_metadata_url"),
                String::from("control.upgrade_juju"),
                String::from("control.matching_agent_version"),
                String::from("control.wait_for_version"),
                String::from("control.wait_for_started"),
            ][..]
        )
    );
    let calls = harness.control.calls();
    assert!(calls.contains(&ControlCall::UpgradeJuju(String::from("job-1"))));
    assert!(calls.contains(&ControlCall::WaitForStarted(String::from("job-1"))));
    assert_eq!(harness.control.count(is_destroy), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn upgrade_is_skipped_unless_requested(harness: Harness) {
    let lifecycle = harness.lifecycle(&StaticPortCheck::open());

    let outcome = lifecycle
        .run(harness.environment("openstack"), &harness.request(), &ScriptedWorkload::new())
        .await;

    assert!(outcome.is_success(), "unexpected error: {:?}", outcome.error);
    let upgrade_calls = harness.control.count(|call| {
        matches!(
            call,
            ControlCall::UpgradeJuju(_)
                | ControlCall::SetTestingToolsMetadataUrl(_)
                | ControlCall::WaitForStarted(_)
        )
    });
    assert_eq!(upgrade_calls, 0);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn failed_upgrade_collects_diagnostics_and_tears_down() {
    let harness = Harness::new().writing_descriptor();
    harness.control.fail("upgrade_juju");
    let workload = ScriptedWorkload::new();
    let lifecycle = harness.lifecycle(&StaticPortCheck::open());
    let request = SessionRequest {
        upgrade: true,
        ..harness.request()
    };

    let outcome = lifecycle
        .run(harness.environment("openstack"), &request, &workload)
        .await;

    assert!(matches!(outcome.error, Some(LifecycleError::Upgrade(_))));
    assert_eq!(outcome.exit_code(), 1);
    assert_eq!(outcome.session.phase, LifecyclePhase::AbortedWithDiagnostics);
    assert_eq!(workload.runs().len(), 1);
    assert_eq!(
        harness
            .control
            .count(|call| matches!(call, ControlCall::WaitForStarted(_))),
        0
    );
    assert!(outcome.diagnostics.is_some());
    assert_eq!(harness.control.count(is_destroy), 1);
}

#[rstest]
#[case(ProviderKind::Manual, 6)]
#[case(ProviderKind::Generic, 6)]
#[case(ProviderKind::Virtualized, 12)]
fn virtualized_environments_wait_longer_for_upgrades(
    #[case] kind: ProviderKind,
    #[case] seconds: u64,
) {
    assert_eq!(
        test_timings().upgrade_wait_for(kind),
        Duration::from_secs(seconds)
    );
}

#[rstest]
#[case(&[VERSION], true)]
#[case(&["1.18.4"], false)]
#[case(&[VERSION, "1.18.4"], false)]
#[case(&["unknown"], false)]
fn convergence_requires_exactly_the_target(#[case] reported: &[&str], #[case] expected: bool) {
    let versions = reported
        .iter()
        .map(|version| ((*version).to_owned(), BTreeSet::from([String::from("0")])))
        .collect::<BTreeMap<_, _>>();

    assert_eq!(prepare::versions_converged(&versions, VERSION), expected);
}

#[rstest]
#[case(ProviderKind::Manual, false, ProviderStrategy::Manual { provision: true })]
#[case(ProviderKind::Manual, true, ProviderStrategy::Manual { provision: false })]
#[case(ProviderKind::Virtualized, true, ProviderStrategy::Virtualized)]
#[case(ProviderKind::Generic, false, ProviderStrategy::Generic)]
fn strategy_is_selected_from_the_provider(
    #[case] kind: ProviderKind,
    #[case] has_host: bool,
    #[case] expected: ProviderStrategy,
) {
    assert_eq!(ProviderStrategy::select(kind, has_host), expected);
}

#[test]
fn error_kinds_name_the_failure_class() {
    let workload = LifecycleError::Workload(WorkloadError::Failed {
        message: String::from("boom"),
    });
    assert_eq!(workload.kind(), "WorkloadFailure");
    assert_eq!(workload.to_string(), "workload failed: boom");
    let upgrade = LifecycleError::Upgrade(crate::control::ControlPlaneError::Timeout {
        what: format!("agents to reach {VERSION}"),
        seconds: 600,
    });
    assert_eq!(upgrade.kind(), "WorkloadFailure");
}
