//! Test doubles shared by unit and behavioural tests.
//!
//! Every double is cheap to clone and shares its state between clones, so a
//! test can hand one clone to the code under test and keep another for
//! assertions. A [`CallLog`] can be attached to several doubles to assert on
//! the relative order of calls across collaborators.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

use crate::batch::{BatchApiError, InstanceApi, InstanceFilter, InstanceRecord, InstanceSpec};
use crate::command::{CommandEnv, CommandError, CommandOutput, CommandRunner};
use crate::control::{ControlFuture, ControlPlane, ControlPlaneError, MachineStatus, Status};
use crate::domain::{DomainApi, DomainError, DomainFuture, DomainRef, DomainState};
use crate::environment::Environment;
use crate::lifecycle::{Workload, WorkloadError, WorkloadFuture};
use crate::port::{PortCheck, CheckFuture};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Ordered record of calls made across several doubles.
#[derive(Clone, Debug, Default)]
pub struct CallLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry.
    pub fn record(&self, entry: impl Into<String>) {
        lock(&self.entries).push(entry.into());
    }

    /// Returns a snapshot of the entries.
    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        lock(&self.entries).clone()
    }

    /// Position of the first entry starting with `prefix`.
    #[must_use]
    pub fn position(&self, prefix: &str) -> Option<usize> {
        lock(&self.entries)
            .iter()
            .position(|entry| entry.starts_with(prefix))
    }
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Extra environment supplied for the call.
    pub env: CommandEnv,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len().saturating_add(1));
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
/// When the queue is empty the runner reports a spawn failure.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<CommandOutput>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        lock(&self.invocations).clone()
    }

    /// Returns the invocations rendered with [`CommandInvocation::command_string`].
    #[must_use]
    pub fn command_strings(&self) -> Vec<String> {
        lock(&self.invocations)
            .iter()
            .map(CommandInvocation::command_string)
            .collect()
    }

    /// Pushes a successful exit status with empty output.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a successful exit status with `stdout`.
    pub fn push_stdout(&self, stdout: impl Into<String>) {
        self.push_output(Some(0), stdout, "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        lock(&self.responses).push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(
        &self,
        program: &str,
        args: &[OsString],
        env: &CommandEnv,
    ) -> Result<CommandOutput, CommandError> {
        lock(&self.invocations).push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
            env: env.clone(),
        });
        lock(&self.responses)
            .pop_front()
            .ok_or_else(|| CommandError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

/// Calls observed by [`FakeInstanceApi`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InstanceApiCall {
    /// `run_instances`.
    Run(InstanceSpec),
    /// `describe_instances`.
    Describe(InstanceFilter),
    /// `terminate_instances`.
    Terminate(Vec<String>),
    /// `create_tags`.
    Tag {
        /// Tagged ids.
        ids: Vec<String>,
        /// Applied tags.
        tags: BTreeMap<String, String>,
    },
    /// `console_output`.
    Console(String),
}

#[derive(Debug, Default)]
struct InstanceState {
    run_results: VecDeque<Result<Vec<InstanceRecord>, BatchApiError>>,
    describe_results: VecDeque<Result<Vec<InstanceRecord>, BatchApiError>>,
    known: Vec<InstanceRecord>,
    tagged: BTreeMap<String, BTreeSet<String>>,
    terminated: BTreeSet<String>,
    tag_error: Option<BatchApiError>,
    terminate_error: Option<BatchApiError>,
    console: String,
    calls: Vec<InstanceApiCall>,
}

/// In-memory [`InstanceApi`].
///
/// `run_instances` pops scripted results. `describe_instances` pops scripted
/// results and, once those run out, answers from the instances created so
/// far: job filters match instances tagged through `create_tags`, id filters
/// match by id, and terminated instances are hidden.
#[derive(Clone, Debug, Default)]
pub struct FakeInstanceApi {
    state: Arc<Mutex<InstanceState>>,
    log: Option<CallLog>,
}

impl FakeInstanceApi {
    /// Creates an API with nothing scripted.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records calls into `log` as `batch.<operation>` entries.
    #[must_use]
    pub fn with_log(mut self, log: CallLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Scripts the next `run_instances` result.
    pub fn push_run(&self, records: Vec<InstanceRecord>) {
        lock(&self.state).run_results.push_back(Ok(records));
    }

    /// Scripts the next `run_instances` call to fail.
    pub fn push_run_error(&self, err: BatchApiError) {
        lock(&self.state).run_results.push_back(Err(err));
    }

    /// Scripts the next `describe_instances` result.
    pub fn push_describe(&self, records: Vec<InstanceRecord>) {
        lock(&self.state).describe_results.push_back(Ok(records));
    }

    /// Scripts the next `describe_instances` call to fail.
    pub fn push_describe_error(&self, err: BatchApiError) {
        lock(&self.state).describe_results.push_back(Err(err));
    }

    /// Makes every `create_tags` call fail.
    pub fn fail_tagging(&self, err: BatchApiError) {
        lock(&self.state).tag_error = Some(err);
    }

    /// Makes every `terminate_instances` call fail.
    pub fn fail_termination(&self, err: BatchApiError) {
        lock(&self.state).terminate_error = Some(err);
    }

    /// Sets the console text returned for any instance.
    pub fn set_console(&self, text: impl Into<String>) {
        lock(&self.state).console = text.into();
    }

    /// Returns every call made so far.
    #[must_use]
    pub fn calls(&self) -> Vec<InstanceApiCall> {
        lock(&self.state).calls.clone()
    }

    /// Returns the id lists passed to `terminate_instances`.
    #[must_use]
    pub fn terminations(&self) -> Vec<Vec<String>> {
        lock(&self.state)
            .calls
            .iter()
            .filter_map(|call| match call {
                InstanceApiCall::Terminate(ids) => Some(ids.clone()),
                _ => None,
            })
            .collect()
    }

    fn note(&self, state: &mut InstanceState, call: InstanceApiCall, entry: String) {
        state.calls.push(call);
        if let Some(log) = &self.log {
            log.record(entry);
        }
    }
}

fn scripted_failure(operation: &str) -> BatchApiError {
    BatchApiError::Rejected {
        operation: operation.to_owned(),
        message: String::from("nothing scripted"),
    }
}

impl InstanceApi for FakeInstanceApi {
    fn run_instances(&self, spec: &InstanceSpec) -> Result<Vec<InstanceRecord>, BatchApiError> {
        let mut state = lock(&self.state);
        self.note(
            &mut state,
            InstanceApiCall::Run(spec.clone()),
            format!("batch.run:{}", spec.count),
        );
        let result = state
            .run_results
            .pop_front()
            .unwrap_or_else(|| Err(scripted_failure("run-instances")));
        if let Ok(records) = &result {
            state.known.extend(records.iter().cloned());
        }
        result
    }

    fn describe_instances(
        &self,
        filter: &InstanceFilter,
    ) -> Result<Vec<InstanceRecord>, BatchApiError> {
        let mut state = lock(&self.state);
        self.note(
            &mut state,
            InstanceApiCall::Describe(filter.clone()),
            String::from("batch.describe"),
        );
        if let Some(result) = state.describe_results.pop_front() {
            return result;
        }

        let tagged = filter
            .job_name
            .as_ref()
            .map(|job| state.tagged.get(job).cloned().unwrap_or_default());
        Ok(state
            .known
            .iter()
            .filter(|record| !state.terminated.contains(&record.id))
            .filter(|record| tagged.as_ref().is_none_or(|ids| ids.contains(&record.id)))
            .filter(|record| {
                filter.instance_ids.is_empty() || filter.instance_ids.contains(&record.id)
            })
            .cloned()
            .collect())
    }

    fn terminate_instances(&self, ids: &[String]) -> Result<(), BatchApiError> {
        let mut state = lock(&self.state);
        self.note(
            &mut state,
            InstanceApiCall::Terminate(ids.to_vec()),
            format!("batch.terminate:{}", ids.join(",")),
        );
        if let Some(err) = state.terminate_error.clone() {
            return Err(err);
        }
        state.terminated.extend(ids.iter().cloned());
        Ok(())
    }

    fn create_tags(
        &self,
        ids: &[String],
        tags: &BTreeMap<String, String>,
    ) -> Result<(), BatchApiError> {
        let mut state = lock(&self.state);
        self.note(
            &mut state,
            InstanceApiCall::Tag {
                ids: ids.to_vec(),
                tags: tags.clone(),
            },
            String::from("batch.tag"),
        );
        if let Some(err) = state.tag_error.clone() {
            return Err(err);
        }
        if let Some(job) = tags.get(crate::batch::JOB_NAME_TAG) {
            state
                .tagged
                .entry(job.clone())
                .or_default()
                .extend(ids.iter().cloned());
        }
        Ok(())
    }

    fn console_output(&self, id: &str) -> Result<String, BatchApiError> {
        let mut state = lock(&self.state);
        self.note(
            &mut state,
            InstanceApiCall::Console(id.to_owned()),
            format!("batch.console:{id}"),
        );
        Ok(state.console.clone())
    }
}

/// Calls observed by [`FakeDomainApi`], keyed by domain name.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DomainCall {
    /// `verify_state`.
    Verify(String),
    /// `start`.
    Start(String),
    /// `stop`.
    Stop(String),
}

#[derive(Debug, Default)]
struct DomainFakeState {
    running: BTreeMap<String, bool>,
    failing_starts: BTreeSet<String>,
    failing_stops: BTreeSet<String>,
    calls: Vec<DomainCall>,
}

/// In-memory [`DomainApi`] tracking a running flag per domain name.
#[derive(Clone, Debug, Default)]
pub struct FakeDomainApi {
    state: Arc<Mutex<DomainFakeState>>,
    log: Option<CallLog>,
}

impl FakeDomainApi {
    /// Creates an API with no known domains; unknown domains are stopped.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a domain and whether it is running.
    #[must_use]
    pub fn with_domain(self, name: &str, running: bool) -> Self {
        lock(&self.state).running.insert(name.to_owned(), running);
        self
    }

    /// Records calls into `log` as `domain.<operation>:<name>` entries.
    #[must_use]
    pub fn with_log(mut self, log: CallLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Makes starting `name` fail.
    pub fn fail_start(&self, name: &str) {
        lock(&self.state).failing_starts.insert(name.to_owned());
    }

    /// Makes stopping `name` fail.
    pub fn fail_stop(&self, name: &str) {
        lock(&self.state).failing_stops.insert(name.to_owned());
    }

    /// Returns every call made so far.
    #[must_use]
    pub fn calls(&self) -> Vec<DomainCall> {
        lock(&self.state).calls.clone()
    }

    /// Names passed to `start`, in call order.
    #[must_use]
    pub fn starts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                DomainCall::Start(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    /// Names passed to `stop`, in call order.
    #[must_use]
    pub fn stops(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                DomainCall::Stop(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    fn note(&self, call: DomainCall, entry: String) -> MutexGuard<'_, DomainFakeState> {
        let mut state = lock(&self.state);
        state.calls.push(call);
        if let Some(log) = &self.log {
            log.record(entry);
        }
        state
    }

    fn transition(&self, domain: &DomainRef, running: bool) -> Result<String, DomainError> {
        let (call, entry) = if running {
            (DomainCall::Start(domain.name.clone()), format!("domain.start:{}", domain.name))
        } else {
            (DomainCall::Stop(domain.name.clone()), format!("domain.stop:{}", domain.name))
        };
        let mut state = self.note(call, entry);
        let failing = if running {
            &state.failing_starts
        } else {
            &state.failing_stops
        };
        if failing.contains(&domain.name) {
            return Err(DomainError::Api {
                message: format!("simulated failure for {}", domain.name),
            });
        }
        state.running.insert(domain.name.clone(), running);
        let target = if running {
            DomainState::Running
        } else {
            DomainState::ShutOff
        };
        Ok(format!("{} is now {target}", domain.name))
    }
}

impl DomainApi for FakeDomainApi {
    fn verify_state<'a>(
        &'a self,
        domain: &'a DomainRef,
        state: DomainState,
    ) -> DomainFuture<'a, bool> {
        let guard = self.note(
            DomainCall::Verify(domain.name.clone()),
            format!("domain.verify:{}", domain.name),
        );
        let running = guard.running.get(&domain.name).copied().unwrap_or(false);
        drop(guard);
        let matches = running == (state == DomainState::Running);
        Box::pin(async move { Ok(matches) })
    }

    fn start<'a>(&'a self, domain: &'a DomainRef) -> DomainFuture<'a, String> {
        let result = self.transition(domain, true);
        Box::pin(async move { result })
    }

    fn stop<'a>(&'a self, domain: &'a DomainRef) -> DomainFuture<'a, String> {
        let result = self.transition(domain, false);
        Box::pin(async move { result })
    }
}

/// Builds a status whose machines report `(id, address, agent version)`
/// and the `started` state.
#[must_use]
pub fn status_of(machines: &[(&str, &str, &str)]) -> Status {
    Status {
        machines: machines
            .iter()
            .map(|(id, address, version)| {
                (
                    (*id).to_owned(),
                    MachineStatus {
                        dns_name: Some((*address).to_owned()),
                        agent_version: Some((*version).to_owned()),
                        agent_state: Some(String::from("started")),
                    },
                )
            })
            .collect(),
        services: serde_json::Value::Null,
    }
}

/// Calls observed by [`RecordingControlPlane`]; environment names are
/// recorded as seen at call time.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ControlCall {
    /// `bootstrap`.
    Bootstrap {
        /// Environment name.
        env: String,
        /// Whether tools were uploaded.
        upload_tools: bool,
        /// Temporary home used.
        work_home: Utf8PathBuf,
    },
    /// `destroy_environment`.
    DestroyEnvironment(String),
    /// `get_status`.
    GetStatus(String),
    /// `juju`.
    Juju {
        /// Environment name.
        env: String,
        /// Client command.
        command: String,
        /// Command arguments.
        args: Vec<String>,
    },
    /// `deployer`.
    Deployer {
        /// Environment name.
        env: String,
        /// Bundle path.
        bundle: String,
    },
    /// `upgrade_juju`.
    UpgradeJuju(String),
    /// `set_testing_tools_metadata_url`.
    SetTestingToolsMetadataUrl(String),
    /// `matching_agent_version`.
    MatchingAgentVersion,
    /// `wait_for_version`.
    WaitForVersion {
        /// Environment name.
        env: String,
        /// Awaited version.
        version: String,
    },
    /// `wait_for_started`.
    WaitForStarted(String),
}

#[derive(Debug, Default)]
struct ControlState {
    calls: Vec<ControlCall>,
    statuses: VecDeque<Status>,
    default_status: Status,
    client_version: String,
    failing: BTreeSet<String>,
    write_descriptor: bool,
}

/// In-memory [`ControlPlane`] that records calls and answers from scripted
/// state.
///
/// Status requests pop queued statuses and then repeat the default status.
/// Operations named with [`RecordingControlPlane::fail`] return a command
/// failure. `juju` commands can be failed by name with the `juju:` prefix,
/// e.g. `juju:add-machine`.
#[derive(Clone, Debug)]
pub struct RecordingControlPlane {
    state: Arc<Mutex<ControlState>>,
    log: Option<CallLog>,
}

impl Default for RecordingControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingControlPlane {
    /// Creates a client reporting version `1.20.11` and an empty status.
    #[must_use]
    pub fn new() -> Self {
        let state = ControlState {
            client_version: String::from("1.20.11"),
            ..ControlState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            log: None,
        }
    }

    /// Records calls into `log` as `control.<operation>` entries.
    #[must_use]
    pub fn with_log(mut self, log: CallLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Sets the status returned once the queue is empty.
    #[must_use]
    pub fn with_status(self, status: Status) -> Self {
        lock(&self.state).default_status = status;
        self
    }

    /// Sets the version reported by `matching_agent_version`.
    #[must_use]
    pub fn with_client_version(self, version: &str) -> Self {
        lock(&self.state).client_version = version.to_owned();
        self
    }

    /// Makes bootstrap write a descriptor into the temporary home, as the
    /// real client does.
    #[must_use]
    pub fn writing_descriptor(self) -> Self {
        lock(&self.state).write_descriptor = true;
        self
    }

    /// Queues a status for the next status request.
    pub fn push_status(&self, status: Status) {
        lock(&self.state).statuses.push_back(status);
    }

    /// Makes `operation` fail, e.g. `bootstrap`, `destroy_environment`,
    /// `get_status`, `wait_for_version` or `juju:add-machine`.
    pub fn fail(&self, operation: &str) {
        lock(&self.state).failing.insert(operation.to_owned());
    }

    /// Returns every call made so far.
    #[must_use]
    pub fn calls(&self) -> Vec<ControlCall> {
        lock(&self.state).calls.clone()
    }

    /// Returns `(command, args)` of every `juju` call.
    #[must_use]
    pub fn juju_commands(&self) -> Vec<(String, Vec<String>)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ControlCall::Juju { command, args, .. } => Some((command, args)),
                _ => None,
            })
            .collect()
    }

    /// Number of recorded calls matching `predicate`.
    #[must_use]
    pub fn count(&self, predicate: impl Fn(&ControlCall) -> bool) -> usize {
        lock(&self.state)
            .calls
            .iter()
            .filter(|call| predicate(*call))
            .count()
    }

    fn record(&self, call: ControlCall, operation: &str) -> Result<(), ControlPlaneError> {
        let mut state = lock(&self.state);
        state.calls.push(call);
        if let Some(log) = &self.log {
            log.record(format!("control.{operation}"));
        }
        if state.failing.contains(operation) {
            return Err(ControlPlaneError::Command(CommandError::Failure {
                program: String::from("juju"),
                status: Some(1),
                status_text: String::from("1"),
                stderr: format!("simulated {operation} failure"),
            }));
        }
        Ok(())
    }

    fn next_status(&self) -> Status {
        let mut state = lock(&self.state);
        state
            .statuses
            .pop_front()
            .unwrap_or_else(|| state.default_status.clone())
    }

    fn write_descriptor(&self, env: &Environment, work_home: &Utf8Path) {
        if !lock(&self.state).write_descriptor {
            return;
        }
        let dir = work_home.join("environments");
        std::fs::create_dir_all(&dir)
            .and_then(|()| std::fs::write(dir.join(format!("{}.jenv", env.name)), "bootstrap-host: test\n"))
            .unwrap_or_else(|err| panic!("write descriptor in {dir}: {err}"));
    }
}

fn ready<'a, T: Send + 'a>(result: Result<T, ControlPlaneError>) -> ControlFuture<'a, T> {
    Box::pin(async move { result })
}

impl ControlPlane for RecordingControlPlane {
    fn bootstrap<'a>(
        &'a self,
        env: &'a Environment,
        upload_tools: bool,
        work_home: &'a Utf8Path,
    ) -> ControlFuture<'a, ()> {
        let result = self.record(
            ControlCall::Bootstrap {
                env: env.name.clone(),
                upload_tools,
                work_home: work_home.to_path_buf(),
            },
            "bootstrap",
        );
        if result.is_ok() {
            self.write_descriptor(env, work_home);
        }
        ready(result)
    }

    fn destroy_environment<'a>(&'a self, env: &'a Environment) -> ControlFuture<'a, ()> {
        ready(self.record(
            ControlCall::DestroyEnvironment(env.name.clone()),
            "destroy_environment",
        ))
    }

    fn get_status<'a>(
        &'a self,
        env: &'a Environment,
        _timeout: Duration,
    ) -> ControlFuture<'a, Status> {
        let result = self
            .record(ControlCall::GetStatus(env.name.clone()), "get_status")
            .map(|()| self.next_status());
        ready(result)
    }

    fn juju<'a>(
        &'a self,
        env: &'a Environment,
        command: &'a str,
        args: &'a [String],
    ) -> ControlFuture<'a, String> {
        let result = self
            .record(
                ControlCall::Juju {
                    env: env.name.clone(),
                    command: command.to_owned(),
                    args: args.to_vec(),
                },
                &format!("juju:{command}"),
            )
            .map(|()| String::new());
        ready(result)
    }

    fn deployer<'a>(&'a self, env: &'a Environment, bundle: &'a str) -> ControlFuture<'a, ()> {
        ready(self.record(
            ControlCall::Deployer {
                env: env.name.clone(),
                bundle: bundle.to_owned(),
            },
            "deployer",
        ))
    }

    fn upgrade_juju<'a>(&'a self, env: &'a Environment) -> ControlFuture<'a, ()> {
        ready(self.record(ControlCall::UpgradeJuju(env.name.clone()), "upgrade_juju"))
    }

    fn set_testing_tools_metadata_url<'a>(
        &'a self,
        env: &'a Environment,
    ) -> ControlFuture<'a, ()> {
        ready(self.record(
            ControlCall::SetTestingToolsMetadataUrl(env.name.clone()),
            "set_testing_tools_metadata_url",
        ))
    }

    fn matching_agent_version(&self) -> ControlFuture<'_, String> {
        let result = self
            .record(ControlCall::MatchingAgentVersion, "matching_agent_version")
            .map(|()| lock(&self.state).client_version.clone());
        ready(result)
    }

    fn wait_for_version<'a>(
        &'a self,
        env: &'a Environment,
        version: &'a str,
        _timeout: Duration,
    ) -> ControlFuture<'a, ()> {
        ready(self.record(
            ControlCall::WaitForVersion {
                env: env.name.clone(),
                version: version.to_owned(),
            },
            "wait_for_version",
        ))
    }

    fn wait_for_started<'a>(
        &'a self,
        env: &'a Environment,
        _timeout: Duration,
    ) -> ControlFuture<'a, Status> {
        let result = self
            .record(ControlCall::WaitForStarted(env.name.clone()), "wait_for_started")
            .map(|()| self.next_status());
        ready(result)
    }
}

/// [`PortCheck`] that always reports the same state and counts attempts.
#[derive(Clone, Debug)]
pub struct StaticPortCheck {
    open: bool,
    attempts: Arc<AtomicU32>,
    hosts: Arc<Mutex<Vec<(String, u16)>>>,
}

impl StaticPortCheck {
    /// Check that always connects.
    #[must_use]
    pub fn open() -> Self {
        Self::with_state(true)
    }

    /// Check that never connects.
    #[must_use]
    pub fn closed() -> Self {
        Self::with_state(false)
    }

    fn with_state(open: bool) -> Self {
        Self {
            open,
            attempts: Arc::new(AtomicU32::new(0)),
            hosts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Number of checks made.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Distinct `(host, port)` pairs checked, in first-check order.
    #[must_use]
    pub fn checked(&self) -> Vec<(String, u16)> {
        let mut seen = Vec::new();
        for pair in lock(&self.hosts).iter() {
            if !seen.contains(pair) {
                seen.push(pair.clone());
            }
        }
        seen
    }
}

impl PortCheck for StaticPortCheck {
    fn is_open<'a>(&'a self, host: &'a str, port: u16, _limit: Duration) -> CheckFuture<'a> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        lock(&self.hosts).push((host.to_owned(), port));
        let open = self.open;
        Box::pin(async move { open })
    }
}

/// One observed workload run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WorkloadRun {
    /// Environment name at call time.
    pub env: String,
    /// Bootstrap host passed in.
    pub bootstrap_host: String,
}

/// [`Workload`] that records its runs and optionally fails.
#[derive(Clone, Debug, Default)]
pub struct ScriptedWorkload {
    runs: Arc<Mutex<Vec<WorkloadRun>>>,
    failure: Option<String>,
    log: Option<CallLog>,
}

impl ScriptedWorkload {
    /// Workload that succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Workload that fails with `message`.
    #[must_use]
    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_owned()),
            ..Self::default()
        }
    }

    /// Records runs into `log` as `workload.run` entries.
    #[must_use]
    pub fn with_log(mut self, log: CallLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Runs observed so far.
    #[must_use]
    pub fn runs(&self) -> Vec<WorkloadRun> {
        lock(&self.runs).clone()
    }
}

impl Workload for ScriptedWorkload {
    fn run<'a>(&'a self, env: &'a Environment, bootstrap_host: &'a str) -> WorkloadFuture<'a> {
        lock(&self.runs).push(WorkloadRun {
            env: env.name.clone(),
            bootstrap_host: bootstrap_host.to_owned(),
        });
        if let Some(log) = &self.log {
            log.record("workload.run");
        }
        let result = self.failure.as_ref().map_or(Ok(()), |message| {
            Err(WorkloadError::Failed {
                message: message.clone(),
            })
        });
        Box::pin(async move { result })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets (`Some`) or removes (`None`) environment variables while holding
    /// a global mutex.
    pub async fn set_vars(pairs: &[(&str, Option<&str>)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe {
                match value {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
