//! Failure diagnostics harvesting.
//!
//! When a session fails, [`DiagnosticsCollector`] gathers logs from every
//! machine it can find into per-machine directories under the log
//! directory, saves the bootstrap instance's console output, and keeps a
//! copy of the bootstrap descriptor. Every step is best-effort: failures
//! are logged and recorded in the returned [`DiagnosticsReport`], never
//! raised.

mod archive;

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;

use crate::batch::{BatchApiError, InstanceApi};
use crate::command::{CommandEnv, CommandError, CommandRunner};
use crate::control::ControlPlane;
use crate::environment::Environment;
use crate::outcome::BestEffort;
use crate::port::{PortCheck, PortState, PortTimeoutError, PortWaiter, SSH_PORT, TcpCheck};
use crate::remote::RemoteAccess;

pub use archive::compress_logs;

/// Remote log files retrieved from each machine, relative to `/var/log`.
pub const REMOTE_LOG_PATTERNS: [&str; 2] = ["cloud-init*.log", "juju/*.log"];

/// Directory holding local container templates.
pub const DEFAULT_LXC_ROOT: &str = "/var/lib/juju/containers";

const STATUS_TIMEOUT: Duration = Duration::from_secs(60);
const REMOTE_TIMEOUT: Duration = Duration::from_secs(300);
const REACHABILITY_TIMEOUT: Duration = Duration::from_secs(60);
const CONSOLE_FILE: &str = "console.log";
const BOOTSTRAP_MACHINE: &str = "0";

/// Errors raised by individual collection steps.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DiagnosticsError {
    /// Raised when a host does not accept SSH connections.
    #[error("could not collect logs: {0}")]
    Unreachable(#[from] PortTimeoutError),
    /// Raised when a copy or permission command fails.
    #[error(transparent)]
    Command(#[from] CommandError),
    /// Raised when console output cannot be fetched.
    #[error("failed to fetch console output: {0}")]
    Console(#[from] BatchApiError),
    /// Raised when local files cannot be read or written.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path involved.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
}

impl DiagnosticsError {
    fn io(path: &Utf8Path, err: &io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

/// Where and what to collect after a failure.
#[derive(Clone, Copy, Debug)]
pub struct DumpRequest<'a> {
    /// Bootstrap host; overrides machine 0's reported address.
    pub bootstrap_host: Option<&'a str>,
    /// Root directory for collected artifacts.
    pub log_dir: &'a Utf8Path,
    /// Instance id of the bootstrap host, for console output.
    pub host_id: Option<&'a str>,
    /// Bootstrap descriptor to keep alongside the logs.
    pub descriptor: Option<&'a Utf8Path>,
}

/// Outcome of every collection step, in execution order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DiagnosticsReport {
    /// Recorded steps.
    pub steps: Vec<BestEffort>,
}

impl DiagnosticsReport {
    /// Steps that failed.
    pub fn failures(&self) -> impl Iterator<Item = &BestEffort> {
        self.steps.iter().filter(|step| step.is_failed())
    }

    /// Returns `true` when a step with this description was recorded.
    #[must_use]
    pub fn contains(&self, step: &str) -> bool {
        self.steps.iter().any(|entry| entry.step() == step)
    }
}

/// Collects logs, console output and descriptors after a failure.
#[derive(Clone, Debug)]
pub struct DiagnosticsCollector<R, P = TcpCheck> {
    runner: R,
    remote: RemoteAccess<R>,
    waiter: PortWaiter<P>,
    lxc_root: Utf8PathBuf,
    status_timeout: Duration,
    remote_timeout: Duration,
    reachability_timeout: Duration,
}

impl<R: CommandRunner, P: PortCheck> DiagnosticsCollector<R, P> {
    /// Creates a collector. `runner` executes local copy commands; `remote`
    /// reaches the machines.
    #[must_use]
    pub fn new(runner: R, remote: RemoteAccess<R>, waiter: PortWaiter<P>) -> Self {
        Self {
            runner,
            remote,
            waiter,
            lxc_root: Utf8PathBuf::from(DEFAULT_LXC_ROOT),
            status_timeout: STATUS_TIMEOUT,
            remote_timeout: REMOTE_TIMEOUT,
            reachability_timeout: REACHABILITY_TIMEOUT,
        }
    }

    /// Overrides where local container template logs are searched for.
    #[must_use]
    pub fn with_lxc_root(mut self, root: impl Into<Utf8PathBuf>) -> Self {
        self.lxc_root = root.into();
        self
    }

    /// Overrides the SSH reachability timeout checked before copying.
    #[must_use]
    pub const fn with_reachability_timeout(mut self, limit: Duration) -> Self {
        self.reachability_timeout = limit;
        self
    }

    /// Collects everything available for `env`: logs from every machine
    /// with an address, console output of the bootstrap instance, and the
    /// bootstrap descriptor.
    pub async fn dump_env_logs<C>(
        &self,
        client: &C,
        env: &Environment,
        console: Option<&dyn InstanceApi>,
        request: &DumpRequest<'_>,
    ) -> DiagnosticsReport
    where
        C: ControlPlane + ?Sized,
    {
        let mut report = DiagnosticsReport::default();
        let mut machines = match client.get_status(env, self.status_timeout).await {
            Ok(status) => status.machine_addresses(),
            Err(err) => {
                report
                    .steps
                    .push(BestEffort::failed("status for log collection", err));
                BTreeMap::new()
            }
        };
        if let Some(host) = request.bootstrap_host {
            machines.insert(BOOTSTRAP_MACHINE.to_owned(), host.to_owned());
        }

        for (machine_id, address) in &machines {
            tracing::info!(machine = %machine_id, host = %address, "retrieving logs");
            let machine_dir = request.log_dir.join(machine_id);
            let local_state_server = env.is_local() && machine_id == BOOTSTRAP_MACHINE;
            let step = format!("logs for machine-{machine_id}");
            let result = match create_dir(&machine_dir) {
                Ok(()) => {
                    self.dump_logs(env, address, &machine_dir, local_state_server)
                        .await
                }
                Err(err) => Err(err),
            };
            report.steps.push(BestEffort::from_result(step, result));
        }

        if let (Some(api), Some(host_id)) = (console, request.host_id) {
            report.steps.push(BestEffort::from_result(
                format!("console output of {host_id}"),
                dump_console(api, host_id, request.log_dir),
            ));
        }
        if let Some(descriptor) = request.descriptor {
            report.steps.push(BestEffort::from_result(
                "retain bootstrap descriptor",
                retain_descriptor(descriptor, request.log_dir),
            ));
        }
        report
    }

    /// Collects logs from the bootstrap host after a failed bootstrap, when
    /// no status is available.
    pub async fn dump_bootstrap_failure(
        &self,
        env: &Environment,
        host: &str,
        console: Option<&dyn InstanceApi>,
        request: &DumpRequest<'_>,
    ) -> DiagnosticsReport {
        let mut report = DiagnosticsReport::default();
        report.steps.push(BestEffort::from_result(
            format!("logs for {host}"),
            self.dump_logs(env, host, request.log_dir, false).await,
        ));
        if let (Some(api), Some(host_id)) = (console, request.host_id) {
            report.steps.push(BestEffort::from_result(
                format!("console output of {host_id}"),
                dump_console(api, host_id, request.log_dir),
            ));
        }
        report
    }

    /// Copies one machine's logs into `directory` and compresses them.
    ///
    /// # Errors
    ///
    /// Returns [`DiagnosticsError`] when copying or compression fails;
    /// whatever was copied before a copy failure is still compressed.
    pub async fn dump_logs(
        &self,
        env: &Environment,
        host: &str,
        directory: &Utf8Path,
        local_state_server: bool,
    ) -> Result<usize, DiagnosticsError> {
        let copied = if local_state_server {
            self.copy_local_logs(env, directory)
        } else {
            self.copy_remote_logs(host, directory).await
        };
        let compressed = compress_logs(directory)?;
        copied.map(|()| compressed)
    }

    async fn copy_remote_logs(&self, host: &str, directory: &Utf8Path) -> Result<(), DiagnosticsError> {
        self.waiter
            .wait_for_port(host, SSH_PORT, self.reachability_timeout, PortState::Open)
            .await
            .inspect_err(|_| tracing::warn!(host, "could not dump logs because port 22 was closed"))?;

        if let Err(err) = self.remote.ssh(host, "sudo chmod go+r /var/log/juju/*", self.remote_timeout) {
            tracing::warn!(host, error = %err, "could not change the permission of the juju logs");
        }

        let source = format!("/var/log/{{{}}}", REMOTE_LOG_PATTERNS.join(","));
        self.remote
            .fetch(host, &source, directory, self.remote_timeout)
            .inspect_err(|err| tracing::warn!(host, error = %err, "could not retrieve some or all logs"))?;
        Ok(())
    }

    fn copy_local_logs(&self, env: &Environment, directory: &Utf8Path) -> Result<(), DiagnosticsError> {
        let root = env.local_root();
        let mut files = vec![root.join("cloud-init-output.log")];
        files.extend(list_logs(&root.join("log"))?);
        for template in list_dirs(&self.lxc_root, |name| {
            name.starts_with("juju-") && name.ends_with("-lxc-template")
        })? {
            files.extend(list_logs(&template)?);
        }

        let names = files.iter().map(|path| OsString::from(path.as_str()));
        let mut chmod = vec![OsString::from("chmod"), OsString::from("go+r")];
        chmod.extend(names.clone());
        self.local("sudo", &chmod)?;

        let mut copy = names.collect::<Vec<_>>();
        copy.push(OsString::from(directory.as_str()));
        self.local("cp", &copy)
    }

    fn local(&self, program: &str, args: &[OsString]) -> Result<(), DiagnosticsError> {
        self.runner
            .run(program, args, &CommandEnv::new())?
            .into_success(program)?;
        Ok(())
    }
}

fn create_dir(path: &Utf8Path) -> Result<(), DiagnosticsError> {
    Dir::create_ambient_dir_all(path, ambient_authority()).map_err(|err| DiagnosticsError::io(path, &err))
}

fn open_dir(path: &Utf8Path) -> Result<Option<Dir>, DiagnosticsError> {
    match Dir::open_ambient_dir(path, ambient_authority()) {
        Ok(dir) => Ok(Some(dir)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(DiagnosticsError::io(path, &err)),
    }
}

fn entries(path: &Utf8Path) -> Result<Vec<(String, bool)>, DiagnosticsError> {
    let Some(dir) = open_dir(path)? else {
        return Ok(Vec::new());
    };
    let mut found = Vec::new();
    for item in dir.entries().map_err(|err| DiagnosticsError::io(path, &err))? {
        let entry = item.map_err(|err| DiagnosticsError::io(path, &err))?;
        let name = entry.file_name().map_err(|err| DiagnosticsError::io(path, &err))?;
        let is_dir = entry
            .file_type()
            .map_err(|err| DiagnosticsError::io(path, &err))?
            .is_dir();
        found.push((name, is_dir));
    }
    found.sort();
    Ok(found)
}

fn list_logs(path: &Utf8Path) -> Result<Vec<Utf8PathBuf>, DiagnosticsError> {
    Ok(entries(path)?
        .into_iter()
        .filter(|(name, is_dir)| !is_dir && name.ends_with(".log"))
        .map(|(name, _)| path.join(name))
        .collect())
}

fn list_dirs(
    path: &Utf8Path,
    select: impl Fn(&str) -> bool,
) -> Result<Vec<Utf8PathBuf>, DiagnosticsError> {
    Ok(entries(path)?
        .into_iter()
        .filter(|(name, is_dir)| *is_dir && select(name))
        .map(|(name, _)| path.join(name))
        .collect())
}

/// Writes the console output of instance `host_id` to `console.log`.
///
/// # Errors
///
/// Returns [`DiagnosticsError`] when the output cannot be fetched or written.
pub fn dump_console(
    api: &dyn InstanceApi,
    host_id: &str,
    directory: &Utf8Path,
) -> Result<(), DiagnosticsError> {
    let output = api.console_output(host_id)?;
    let dir = Dir::open_ambient_dir(directory, ambient_authority())
        .map_err(|err| DiagnosticsError::io(directory, &err))?;
    dir.write(CONSOLE_FILE, output)
        .map_err(|err| DiagnosticsError::io(&directory.join(CONSOLE_FILE), &err))
}

/// Copies the bootstrap descriptor into `directory`.
///
/// # Errors
///
/// Returns [`DiagnosticsError::Io`] when the copy fails.
pub fn retain_descriptor(descriptor: &Utf8Path, directory: &Utf8Path) -> Result<(), DiagnosticsError> {
    let (Some(parent), Some(file_name)) = (descriptor.parent(), descriptor.file_name()) else {
        return Err(DiagnosticsError::Io {
            path: descriptor.to_path_buf(),
            message: String::from("descriptor path has no file name"),
        });
    };
    let source = Dir::open_ambient_dir(parent, ambient_authority())
        .map_err(|err| DiagnosticsError::io(parent, &err))?;
    let contents = source
        .read(file_name)
        .map_err(|err| DiagnosticsError::io(descriptor, &err))?;
    let target = Dir::open_ambient_dir(directory, ambient_authority())
        .map_err(|err| DiagnosticsError::io(directory, &err))?;
    target
        .write(file_name, contents)
        .map_err(|err| DiagnosticsError::io(&directory.join(file_name), &err))
}
