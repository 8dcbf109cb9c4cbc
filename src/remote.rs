//! SSH and SCP access to provisioned machines.
//!
//! Host key checking is disabled because every machine is freshly
//! provisioned, and each call runs under `timeout` so a hung connection
//! cannot stall the session.

use std::ffi::OsString;
use std::time::Duration;

use camino::Utf8Path;

use crate::command::{CommandEnv, CommandError, CommandOutput, CommandRunner, render_command};

const DEFAULT_USER: &str = "ubuntu";
const DEFAULT_KNOWN_HOSTS: &str = "/dev/null";

/// Runs commands on, and copies files from, remote hosts.
#[derive(Clone, Debug)]
pub struct RemoteAccess<R> {
    runner: R,
    ssh_bin: String,
    scp_bin: String,
    timeout_bin: String,
    user: String,
    known_hosts_file: String,
}

impl<R: CommandRunner> RemoteAccess<R> {
    /// Creates remote access using `ssh`, `scp` and `timeout` from `PATH`.
    #[must_use]
    pub fn new(runner: R) -> Self {
        Self {
            runner,
            ssh_bin: String::from("ssh"),
            scp_bin: String::from("scp"),
            timeout_bin: String::from("timeout"),
            user: DEFAULT_USER.to_owned(),
            known_hosts_file: DEFAULT_KNOWN_HOSTS.to_owned(),
        }
    }

    /// Overrides the `ssh` and `scp` binaries.
    #[must_use]
    pub fn with_binaries(mut self, ssh_bin: impl Into<String>, scp_bin: impl Into<String>) -> Self {
        self.ssh_bin = ssh_bin.into();
        self.scp_bin = scp_bin.into();
        self
    }

    /// Overrides the `timeout` binary.
    #[must_use]
    pub fn with_timeout_bin(mut self, timeout_bin: impl Into<String>) -> Self {
        self.timeout_bin = timeout_bin.into();
        self
    }

    /// Overrides the login user.
    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Overrides the known hosts file.
    #[must_use]
    pub fn with_known_hosts_file(mut self, path: impl Into<String>) -> Self {
        self.known_hosts_file = path.into();
        self
    }

    fn options(&self) -> [OsString; 4] {
        [
            OsString::from("-o"),
            OsString::from(format!("UserKnownHostsFile={}", self.known_hosts_file)),
            OsString::from("-o"),
            OsString::from("StrictHostKeyChecking=no"),
        ]
    }

    fn timed(
        &self,
        limit: Duration,
        program: &str,
        args: Vec<OsString>,
    ) -> Result<CommandOutput, CommandError> {
        let mut argv = Vec::with_capacity(args.len().saturating_add(2));
        argv.push(OsString::from(format!("{}s", limit.as_secs().max(1))));
        argv.push(OsString::from(program));
        argv.extend(args);
        tracing::debug!(command = %render_command(&self.timeout_bin, &argv), "remote");
        self.runner
            .run(&self.timeout_bin, &argv, &CommandEnv::new())?
            .into_success(program)
    }

    /// Runs `command` on `host` through `ssh`.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] when the command cannot run, exits non-zero
    /// or exceeds `limit`.
    pub fn ssh(
        &self,
        host: &str,
        command: &str,
        limit: Duration,
    ) -> Result<CommandOutput, CommandError> {
        let mut args = self.options().to_vec();
        args.push(OsString::from(format!("{}@{host}", self.user)));
        args.push(OsString::from(command));
        self.timed(limit, &self.ssh_bin, args)
    }

    /// Copies `source` (a remote path, shell patterns allowed) from `host`
    /// into `destination` with compression.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] when the copy fails or exceeds `limit`.
    pub fn fetch(
        &self,
        host: &str,
        source: &str,
        destination: &Utf8Path,
        limit: Duration,
    ) -> Result<CommandOutput, CommandError> {
        let mut args = vec![OsString::from("-C")];
        args.extend(self.options());
        args.push(OsString::from(format!("{}@{host}:{source}", self.user)));
        args.push(OsString::from(destination.as_str()));
        self.timed(limit, &self.scp_bin, args)
    }
}
