//! [`DomainApi`] over the `virsh` command-line tool.

use std::ffi::OsString;
use std::time::Duration;

use tokio::time::sleep;

use super::{DomainApi, DomainError, DomainFuture, DomainRef, DomainState};
use crate::command::{CommandEnv, CommandOutput, CommandRunner};
use crate::poll::Deadline;

const SETTLE_DELAY: Duration = Duration::from_secs(30);
const STATE_TIMEOUT: Duration = Duration::from_secs(120);
const POLL_INTERVAL: Duration = Duration::from_secs(2);

const ALREADY_ACTIVE: &str = "already active";
const NOT_RUNNING: &str = "domain is not running";

/// Drives libvirt domains through `virsh -c <uri> ...`.
#[derive(Clone, Debug)]
pub struct VirshClient<R> {
    runner: R,
    virsh_bin: String,
    settle_delay: Duration,
    state_timeout: Duration,
    poll_interval: Duration,
}

impl<R: CommandRunner> VirshClient<R> {
    /// Creates a client invoking `virsh_bin`.
    #[must_use]
    pub fn new(runner: R, virsh_bin: impl Into<String>) -> Self {
        Self {
            runner,
            virsh_bin: virsh_bin.into(),
            settle_delay: SETTLE_DELAY,
            state_timeout: STATE_TIMEOUT,
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Overrides the pause between a start/stop request and the first state
    /// check.
    #[must_use]
    pub const fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Overrides how long to wait for the requested state.
    #[must_use]
    pub const fn with_state_timeout(mut self, limit: Duration) -> Self {
        self.state_timeout = limit;
        self
    }

    /// Overrides the delay between state checks.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn virsh(&self, domain: &DomainRef, action: &str) -> Result<CommandOutput, DomainError> {
        let args = [
            "-c",
            domain.locator.as_str(),
            action,
            domain.name.as_str(),
        ]
        .into_iter()
        .map(OsString::from)
        .collect::<Vec<_>>();
        Ok(self
            .runner
            .run(&self.virsh_bin, &args, &CommandEnv::new())?)
    }

    fn domstate(&self, domain: &DomainRef) -> Result<String, DomainError> {
        let output = self.virsh(domain, "domstate")?.into_success(&self.virsh_bin)?;
        Ok(output.stdout.trim().to_owned())
    }

    async fn transition(
        &self,
        domain: &DomainRef,
        action: &str,
        no_op_marker: &str,
        target: DomainState,
    ) -> Result<String, DomainError> {
        let output = self.virsh(domain, action)?;
        if output.combined().contains(no_op_marker) {
            return Ok(format!("{} is already {target}", domain.name));
        }
        output.into_success(&self.virsh_bin)?;

        sleep(self.settle_delay).await;
        let mut deadline = Deadline::new(self.state_timeout, self.poll_interval);
        while deadline.tick().await.is_some() {
            if self.domstate(domain)? == target.as_str() {
                return Ok(format!("{} is now {target}", domain.name));
            }
        }

        Err(DomainError::StateTimeout {
            name: domain.name.clone(),
            state: target,
        })
    }
}

impl<R: CommandRunner> DomainApi for VirshClient<R> {
    fn verify_state<'a>(
        &'a self,
        domain: &'a DomainRef,
        state: DomainState,
    ) -> DomainFuture<'a, bool> {
        Box::pin(async move { Ok(self.domstate(domain)? == state.as_str()) })
    }

    fn start<'a>(&'a self, domain: &'a DomainRef) -> DomainFuture<'a, String> {
        Box::pin(self.transition(domain, "start", ALREADY_ACTIVE, DomainState::Running))
    }

    fn stop<'a>(&'a self, domain: &'a DomainRef) -> DomainFuture<'a, String> {
        Box::pin(self.transition(domain, "shutdown", NOT_RUNNING, DomainState::ShutOff))
    }
}
