//! Control-plane client contract and its `juju` implementation.
//!
//! The orchestrator only depends on [`ControlPlane`]. Every operation takes
//! the [`Environment`] it acts on so the client itself holds no session
//! state; [`JujuCli`] threads the environment's juju home to the child
//! process explicitly.

mod juju;
mod status;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use camino::Utf8Path;
use thiserror::Error;

use crate::command::CommandError;
use crate::environment::Environment;

pub use juju::{DEFAULT_JUJU_BIN, JujuCli};
pub use status::{MachineStatus, Status, UNKNOWN};

/// Errors raised by control-plane operations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ControlPlaneError {
    /// Raised when the client command cannot run or exits non-zero.
    #[error(transparent)]
    Command(#[from] CommandError),
    /// Raised when status or version output cannot be interpreted.
    #[error("unexpected client output: {0}")]
    Status(String),
    /// Raised when a bounded wait expires.
    #[error("timed out after {seconds}s waiting for {what}")]
    Timeout {
        /// What was awaited.
        what: String,
        /// Timeout that elapsed.
        seconds: u64,
    },
}

/// Future returned by [`ControlPlane`] methods.
pub type ControlFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, ControlPlaneError>> + Send + 'a>>;

/// Client issuing high-level cluster commands against an environment.
pub trait ControlPlane: Send + Sync {
    /// Bootstraps `env` using `work_home` as the client's home directory.
    fn bootstrap<'a>(
        &'a self,
        env: &'a Environment,
        upload_tools: bool,
        work_home: &'a Utf8Path,
    ) -> ControlFuture<'a, ()>;

    /// Destroys `env` and every machine it owns.
    fn destroy_environment<'a>(&'a self, env: &'a Environment) -> ControlFuture<'a, ()>;

    /// Fetches status, retrying failed attempts for up to `timeout`.
    fn get_status<'a>(&'a self, env: &'a Environment, timeout: Duration)
    -> ControlFuture<'a, Status>;

    /// Runs an arbitrary client command and returns its standard output.
    fn juju<'a>(
        &'a self,
        env: &'a Environment,
        command: &'a str,
        args: &'a [String],
    ) -> ControlFuture<'a, String>;

    /// Deploys the bundle at `bundle`.
    fn deployer<'a>(&'a self, env: &'a Environment, bundle: &'a str) -> ControlFuture<'a, ()>;

    /// Upgrades the environment's agents to the client's version.
    fn upgrade_juju<'a>(&'a self, env: &'a Environment) -> ControlFuture<'a, ()>;

    /// Points the environment at the testing agent stream.
    fn set_testing_tools_metadata_url<'a>(&'a self, env: &'a Environment)
    -> ControlFuture<'a, ()>;

    /// Agent version matching the client binary.
    fn matching_agent_version(&self) -> ControlFuture<'_, String>;

    /// Waits until every agent reports `version`.
    fn wait_for_version<'a>(
        &'a self,
        env: &'a Environment,
        version: &'a str,
        timeout: Duration,
    ) -> ControlFuture<'a, ()>;

    /// Waits until every agent reports `started` and returns that status.
    fn wait_for_started<'a>(
        &'a self,
        env: &'a Environment,
        timeout: Duration,
    ) -> ControlFuture<'a, Status>;
}
