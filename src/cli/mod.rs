//! Command-line interface definitions for the `stackrun` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Args, Parser};

/// Top-level CLI for the `stackrun` binary.
#[derive(Debug, Parser)]
#[command(
    name = "stackrun",
    about = "Bring up a throwaway juju environment, run a workload against it, and tear it down",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Run a local command against a freshly bootstrapped environment.
    #[command(
        name = "deploy",
        about = "Bootstrap an environment and run a local command against it"
    )]
    Deploy(DeployCommand),
    /// Deploy a bundle with juju-deployer against a fresh environment.
    #[command(
        name = "deployer",
        about = "Bootstrap an environment and deploy a bundle with juju-deployer"
    )]
    Deployer(DeployerCommand),
}

/// Options shared by every session-running subcommand.
#[derive(Debug, Args)]
pub(crate) struct SessionArgs {
    /// Name of the base environment in `environments.yaml`.
    pub(crate) env: String,
    /// Directory receiving logs after a failure.
    pub(crate) logs: String,
    /// Job name; used as the environment name and the instance tag.
    pub(crate) job_name: String,
    /// Default series for new machines.
    #[arg(long)]
    pub(crate) series: Option<String>,
    /// URL to use for retrieving agent binaries.
    #[arg(long, value_name = "URL")]
    pub(crate) agent_url: Option<String>,
    /// Log at debug level and pass `--debug` to juju.
    #[arg(long, short = 'v')]
    pub(crate) verbose: bool,
}

/// Arguments for the `stackrun deploy` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct DeployCommand {
    #[command(flatten)]
    pub(crate) session: SessionArgs,
    /// Existing host to bootstrap onto instead of provisioning instances.
    #[arg(long, value_name = "HOST")]
    pub(crate) bootstrap_host: Option<String>,
    /// Machine to add, or a `name@uri` domain for virtualized
    /// environments. May be repeated.
    #[arg(long = "machine", value_name = "MACHINE")]
    pub(crate) machines: Vec<String>,
    /// Keep the environment and its machines when the run ends.
    #[arg(long)]
    pub(crate) keep_env: bool,
    /// Upload locally built agent binaries during bootstrap.
    #[arg(long)]
    pub(crate) upload_tools: bool,
    /// Upgrade the environment to the client's version once the workload
    /// succeeds.
    #[arg(long)]
    pub(crate) upgrade: bool,
    /// Workload command run locally once the environment is ready (use --
    /// to separate flags).
    #[arg(required = true, trailing_var_arg = true)]
    pub(crate) command: Vec<String>,
}

/// Arguments for the `stackrun deployer` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct DeployerCommand {
    /// URL or path to the bundle.
    pub(crate) bundle: String,
    #[command(flatten)]
    pub(crate) session: SessionArgs,
}
