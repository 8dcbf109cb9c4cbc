//! Binary entry point for the stackrun CLI.

mod cli;

use std::io::{self, Write};
use std::process::{self, Stdio};

use clap::Parser;
use thiserror::Error;
use tokio::process::Command;
use tracing_subscriber::EnvFilter;

use stackrun::diagnostics::DiagnosticsCollector;
use stackrun::{
    BatchConfig, BatchProvisioner, CommandEnv, ConfigError, ControlPlane, Environment,
    EnvironmentError, EucaClient, HarnessConfig, JujuCli, Lifecycle, LifecycleError,
    PortWaiter, ProcessCommandRunner, ProviderKind, RemoteAccess, RemoteConfig, SessionRequest,
    VirshClient, Workload, WorkloadError, WorkloadFuture,
};

use cli::{Cli, DeployCommand, DeployerCommand, SessionArgs};

type ProcessLifecycle = Lifecycle<
    JujuCli<ProcessCommandRunner>,
    EucaClient<ProcessCommandRunner>,
    VirshClient<ProcessCommandRunner>,
    ProcessCommandRunner,
>;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Environment(#[from] EnvironmentError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

impl CliError {
    const fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "ConfigError",
            Self::Environment(_) => "EnvironmentError",
            Self::Lifecycle(err) => err.kind(),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(session_args(&cli).verbose);
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .with_writer(io::stderr)
        .init();
}

const fn session_args(cli: &Cli) -> &SessionArgs {
    match cli {
        Cli::Deploy(command) => &command.session,
        Cli::Deployer(command) => &command.session,
    }
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    match cli {
        Cli::Deploy(command) => deploy(command).await,
        Cli::Deployer(command) => deployer(command).await,
    }
}

struct Settings {
    harness: HarnessConfig,
    batch: BatchConfig,
    remote: RemoteConfig,
}

impl Settings {
    fn load() -> Result<Self, ConfigError> {
        let harness = HarnessConfig::load_without_cli_args()?;
        harness.validate()?;
        let batch = BatchConfig::load_without_cli_args()?;
        batch.validate()?;
        let remote = RemoteConfig::load_without_cli_args()?;
        remote.validate()?;
        Ok(Self {
            harness,
            batch,
            remote,
        })
    }

    fn environment(&self, name: &str) -> Result<Environment, CliError> {
        let juju_home = self.harness.resolve_juju_home()?;
        Ok(Environment::load(&juju_home, name)?)
    }

    fn lifecycle(&self, verbose: bool) -> ProcessLifecycle {
        let runner = ProcessCommandRunner;
        let control = JujuCli::new(runner, self.harness.juju_bin.as_str())
            .with_debug(verbose || self.harness.debug);
        let provisioner = BatchProvisioner::new(
            EucaClient::new(runner).with_bin_prefix(self.batch.bin_prefix.as_str()),
            self.batch.template(),
        );
        let remote = RemoteAccess::new(runner)
            .with_binaries(self.remote.ssh_bin.as_str(), self.remote.scp_bin.as_str())
            .with_timeout_bin(self.harness.timeout_bin.as_str())
            .with_user(self.remote.ssh_user.as_str())
            .with_known_hosts_file(self.remote.known_hosts_file.as_str());
        let lifecycle = Lifecycle::new(
            control,
            provisioner,
            VirshClient::new(runner, self.harness.virsh_bin.as_str()),
            DiagnosticsCollector::new(runner, remote, PortWaiter::tcp()),
            PortWaiter::tcp(),
        )
        .with_state_server_shutdown_check(self.harness.confirm_state_server_shutdown);
        match self.harness.scratch_dir.as_deref() {
            Some(dir) if !dir.trim().is_empty() => lifecycle.with_scratch_dir(dir),
            _ => lifecycle,
        }
    }
}

fn base_request(args: &SessionArgs) -> SessionRequest {
    SessionRequest {
        series: args.series.clone(),
        agent_url: args.agent_url.clone(),
        ..SessionRequest::new(args.job_name.as_str(), args.logs.as_str())
    }
}

async fn deploy(command: DeployCommand) -> Result<i32, CliError> {
    let settings = Settings::load()?;
    let environment = settings.environment(&command.session.env)?;
    if environment.provider() == ProviderKind::Manual && command.bootstrap_host.is_none() {
        settings.batch.validate_for_provisioning()?;
    }

    let request = SessionRequest {
        machines: command.machines,
        bootstrap_host: command.bootstrap_host,
        keep_environment: command.keep_env,
        upload_tools: command.upload_tools,
        upgrade: command.upgrade,
        ..base_request(&command.session)
    };
    let workload = CommandWorkload {
        command: command.command,
    };
    let lifecycle = settings.lifecycle(command.session.verbose);
    lifecycle
        .run(environment, &request, &workload)
        .await
        .into_result()?;
    Ok(0)
}

async fn deployer(command: DeployerCommand) -> Result<i32, CliError> {
    let settings = Settings::load()?;
    let environment = settings.environment(&command.session.env)?;
    let request = base_request(&command.session);
    let lifecycle = settings.lifecycle(command.session.verbose);
    let workload = DeployerWorkload {
        control: lifecycle.control(),
        bundle: command.bundle,
    };
    lifecycle
        .run(environment, &request, &workload)
        .await
        .into_result()?;
    Ok(0)
}

/// Runs a local command with the session's juju home and environment name.
#[derive(Debug)]
struct CommandWorkload {
    command: Vec<String>,
}

impl CommandWorkload {
    fn command_env(env: &Environment) -> CommandEnv {
        CommandEnv::new()
            .with("JUJU_HOME", env.juju_home.as_str())
            .with("JUJU_ENV", env.name.as_str())
    }
}

impl Workload for CommandWorkload {
    fn run<'a>(&'a self, env: &'a Environment, bootstrap_host: &'a str) -> WorkloadFuture<'a> {
        Box::pin(async move {
            let Some((program, args)) = self.command.split_first() else {
                return Err(WorkloadError::Failed {
                    message: String::from("no workload command given"),
                });
            };
            tracing::info!(program = %program, host = %bootstrap_host, "running workload");
            let status = Command::new(program)
                .args(args)
                .envs(Self::command_env(env).iter())
                .stdin(Stdio::null())
                .status()
                .await
                .map_err(|err| WorkloadError::Failed {
                    message: format!("failed to spawn {program}: {err}"),
                })?;
            if status.success() {
                Ok(())
            } else {
                Err(WorkloadError::Failed {
                    message: format!("{program} exited with {status}"),
                })
            }
        })
    }
}

/// Deploys a bundle through the control plane.
struct DeployerWorkload<'c, C> {
    control: &'c C,
    bundle: String,
}

impl<C: ControlPlane> Workload for DeployerWorkload<'_, C> {
    fn run<'a>(&'a self, env: &'a Environment, _bootstrap_host: &'a str) -> WorkloadFuture<'a> {
        Box::pin(async move {
            self.control.deployer(env, &self.bundle).await?;
            Ok(())
        })
    }
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err} ({})", err.kind()).ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use camino::Utf8PathBuf;
    use stackrun::ProvisioningError;

    fn environment(name: &str) -> Environment {
        Environment::from_config(
            name,
            BTreeMap::from([(String::from("type"), String::from("openstack"))]),
            Utf8PathBuf::from("/tmp/juju-home"),
        )
    }

    fn shell(script: &str) -> CommandWorkload {
        CommandWorkload {
            command: vec![String::from("sh"), String::from("-c"), script.to_owned()],
        }
    }

    #[test]
    fn write_error_appends_the_failure_kind() {
        let mut buf = Vec::new();
        let err = CliError::Lifecycle(LifecycleError::Provisioning(ProvisioningError::Empty));
        write_error(&mut buf, &err);
        let rendered = String::from_utf8(buf).unwrap_or_else(|err| panic!("utf8: {err}"));
        assert_eq!(
            rendered,
            "instance request returned no instances (ProvisioningError)\n"
        );
    }

    #[test]
    fn config_errors_are_reported_as_such() {
        let err = CliError::Config(ConfigError::MissingField(String::from("juju client path")));
        assert_eq!(err.kind(), "ConfigError");
    }

    #[tokio::test]
    async fn command_workload_receives_the_session_environment() {
        let workload = shell(r#"test "$JUJU_ENV" = job-1 && test "$JUJU_HOME" = /tmp/juju-home"#);

        let result = workload.run(&environment("job-1"), "10.0.0.5").await;

        assert!(result.is_ok(), "unexpected error: {result:?}");
    }

    #[tokio::test]
    async fn command_workload_reports_non_zero_exit() {
        let result = shell("exit 3").run(&environment("job-1"), "10.0.0.5").await;

        assert!(
            matches!(result, Err(WorkloadError::Failed { ref message }) if message.contains("exit status: 3")),
            "unexpected result: {result:?}"
        );
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let workload = CommandWorkload {
            command: Vec::new(),
        };

        let result = workload.run(&environment("job-1"), "10.0.0.5").await;

        assert!(matches!(result, Err(WorkloadError::Failed { .. })));
    }
}
