//! [`ControlPlane`] over the `juju` command-line client.

use std::ffi::OsString;
use std::time::Duration;

use camino::Utf8Path;

use super::{ControlFuture, ControlPlane, ControlPlaneError, Status};
use crate::command::{CommandEnv, CommandRunner, render_command};
use crate::environment::Environment;
use crate::poll::Deadline;

/// Default client binary.
pub const DEFAULT_JUJU_BIN: &str = "juju";

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const TOOLS_URL_KEY: &str = "tools-metadata-url";

/// Drives an environment through `juju <command> -e <name> ...`.
#[derive(Clone, Debug)]
pub struct JujuCli<R> {
    runner: R,
    juju_bin: String,
    debug: bool,
    poll_interval: Duration,
}

impl<R: CommandRunner> JujuCli<R> {
    /// Creates a client invoking `juju_bin`.
    #[must_use]
    pub fn new(runner: R, juju_bin: impl Into<String>) -> Self {
        Self {
            runner,
            juju_bin: juju_bin.into(),
            debug: false,
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Passes `--debug` to every command.
    #[must_use]
    pub const fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Overrides the delay between status polls.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn run(
        &self,
        home: Option<&Utf8Path>,
        command: &str,
        env_name: Option<&str>,
        args: &[String],
    ) -> Result<String, ControlPlaneError> {
        let mut argv = Vec::with_capacity(args.len().saturating_add(4));
        if self.debug {
            argv.push(OsString::from("--debug"));
        }
        argv.push(OsString::from(command));
        if let Some(name) = env_name {
            argv.push(OsString::from("-e"));
            argv.push(OsString::from(name));
        }
        argv.extend(args.iter().map(OsString::from));

        let child_env = home.map_or_else(CommandEnv::new, |path| {
            CommandEnv::new().with("JUJU_HOME", path.as_str())
        });
        tracing::debug!(command = %render_command(&self.juju_bin, &argv), "juju");
        let output = self
            .runner
            .run(&self.juju_bin, &argv, &child_env)?
            .into_success(&self.juju_bin)?;
        Ok(output.stdout)
    }

    fn env_command(
        &self,
        env: &Environment,
        command: &str,
        args: &[String],
    ) -> Result<String, ControlPlaneError> {
        self.run(Some(env.juju_home.as_path()), command, Some(&env.name), args)
    }

    fn status_once(&self, env: &Environment) -> Result<Status, ControlPlaneError> {
        let text = self.env_command(env, "status", &[String::from("--format"), String::from("json")])?;
        Status::parse(&text)
    }

    fn client_version(&self) -> Result<String, ControlPlaneError> {
        let text = self.run(None, "--version", None, &[])?;
        let full = text.trim();
        let number = full
            .rsplitn(3, '-')
            .last()
            .filter(|candidate| !candidate.is_empty())
            .ok_or_else(|| ControlPlaneError::Status(format!("unrecognised version {full:?}")))?;
        Ok(number.to_owned())
    }

    async fn poll_status(
        &self,
        env: &Environment,
        timeout: Duration,
        what: &str,
        done: impl Fn(&Status) -> bool + Send,
    ) -> Result<Status, ControlPlaneError> {
        let mut deadline = Deadline::new(timeout, self.poll_interval);
        while deadline.tick().await.is_some() {
            match self.status_once(env) {
                Ok(status) if done(&status) => return Ok(status),
                Ok(_) => tracing::debug!(what, "still waiting"),
                Err(err) => tracing::debug!(error = %err, what, "status unavailable"),
            }
        }
        Err(ControlPlaneError::Timeout {
            what: what.to_owned(),
            seconds: timeout.as_secs(),
        })
    }
}

impl<R: CommandRunner> ControlPlane for JujuCli<R> {
    fn bootstrap<'a>(
        &'a self,
        env: &'a Environment,
        upload_tools: bool,
        work_home: &'a Utf8Path,
    ) -> ControlFuture<'a, ()> {
        Box::pin(async move {
            let args = if upload_tools {
                vec![String::from("--upload-tools")]
            } else {
                Vec::new()
            };
            tracing::info!(environment = %env.name, home = %work_home, "bootstrapping");
            self.run(Some(work_home), "bootstrap", Some(&env.name), &args)?;
            Ok(())
        })
    }

    fn destroy_environment<'a>(&'a self, env: &'a Environment) -> ControlFuture<'a, ()> {
        Box::pin(async move {
            let args = [String::from("--force"), String::from("-y"), env.name.clone()];
            self.run(Some(env.juju_home.as_path()), "destroy-environment", None, &args)?;
            Ok(())
        })
    }

    fn get_status<'a>(
        &'a self,
        env: &'a Environment,
        timeout: Duration,
    ) -> ControlFuture<'a, Status> {
        Box::pin(async move {
            let mut deadline = Deadline::new(timeout, self.poll_interval);
            let mut last_error = None;
            while deadline.tick().await.is_some() {
                match self.status_once(env) {
                    Ok(status) => return Ok(status),
                    Err(err) => last_error = Some(err),
                }
            }
            Err(last_error.unwrap_or_else(|| ControlPlaneError::Timeout {
                what: String::from("status"),
                seconds: timeout.as_secs(),
            }))
        })
    }

    fn juju<'a>(
        &'a self,
        env: &'a Environment,
        command: &'a str,
        args: &'a [String],
    ) -> ControlFuture<'a, String> {
        Box::pin(async move { self.env_command(env, command, args) })
    }

    fn deployer<'a>(&'a self, env: &'a Environment, bundle: &'a str) -> ControlFuture<'a, ()> {
        Box::pin(async move {
            let args = ["--debug", "--deploy-delay", "10", "--config", bundle]
                .map(str::to_owned);
            self.env_command(env, "deployer", &args)?;
            Ok(())
        })
    }

    fn upgrade_juju<'a>(&'a self, env: &'a Environment) -> ControlFuture<'a, ()> {
        Box::pin(async move {
            let mut args = vec![String::from("--version"), self.client_version()?];
            if env.is_local() {
                args.push(String::from("--upload-tools"));
            }
            self.env_command(env, "upgrade-juju", &args)?;
            Ok(())
        })
    }

    fn set_testing_tools_metadata_url<'a>(
        &'a self,
        env: &'a Environment,
    ) -> ControlFuture<'a, ()> {
        Box::pin(async move {
            let current = self.env_command(env, "get-env", &[TOOLS_URL_KEY.to_owned()])?;
            let url = current.trim();
            if url.contains("testing") {
                return Ok(());
            }
            let testing = url.replacen("tools", "testing/tools", 1);
            tracing::info!(url = %testing, "switching to testing agent stream");
            self.env_command(env, "set-env", &[format!("{TOOLS_URL_KEY}={testing}")])?;
            Ok(())
        })
    }

    fn matching_agent_version(&self) -> ControlFuture<'_, String> {
        Box::pin(async move { self.client_version() })
    }

    fn wait_for_version<'a>(
        &'a self,
        env: &'a Environment,
        version: &'a str,
        timeout: Duration,
    ) -> ControlFuture<'a, ()> {
        Box::pin(async move {
            let what = format!("agents to report version {version}");
            self.poll_status(env, timeout, &what, |status| {
                status.agent_versions().keys().all(|found| found == version)
            })
            .await?;
            Ok(())
        })
    }

    fn wait_for_started<'a>(
        &'a self,
        env: &'a Environment,
        timeout: Duration,
    ) -> ControlFuture<'a, Status> {
        Box::pin(async move {
            self.poll_status(env, timeout, "agents to start", Status::all_started)
                .await
        })
    }
}
