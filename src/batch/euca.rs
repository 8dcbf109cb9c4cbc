//! [`InstanceApi`] over the euca2ools command-line tools.

use std::collections::BTreeMap;
use std::ffi::OsString;

use super::{BatchApiError, InstanceApi, InstanceFilter, InstanceRecord, InstanceSpec, parse_euca};
use crate::command::{CommandEnv, CommandOutput, CommandRunner, render_command};

/// Default prefix of the euca2ools binaries.
pub const DEFAULT_EUCA_PREFIX: &str = "euca-";

/// Shells out to `euca-*` commands.
///
/// Credentials and endpoints reach the tools through the explicit
/// [`CommandEnv`] rather than the process environment.
#[derive(Clone, Debug)]
pub struct EucaClient<R> {
    runner: R,
    bin_prefix: String,
    env: CommandEnv,
}

impl<R: CommandRunner> EucaClient<R> {
    /// Creates a client using the default `euca-` binaries.
    #[must_use]
    pub fn new(runner: R) -> Self {
        Self {
            runner,
            bin_prefix: DEFAULT_EUCA_PREFIX.to_owned(),
            env: CommandEnv::new(),
        }
    }

    /// Overrides the binary prefix, e.g. `/opt/euca/bin/euca-`.
    #[must_use]
    pub fn with_bin_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.bin_prefix = prefix.into();
        self
    }

    /// Sets the environment passed to every command.
    #[must_use]
    pub fn with_env(mut self, env: CommandEnv) -> Self {
        self.env = env;
        self
    }

    fn run(&self, tool: &str, args: Vec<OsString>) -> Result<CommandOutput, BatchApiError> {
        let program = format!("{}{tool}", self.bin_prefix);
        tracing::info!(command = %render_command(&program, &args), "euca");
        let output = self.runner.run(&program, &args, &self.env)?;
        Ok(output.into_success(&program)?)
    }
}

impl<R: CommandRunner> InstanceApi for EucaClient<R> {
    fn run_instances(&self, spec: &InstanceSpec) -> Result<Vec<InstanceRecord>, BatchApiError> {
        let count = spec.count.to_string();
        let args = [
            "-k",
            spec.key_name.as_str(),
            "-n",
            count.as_str(),
            "-t",
            spec.instance_type.as_str(),
            "-g",
            spec.security_group.as_str(),
            spec.image_id.as_str(),
        ]
        .into_iter()
        .map(OsString::from)
        .collect();
        let output = self.run("run-instances", args)?;
        Ok(parse_euca(&output.stdout))
    }

    fn describe_instances(
        &self,
        filter: &InstanceFilter,
    ) -> Result<Vec<InstanceRecord>, BatchApiError> {
        let mut args = Vec::new();
        if let Some(job_name) = &filter.job_name {
            args.push(OsString::from("--filter"));
            args.push(OsString::from(format!("tag:{}={job_name}", super::JOB_NAME_TAG)));
        }
        if filter.running_only {
            args.push(OsString::from("--filter"));
            args.push(OsString::from("instance-state-name=running"));
        }
        args.extend(filter.instance_ids.iter().map(OsString::from));
        let output = self.run("describe-instances", args)?;
        Ok(parse_euca(&output.stdout))
    }

    fn terminate_instances(&self, ids: &[String]) -> Result<(), BatchApiError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.run(
            "terminate-instances",
            ids.iter().map(OsString::from).collect(),
        )?;
        Ok(())
    }

    fn create_tags(
        &self,
        ids: &[String],
        tags: &BTreeMap<String, String>,
    ) -> Result<(), BatchApiError> {
        let mut args = Vec::with_capacity(tags.len().saturating_mul(2).saturating_add(ids.len()));
        for (key, value) in tags {
            args.push(OsString::from("--tag"));
            args.push(OsString::from(format!("{key}={value}")));
        }
        args.extend(ids.iter().map(OsString::from));
        self.run("create-tags", args)?;
        Ok(())
    }

    fn console_output(&self, id: &str) -> Result<String, BatchApiError> {
        let output = self.run("get-console-output", vec![OsString::from(id)])?;
        Ok(output.stdout)
    }
}
