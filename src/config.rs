//! Configuration loading via `ortho-config`.
//!
//! Values merge defaults, `stackrun.toml` (located through
//! `STACKRUN_CONFIG_PATH`, a `.stackrun.toml` dotfile or the project file)
//! and environment variables, in that order of precedence.

use std::env;
use std::ffi::OsString;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::batch::{DEFAULT_EUCA_PREFIX, InstanceSpec};
use crate::control::DEFAULT_JUJU_BIN;

const CONFIG_FILE: &str = "stackrun.toml";

/// Settings for the orchestrator and its control-plane client.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "STACKRUN",
    discovery(
        app_name = "stackrun",
        env_var = "STACKRUN_CONFIG_PATH",
        config_file_name = "stackrun.toml",
        dotfile_name = ".stackrun.toml",
        project_file_name = "stackrun.toml"
    )
)]
pub struct HarnessConfig {
    /// Path to the `juju` client.
    #[ortho_config(default = DEFAULT_JUJU_BIN.to_owned())]
    pub juju_bin: String,
    /// Juju home holding `environments.yaml`. Falls back to `$JUJU_HOME`,
    /// then `~/.juju`.
    pub juju_home: Option<String>,
    /// Path to the `virsh` executable.
    #[ortho_config(default = "virsh".to_owned())]
    pub virsh_bin: String,
    /// Parent directory for the temporary juju home used during bootstrap.
    /// Defaults to the system temporary directory.
    pub scratch_dir: Option<String>,
    /// Path to the `timeout` executable wrapping remote commands.
    #[ortho_config(default = "timeout".to_owned())]
    pub timeout_bin: String,
    /// Wait for the state server port to close after destroying the
    /// environment.
    #[ortho_config(default = false)]
    pub confirm_state_server_shutdown: bool,
    /// Pass `--debug` to the client.
    #[ortho_config(default = false)]
    pub debug: bool,
}

/// Settings for the euca2ools batch API.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "STACKRUN_EUCA",
    discovery(
        app_name = "stackrun",
        env_var = "STACKRUN_CONFIG_PATH",
        config_file_name = "stackrun.toml",
        dotfile_name = ".stackrun.toml",
        project_file_name = "stackrun.toml"
    )
)]
pub struct BatchConfig {
    /// Prefix of the euca2ools binaries.
    #[ortho_config(default = DEFAULT_EUCA_PREFIX.to_owned())]
    pub bin_prefix: String,
    /// Machine image for new instances. Only required when instances are
    /// provisioned.
    pub image_id: Option<String>,
    /// Instance flavour.
    #[ortho_config(default = "m1.large".to_owned())]
    pub instance_type: String,
    /// Key pair installed on new instances.
    #[ortho_config(default = "id_rsa".to_owned())]
    pub key_name: String,
    /// Security group for new instances.
    #[ortho_config(default = "manual-juju-test".to_owned())]
    pub security_group: String,
    /// Environment variable whose presence signals usable API credentials.
    #[ortho_config(default = "AWS_ACCESS_KEY".to_owned())]
    pub credentials_env: String,
}

/// Settings for SSH and SCP access to machines.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "STACKRUN_REMOTE",
    discovery(
        app_name = "stackrun",
        env_var = "STACKRUN_CONFIG_PATH",
        config_file_name = "stackrun.toml",
        dotfile_name = ".stackrun.toml",
        project_file_name = "stackrun.toml"
    )
)]
pub struct RemoteConfig {
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `scp` executable.
    #[ortho_config(default = "scp".to_owned())]
    pub scp_bin: String,
    /// Login user on remote machines.
    #[ortho_config(default = "ubuntu".to_owned())]
    pub ssh_user: String,
    /// Known hosts file; `/dev/null` disables persistence.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub known_hosts_file: String,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
    section: &'static str,
}

impl FieldMetadata {
    const fn new(
        description: &'static str,
        env_var: &'static str,
        toml_key: &'static str,
        section: &'static str,
    ) -> Self {
        Self {
            description,
            env_var,
            toml_key,
            section,
        }
    }
}

fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to [{}] in {CONFIG_FILE}",
            metadata.description, metadata.env_var, metadata.toml_key, metadata.section
        )));
    }
    Ok(())
}

fn program_name() -> [OsString; 1] {
    [OsString::from("stackrun")]
}

impl HarnessConfig {
    /// Loads configuration without parsing CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter(program_name())
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Checks that every executable path is set.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] naming the empty field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.juju_bin,
            &FieldMetadata::new("juju client path", "STACKRUN_JUJU_BIN", "juju_bin", "harness"),
        )?;
        require_field(
            &self.virsh_bin,
            &FieldMetadata::new("virsh path", "STACKRUN_VIRSH_BIN", "virsh_bin", "harness"),
        )?;
        require_field(
            &self.timeout_bin,
            &FieldMetadata::new(
                "timeout path",
                "STACKRUN_TIMEOUT_BIN",
                "timeout_bin",
                "harness",
            ),
        )
    }

    /// Resolves the juju home: the configured value, then `$JUJU_HOME`,
    /// then `$HOME/.juju`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when none of them is available.
    pub fn resolve_juju_home(&self) -> Result<Utf8PathBuf, ConfigError> {
        let configured = self
            .juju_home
            .clone()
            .filter(|home| !home.trim().is_empty());
        if let Some(home) = configured {
            return Ok(Utf8PathBuf::from(home));
        }
        if let Some(home) = env::var("JUJU_HOME").ok().filter(|home| !home.is_empty()) {
            return Ok(Utf8PathBuf::from(home));
        }
        env::var("HOME")
            .ok()
            .filter(|home| !home.is_empty())
            .map(|home| Utf8PathBuf::from(home).join(".juju"))
            .ok_or_else(|| {
                ConfigError::MissingField(format!(
                    "missing juju home: set STACKRUN_JUJU_HOME or JUJU_HOME, or add juju_home to [harness] in {CONFIG_FILE}"
                ))
            })
    }
}

impl BatchConfig {
    /// Loads configuration without parsing CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter(program_name())
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Checks the fields every batch call needs.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] naming the empty field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.bin_prefix,
            &FieldMetadata::new(
                "euca2ools binary prefix",
                "STACKRUN_EUCA_BIN_PREFIX",
                "bin_prefix",
                "euca",
            ),
        )?;
        require_field(
            &self.instance_type,
            &FieldMetadata::new(
                "instance type",
                "STACKRUN_EUCA_INSTANCE_TYPE",
                "instance_type",
                "euca",
            ),
        )?;
        require_field(
            &self.key_name,
            &FieldMetadata::new("key pair name", "STACKRUN_EUCA_KEY_NAME", "key_name", "euca"),
        )?;
        require_field(
            &self.security_group,
            &FieldMetadata::new(
                "security group",
                "STACKRUN_EUCA_SECURITY_GROUP",
                "security_group",
                "euca",
            ),
        )
    }

    /// Checks that an image is configured, as provisioning requires.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when `image_id` is unset.
    pub fn validate_for_provisioning(&self) -> Result<(), ConfigError> {
        self.validate()?;
        require_field(
            self.image_id.as_deref().unwrap_or_default(),
            &FieldMetadata::new("machine image id", "STACKRUN_EUCA_IMAGE_ID", "image_id", "euca"),
        )
    }

    /// Instance template; the count is chosen per request.
    #[must_use]
    pub fn template(&self) -> InstanceSpec {
        InstanceSpec {
            count: 0,
            image_id: self.image_id.clone().unwrap_or_default(),
            instance_type: self.instance_type.clone(),
            key_name: self.key_name.clone(),
            security_group: self.security_group.clone(),
        }
    }

    /// Returns `true` when the credentials variable is set.
    #[must_use]
    pub fn has_credentials(&self) -> bool {
        env::var_os(&self.credentials_env).is_some_and(|value| !value.is_empty())
    }
}

impl RemoteConfig {
    /// Loads configuration without parsing CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter(program_name())
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Checks that every field is set.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] naming the empty field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.ssh_bin,
            &FieldMetadata::new("ssh path", "STACKRUN_REMOTE_SSH_BIN", "ssh_bin", "remote"),
        )?;
        require_field(
            &self.scp_bin,
            &FieldMetadata::new("scp path", "STACKRUN_REMOTE_SCP_BIN", "scp_bin", "remote"),
        )?;
        require_field(
            &self.ssh_user,
            &FieldMetadata::new("ssh user", "STACKRUN_REMOTE_SSH_USER", "ssh_user", "remote"),
        )?;
        require_field(
            &self.known_hosts_file,
            &FieldMetadata::new(
                "known hosts file",
                "STACKRUN_REMOTE_KNOWN_HOSTS_FILE",
                "known_hosts_file",
                "remote",
            ),
        )
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}
