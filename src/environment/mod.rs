//! Control-plane environment descriptions.
//!
//! An [`Environment`] is one entry of `<juju home>/environments.yaml`: a name
//! plus a flat string mapping whose `type` key selects the provider. The
//! orchestrator rewrites the name and a handful of keys for each session
//! with [`Environment::apply`]; nothing else mutates it.

mod work_home;

use std::collections::BTreeMap;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde::Deserialize;
use thiserror::Error;

pub use work_home::WorkHome;

/// File listing the environments under a juju home.
pub const ENVIRONMENTS_FILE: &str = "environments.yaml";

/// Directory holding bootstrap descriptors under a juju home.
pub const DESCRIPTOR_DIR: &str = "environments";

const TYPE_KEY: &str = "type";
const ROOT_DIR_KEY: &str = "root-dir";
const SERIES_KEY: &str = "default-series";
const BOOTSTRAP_HOST_KEY: &str = "bootstrap-host";
const TOOLS_URL_KEY: &str = "tools-metadata-url";

/// Resource-backing strategy of an environment.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProviderKind {
    /// Machines are batch instances reached over SSH.
    Manual,
    /// Machines run on pre-existing virtual domains.
    Virtualized,
    /// The provider acquires its own machines.
    Generic,
}

impl ProviderKind {
    /// Maps a provider `type` value onto a kind.
    #[must_use]
    pub fn from_type(provider_type: &str) -> Self {
        match provider_type {
            "manual" => Self::Manual,
            "maas" => Self::Virtualized,
            _ => Self::Generic,
        }
    }
}

/// Errors raised while loading or preparing environments.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum EnvironmentError {
    /// Raised when a file or directory cannot be accessed.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path involved in the failure.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// Raised when `environments.yaml` is malformed.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// File that failed to parse.
        path: Utf8PathBuf,
        /// Parser error.
        message: String,
    },
    /// Raised when the requested environment is not defined.
    #[error("environment {name} is not defined in {path}")]
    Unknown {
        /// Requested environment name.
        name: String,
        /// File that was searched.
        path: Utf8PathBuf,
    },
    /// Raised when a temporary directory has a non UTF-8 path.
    #[error("temporary path is not valid UTF-8: {path}")]
    NonUtf8Path {
        /// Lossy rendering of the path.
        path: String,
    },
}

impl EnvironmentError {
    fn io(path: &Utf8Path, err: &io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

/// Session-specific values written into an environment.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct EnvironmentOverrides {
    /// New environment name, normally the job name.
    pub name: String,
    /// Default series for new machines.
    pub series: Option<String>,
    /// Host the manual provider bootstraps onto.
    pub bootstrap_host: Option<String>,
    /// Source of agent binaries.
    pub agent_url: Option<String>,
}

/// A named environment and its configuration mapping.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Environment {
    /// Environment name.
    pub name: String,
    /// Configuration mapping, including the provider `type`.
    pub config: BTreeMap<String, String>,
    /// Juju home the environment belongs to.
    pub juju_home: Utf8PathBuf,
}

#[derive(Debug, Deserialize)]
struct EnvironmentsFile {
    #[serde(default)]
    environments: BTreeMap<String, BTreeMap<String, serde_yaml::Value>>,
}

fn scalar_to_string(value: serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::Null => None,
        serde_yaml::Value::Bool(flag) => Some(flag.to_string()),
        serde_yaml::Value::Number(number) => Some(number.to_string()),
        serde_yaml::Value::String(text) => Some(text),
        other => serde_yaml::to_string(&other)
            .ok()
            .map(|text| text.trim().to_owned()),
    }
}

impl Environment {
    /// Builds an environment from an in-memory mapping.
    #[must_use]
    pub fn from_config(
        name: impl Into<String>,
        config: BTreeMap<String, String>,
        juju_home: impl Into<Utf8PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            juju_home: juju_home.into(),
        }
    }

    /// Loads environment `name` from `<juju_home>/environments.yaml`.
    ///
    /// Scalar values are kept as strings; null values are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`EnvironmentError`] when the file cannot be read or parsed,
    /// or does not define `name`.
    pub fn load(juju_home: &Utf8Path, name: &str) -> Result<Self, EnvironmentError> {
        let path = juju_home.join(ENVIRONMENTS_FILE);
        let dir = Dir::open_ambient_dir(juju_home, ambient_authority())
            .map_err(|err| EnvironmentError::io(juju_home, &err))?;
        let contents = dir
            .read_to_string(ENVIRONMENTS_FILE)
            .map_err(|err| EnvironmentError::io(&path, &err))?;
        let mut parsed: EnvironmentsFile =
            serde_yaml::from_str(&contents).map_err(|err| EnvironmentError::Parse {
                path: path.clone(),
                message: err.to_string(),
            })?;

        let raw = parsed
            .environments
            .remove(name)
            .ok_or_else(|| EnvironmentError::Unknown {
                name: name.to_owned(),
                path,
            })?;
        let config = raw
            .into_iter()
            .filter_map(|(key, value)| scalar_to_string(value).map(|text| (key, text)))
            .collect();
        Ok(Self::from_config(name, config, juju_home))
    }

    /// Provider `type` value, empty when unset.
    #[must_use]
    pub fn provider_type(&self) -> &str {
        self.config.get(TYPE_KEY).map_or("", String::as_str)
    }

    /// Provider kind derived from the `type` value.
    #[must_use]
    pub fn provider(&self) -> ProviderKind {
        ProviderKind::from_type(self.provider_type())
    }

    /// Returns `true` for the `local` provider, whose state server runs on
    /// this host.
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.provider_type() == "local"
    }

    /// Rewrites the name and session keys in place.
    pub fn apply(&mut self, overrides: &EnvironmentOverrides) {
        self.name.clone_from(&overrides.name);
        let updates = [
            (SERIES_KEY, &overrides.series),
            (BOOTSTRAP_HOST_KEY, &overrides.bootstrap_host),
            (TOOLS_URL_KEY, &overrides.agent_url),
        ];
        for (key, value) in updates {
            if let Some(text) = value {
                self.config.insert(key.to_owned(), text.clone());
            }
        }
    }

    /// Path of the bootstrap descriptor for this environment name.
    #[must_use]
    pub fn descriptor_path(&self) -> Utf8PathBuf {
        self.juju_home.join(self.descriptor_relative_path())
    }

    fn descriptor_relative_path(&self) -> Utf8PathBuf {
        Utf8Path::new(DESCRIPTOR_DIR).join(format!("{}.jenv", self.name))
    }

    /// Deletes a descriptor left behind by an earlier run. Returns `true`
    /// when one was removed.
    ///
    /// # Errors
    ///
    /// Returns [`EnvironmentError::Io`] when the file exists but cannot be
    /// removed.
    pub fn remove_stale_descriptor(&self) -> Result<bool, EnvironmentError> {
        let dir = match Dir::open_ambient_dir(&self.juju_home, ambient_authority()) {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(EnvironmentError::io(&self.juju_home, &err)),
        };
        match dir.remove_file(self.descriptor_relative_path()) {
            Ok(()) => {
                tracing::info!(path = %self.descriptor_path(), "removed stale descriptor");
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(EnvironmentError::io(&self.descriptor_path(), &err)),
        }
    }

    /// Directory holding a local provider's state.
    #[must_use]
    pub fn local_root(&self) -> Utf8PathBuf {
        self.config.get(ROOT_DIR_KEY).map_or_else(
            || self.juju_home.join(&self.name),
            Utf8PathBuf::from,
        )
    }
}

#[cfg(test)]
mod tests;
