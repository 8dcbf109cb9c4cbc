//! Temporary juju home used for a single bootstrap.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde::Serialize;
use tempfile::TempDir;

use super::{
    DESCRIPTOR_DIR, ENVIRONMENTS_FILE, Environment, EnvironmentError, ROOT_DIR_KEY,
};

#[derive(Serialize)]
struct EnvironmentsDocument<'a> {
    environments: BTreeMap<&'a str, BTreeMap<&'a str, &'a str>>,
}

/// Temporary directory containing an `environments.yaml` with exactly one
/// environment in test mode.
///
/// Dropping the home moves the descriptor produced by bootstrap back into
/// the real juju home, then deletes the directory.
#[derive(Debug)]
pub struct WorkHome {
    dir: TempDir,
    path: Utf8PathBuf,
    descriptor: Utf8PathBuf,
    target_home: Utf8PathBuf,
}

impl WorkHome {
    /// Creates the temporary home for `environment`.
    ///
    /// # Errors
    ///
    /// Returns [`EnvironmentError`] when the directory or file cannot be
    /// created.
    pub fn create(environment: &Environment) -> Result<Self, EnvironmentError> {
        Self::create_under(environment, None)
    }

    /// Creates the temporary home for `environment` inside `parent`.
    ///
    /// # Errors
    ///
    /// Returns [`EnvironmentError`] when `parent` is missing or unwritable,
    /// or when the directory or file cannot be created.
    pub fn create_in(
        environment: &Environment,
        parent: &Utf8Path,
    ) -> Result<Self, EnvironmentError> {
        Self::create_under(environment, Some(parent))
    }

    fn create_under(
        environment: &Environment,
        parent: Option<&Utf8Path>,
    ) -> Result<Self, EnvironmentError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("stackrun-home-");
        let created = match parent {
            Some(parent) => builder.tempdir_in(parent),
            None => builder.tempdir(),
        };
        let dir = created.map_err(|err| EnvironmentError::Io {
            path: parent.map_or_else(|| Utf8PathBuf::from("<tempdir>"), Utf8Path::to_path_buf),
            message: err.to_string(),
        })?;
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).map_err(|raw| {
            EnvironmentError::NonUtf8Path {
                path: raw.to_string_lossy().into_owned(),
            }
        })?;

        let local_root = environment.local_root();
        let mut config = environment
            .config
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
            .collect::<BTreeMap<_, _>>();
        config.insert("test-mode", "true");
        if environment.is_local() {
            config.entry(ROOT_DIR_KEY).or_insert(local_root.as_str());
        }
        let document = EnvironmentsDocument {
            environments: BTreeMap::from([(environment.name.as_str(), config)]),
        };
        let rendered =
            serde_yaml::to_string(&document).map_err(|err| EnvironmentError::Parse {
                path: path.join(ENVIRONMENTS_FILE),
                message: err.to_string(),
            })?;

        let handle = Dir::open_ambient_dir(&path, ambient_authority())
            .map_err(|err| EnvironmentError::io(&path, &err))?;
        handle
            .write(ENVIRONMENTS_FILE, rendered)
            .map_err(|err| EnvironmentError::io(&path.join(ENVIRONMENTS_FILE), &err))?;

        Ok(Self {
            dir,
            path,
            descriptor: Utf8Path::new(DESCRIPTOR_DIR).join(format!("{}.jenv", environment.name)),
            target_home: environment.juju_home.clone(),
        })
    }

    /// Path of the temporary home.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn retain_descriptor(&self) -> Result<bool, EnvironmentError> {
        let source = Dir::open_ambient_dir(&self.path, ambient_authority())
            .map_err(|err| EnvironmentError::io(&self.path, &err))?;
        if !source
            .try_exists(&self.descriptor)
            .map_err(|err| EnvironmentError::io(&self.path, &err))?
        {
            return Ok(false);
        }
        let contents = source
            .read(&self.descriptor)
            .map_err(|err| EnvironmentError::io(&self.path.join(&self.descriptor), &err))?;

        let descriptors = self.target_home.join(DESCRIPTOR_DIR);
        Dir::create_ambient_dir_all(&descriptors, ambient_authority())
            .map_err(|err| EnvironmentError::io(&descriptors, &err))?;
        let target = Dir::open_ambient_dir(&self.target_home, ambient_authority())
            .map_err(|err| EnvironmentError::io(&self.target_home, &err))?;
        target
            .write(&self.descriptor, contents)
            .map_err(|err| EnvironmentError::io(&self.target_home.join(&self.descriptor), &err))?;
        Ok(true)
    }
}

impl Drop for WorkHome {
    fn drop(&mut self) {
        match self.retain_descriptor() {
            Ok(true) => tracing::debug!(
                home = %self.dir.path().display(),
                descriptor = %self.descriptor,
                "moved descriptor into juju home"
            ),
            Ok(false) => {}
            Err(err) => tracing::warn!(error = %err, "failed to retain bootstrap descriptor"),
        }
    }
}
