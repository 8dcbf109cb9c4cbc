//! Provider-specific resource acquisition.

use crate::batch::{BatchProvisioner, InstanceApi};
use crate::domain::{DomainApi, DomainManager, DomainRef};
use crate::environment::ProviderKind;

use super::LifecycleError;
use super::session::Session;
use super::teardown::{Release, TeardownStack};

/// Instances requested when a manual environment has no bootstrap host:
/// one bootstrap host and two additional machines.
pub const MANUAL_INSTANCE_COUNT: usize = 3;

/// How a session obtains its machines, chosen once per session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProviderStrategy {
    /// Manual provider; `provision` is set when no bootstrap host was given
    /// and instances must be created.
    Manual {
        /// Whether batch instances are created.
        provision: bool,
    },
    /// Pre-existing virtual domains named as `name@locator` machines.
    Virtualized,
    /// Providers that acquire nothing up front.
    Generic,
}

impl ProviderStrategy {
    /// Selects the strategy for `kind`.
    #[must_use]
    pub const fn select(kind: ProviderKind, has_bootstrap_host: bool) -> Self {
        match kind {
            ProviderKind::Manual => Self::Manual {
                provision: !has_bootstrap_host,
            },
            ProviderKind::Virtualized => Self::Virtualized,
            ProviderKind::Generic => Self::Generic,
        }
    }

    /// Acquires the session's resources and registers their releases.
    ///
    /// Releases are registered only when the environment is not kept. The
    /// domain release is registered before the first domain is touched so
    /// domains acquired before a failure are still stopped.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Provisioning`] or
    /// [`LifecycleError::Domain`] when acquisition fails.
    pub async fn acquire<I, D>(
        self,
        provisioner: &BatchProvisioner<I>,
        domains: &mut DomainManager<D>,
        session: &mut Session,
        stack: &mut TeardownStack,
    ) -> Result<(), LifecycleError>
    where
        I: InstanceApi,
        D: DomainApi,
    {
        match self {
            Self::Manual { provision: true } => {
                let instances = provisioner
                    .run_instances(MANUAL_INSTANCE_COUNT, &session.job_name)
                    .await?;
                session.created_machines = true;
                if !session.keep_environment {
                    stack.push(Release::Instances {
                        job_name: session.job_name.clone(),
                    });
                }
                let mut records = instances.iter();
                if let Some(first) = records.next() {
                    session.bootstrap_host = Some(first.address.clone());
                    session.bootstrap_id = Some(first.id.clone());
                }
                session
                    .machines
                    .extend(records.map(|record| record.address.clone()));
                session.instances = instances;
            }
            Self::Virtualized => {
                if !session.keep_environment {
                    stack.push(Release::Domains);
                }
                let references = session
                    .machines
                    .iter()
                    .map(|machine| machine.parse::<DomainRef>())
                    .collect::<Result<Vec<_>, _>>()?;
                for reference in &references {
                    let acquired = domains.acquire(reference).await;
                    session.domains = domains.acquired().to_vec();
                    acquired?;
                }
                session.machines = self.address_machines(&session.machines);
            }
            Self::Manual { provision: false } | Self::Generic => {}
        }
        Ok(())
    }

    /// Machines that are enlisted with `add-machine` after bootstrap.
    /// Domains are addressed directly, so the virtualized strategy enlists
    /// none.
    #[must_use]
    pub fn address_machines(self, machines: &[String]) -> Vec<String> {
        match self {
            Self::Virtualized => Vec::new(),
            Self::Manual { .. } | Self::Generic => machines.to_vec(),
        }
    }
}
