//! Batch instance provisioning.
//!
//! [`BatchProvisioner`] creates, tags, describes and destroys the compute
//! instances backing a `manual` environment. It talks to the compute service
//! through [`InstanceApi`]; [`EucaClient`] implements that trait over the
//! euca2ools command-line tools.
//!
//! Instances are never leaked on a partial failure: once the creation
//! request has returned ids, any later error terminates those ids before the
//! error propagates.

mod euca;
mod parse;

use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;

use crate::command::CommandError;
use crate::poll::Deadline;

pub use euca::{DEFAULT_EUCA_PREFIX, EucaClient};
pub use parse::parse_euca;

/// Tag key used to associate instances with a job.
pub const JOB_NAME_TAG: &str = "job_name";

const ADDRESS_TIMEOUT: Duration = Duration::from_secs(300);
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Identifier and public address of a provisioned instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceRecord {
    /// Opaque instance identifier.
    pub id: String,
    /// Public address; empty while the instance is still pending.
    pub address: String,
}

impl InstanceRecord {
    /// Creates a record.
    #[must_use]
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
        }
    }
}

/// Capacity request sent to the batch API.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceSpec {
    /// Number of instances to create.
    pub count: usize,
    /// Machine image identifier.
    pub image_id: String,
    /// Instance flavour.
    pub instance_type: String,
    /// SSH key pair name installed on the instances.
    pub key_name: String,
    /// Security group applied to the instances.
    pub security_group: String,
}

impl InstanceSpec {
    /// Returns a copy of the spec requesting `count` instances.
    #[must_use]
    pub fn with_count(&self, count: usize) -> Self {
        Self {
            count,
            ..self.clone()
        }
    }
}

/// Query filter for [`InstanceApi::describe_instances`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InstanceFilter {
    /// Only instances tagged with this job name.
    pub job_name: Option<String>,
    /// Only instances in the `running` state.
    pub running_only: bool,
    /// Only these instance ids; empty means all.
    pub instance_ids: Vec<String>,
}

impl InstanceFilter {
    /// Filter matching instances tagged with `job_name`.
    #[must_use]
    pub fn for_job(job_name: impl Into<String>) -> Self {
        Self {
            job_name: Some(job_name.into()),
            ..Self::default()
        }
    }

    /// Filter matching exactly the given ids.
    #[must_use]
    pub fn for_ids(ids: &[String]) -> Self {
        Self {
            instance_ids: ids.to_vec(),
            ..Self::default()
        }
    }

    /// Restricts the filter to running instances.
    #[must_use]
    pub const fn running(mut self) -> Self {
        self.running_only = true;
        self
    }
}

/// Errors reported by an [`InstanceApi`] implementation.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BatchApiError {
    /// Raised when the underlying command cannot run or exits non-zero.
    #[error(transparent)]
    Command(#[from] CommandError),
    /// Raised when the service rejects a request or replies with something
    /// unusable.
    #[error("{operation} rejected: {message}")]
    Rejected {
        /// Operation that was attempted.
        operation: String,
        /// Service message.
        message: String,
    },
}

/// Compute service used to run, inspect and destroy instances.
pub trait InstanceApi: Send + Sync {
    /// Requests the instances described by `spec` and returns their
    /// creation records in creation order.
    ///
    /// # Errors
    ///
    /// Returns [`BatchApiError`] when the request fails.
    fn run_instances(&self, spec: &InstanceSpec) -> Result<Vec<InstanceRecord>, BatchApiError>;

    /// Lists instances matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns [`BatchApiError`] when the query fails.
    fn describe_instances(
        &self,
        filter: &InstanceFilter,
    ) -> Result<Vec<InstanceRecord>, BatchApiError>;

    /// Terminates the given instances.
    ///
    /// # Errors
    ///
    /// Returns [`BatchApiError`] when the request fails.
    fn terminate_instances(&self, ids: &[String]) -> Result<(), BatchApiError>;

    /// Applies `tags` to the given instances.
    ///
    /// # Errors
    ///
    /// Returns [`BatchApiError`] when the request fails.
    fn create_tags(&self, ids: &[String], tags: &BTreeMap<String, String>)
    -> Result<(), BatchApiError>;

    /// Fetches the console output of one instance.
    ///
    /// # Errors
    ///
    /// Returns [`BatchApiError`] when the request fails.
    fn console_output(&self, id: &str) -> Result<String, BatchApiError>;
}

/// Errors raised by [`BatchProvisioner`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProvisioningError {
    /// Raised when the capacity request itself fails.
    #[error("instance request failed: {0}")]
    Request(#[source] BatchApiError),
    /// Raised when the capacity request succeeds but returns no instances.
    #[error("instance request returned no instances")]
    Empty,
    /// Raised when the request cannot be built.
    #[error("invalid instance request: {message}")]
    InvalidTemplate {
        /// Description of the problem.
        message: String,
    },
    /// Raised when tagging new instances fails.
    #[error("failed to tag instances for job {job_name}: {source}")]
    Tag {
        /// Job the tag carried.
        job_name: String,
        /// Underlying API error.
        #[source]
        source: BatchApiError,
    },
    /// Raised when describing instances fails.
    #[error("failed to describe instances: {0}")]
    Describe(#[source] BatchApiError),
    /// Raised when instances do not report an address in time.
    #[error("instances {ids} had no address after {seconds}s")]
    AddressTimeout {
        /// Comma separated ids still pending.
        ids: String,
        /// Timeout that elapsed.
        seconds: u64,
    },
    /// Raised when terminating instances fails.
    #[error("failed to terminate instances: {0}")]
    Terminate(#[source] BatchApiError),
}

/// Provisions and destroys job-tagged instances through an [`InstanceApi`].
#[derive(Clone, Debug)]
pub struct BatchProvisioner<A> {
    api: A,
    template: InstanceSpec,
    address_timeout: Duration,
    poll_interval: Duration,
}

impl<A: InstanceApi> BatchProvisioner<A> {
    /// Creates a provisioner; `template` supplies everything but the count.
    #[must_use]
    pub const fn new(api: A, template: InstanceSpec) -> Self {
        Self {
            api,
            template,
            address_timeout: ADDRESS_TIMEOUT,
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Overrides how long to wait for every instance to report an address.
    #[must_use]
    pub const fn with_address_timeout(mut self, limit: Duration) -> Self {
        self.address_timeout = limit;
        self
    }

    /// Overrides the delay between describe calls.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Borrow the underlying API.
    #[must_use]
    pub const fn api(&self) -> &A {
        &self.api
    }

    /// Creates `count` instances, waits until each has an address, tags them
    /// with `job_name`, and returns them in creation order.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisioningError`] when any step fails. Instances created
    /// before the failure are terminated first.
    pub async fn run_instances(
        &self,
        count: usize,
        job_name: &str,
    ) -> Result<Vec<InstanceRecord>, ProvisioningError> {
        if count == 0 {
            return Err(ProvisioningError::InvalidTemplate {
                message: String::from("instance count must be positive"),
            });
        }
        if self.template.image_id.trim().is_empty() {
            return Err(ProvisioningError::InvalidTemplate {
                message: String::from("image id is empty"),
            });
        }

        let created = self
            .api
            .run_instances(&self.template.with_count(count))
            .map_err(ProvisioningError::Request)?;
        if created.is_empty() {
            return Err(ProvisioningError::Empty);
        }

        let ids = created
            .into_iter()
            .map(|record| record.id)
            .collect::<Vec<_>>();
        tracing::info!(job = job_name, ids = ?ids, "requested instances");

        match self.await_addresses(&ids, job_name).await {
            Ok(records) => Ok(records),
            Err(err) => {
                self.rollback(&ids);
                Err(err)
            }
        }
    }

    async fn await_addresses(
        &self,
        ids: &[String],
        job_name: &str,
    ) -> Result<Vec<InstanceRecord>, ProvisioningError> {
        let filter = InstanceFilter::for_ids(ids);
        let mut deadline = Deadline::new(self.address_timeout, self.poll_interval);
        let mut pending = ids.to_vec();
        while deadline.tick().await.is_some() {
            let described = self
                .api
                .describe_instances(&filter)
                .map_err(ProvisioningError::Describe)?;
            let addresses = described
                .into_iter()
                .map(|record| (record.id, record.address))
                .collect::<BTreeMap<_, _>>();

            pending = ids
                .iter()
                .filter(|id| addresses.get(*id).is_none_or(String::is_empty))
                .cloned()
                .collect();
            if !pending.is_empty() {
                continue;
            }

            let tags = BTreeMap::from([(JOB_NAME_TAG.to_owned(), job_name.to_owned())]);
            self.api
                .create_tags(ids, &tags)
                .map_err(|source| ProvisioningError::Tag {
                    job_name: job_name.to_owned(),
                    source,
                })?;

            return Ok(ids
                .iter()
                .map(|id| {
                    let address = addresses.get(id).cloned().unwrap_or_default();
                    InstanceRecord::new(id.clone(), address)
                })
                .collect());
        }

        Err(ProvisioningError::AddressTimeout {
            ids: pending.join(","),
            seconds: self.address_timeout.as_secs(),
        })
    }

    fn rollback(&self, ids: &[String]) {
        tracing::warn!(ids = ?ids, "terminating partially provisioned instances");
        if let Err(err) = self.api.terminate_instances(ids) {
            tracing::warn!(error = %err, "rollback termination failed");
        }
    }

    /// Lists instances matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisioningError::Describe`] when the query fails.
    pub fn describe_instances(
        &self,
        filter: &InstanceFilter,
    ) -> Result<Vec<InstanceRecord>, ProvisioningError> {
        self.api
            .describe_instances(filter)
            .map_err(ProvisioningError::Describe)
    }

    /// Terminates every running instance tagged with `job_name` and returns
    /// how many were terminated. Does nothing when none are found.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisioningError`] when the lookup or termination fails.
    pub fn destroy_instances(&self, job_name: &str) -> Result<usize, ProvisioningError> {
        let ids = self
            .describe_instances(&InstanceFilter::for_job(job_name).running())?
            .into_iter()
            .map(|record| record.id)
            .collect::<Vec<_>>();
        if ids.is_empty() {
            tracing::info!(job = job_name, "no instances to destroy");
            return Ok(0);
        }

        self.api
            .terminate_instances(&ids)
            .map_err(ProvisioningError::Terminate)?;
        tracing::info!(job = job_name, count = ids.len(), "terminated instances");
        Ok(ids.len())
    }
}
