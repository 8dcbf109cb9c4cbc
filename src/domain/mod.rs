//! Virtual domain management.
//!
//! A virtualized environment runs on pre-existing libvirt domains. The
//! [`DomainManager`] starts the ones that are stopped, remembers which were
//! already running, and stops all of them at the end of a session. Whether
//! a domain predated the session is captured once at acquisition and never
//! re-queried.

mod virsh;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;

use thiserror::Error;

use crate::command::CommandError;
use crate::outcome::BestEffort;

pub use virsh::VirshClient;

/// A domain addressed by name and connection locator (`name@uri`).
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct DomainRef {
    /// Domain name.
    pub name: String,
    /// Hypervisor connection URI.
    pub locator: String,
}

impl DomainRef {
    /// Creates a reference.
    #[must_use]
    pub fn new(name: impl Into<String>, locator: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            locator: locator.into(),
        }
    }
}

impl FromStr for DomainRef {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.split_once('@') {
            Some((name, locator)) if !name.is_empty() && !locator.is_empty() => {
                Ok(Self::new(name, locator))
            }
            _ => Err(DomainError::InvalidReference {
                value: value.to_owned(),
            }),
        }
    }
}

impl fmt::Display for DomainRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.locator)
    }
}

/// Domain states the manager cares about.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DomainState {
    /// Domain is running.
    Running,
    /// Domain is shut off.
    ShutOff,
}

impl DomainState {
    /// State name as printed by `virsh domstate`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::ShutOff => "shut off",
        }
    }
}

impl fmt::Display for DomainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while managing domains.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DomainError {
    /// Raised when a machine reference is not `name@locator`.
    #[error("invalid domain reference {value:?}: expected name@uri")]
    InvalidReference {
        /// Offending value.
        value: String,
    },
    /// Raised when the hypervisor command fails.
    #[error(transparent)]
    Command(#[from] CommandError),
    /// Raised when a domain does not reach a state in time.
    #[error("{name} did not reach state {state}")]
    StateTimeout {
        /// Domain name.
        name: String,
        /// Awaited state.
        state: DomainState,
    },
    /// Raised by API implementations for other failures.
    #[error("domain api error: {message}")]
    Api {
        /// Description of the failure.
        message: String,
    },
}

/// Future returned by [`DomainApi`] methods.
pub type DomainFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, DomainError>> + Send + 'a>>;

/// Virtualization control API.
pub trait DomainApi: Send + Sync {
    /// Returns `true` when `domain` is currently in `state`.
    fn verify_state<'a>(&'a self, domain: &'a DomainRef, state: DomainState)
    -> DomainFuture<'a, bool>;

    /// Starts `domain` and returns a status message.
    fn start<'a>(&'a self, domain: &'a DomainRef) -> DomainFuture<'a, String>;

    /// Stops `domain` and returns a status message. Stopping a stopped
    /// domain succeeds.
    fn stop<'a>(&'a self, domain: &'a DomainRef) -> DomainFuture<'a, String>;
}

impl<A: DomainApi + ?Sized> DomainApi for &A {
    fn verify_state<'a>(
        &'a self,
        domain: &'a DomainRef,
        state: DomainState,
    ) -> DomainFuture<'a, bool> {
        (**self).verify_state(domain, state)
    }

    fn start<'a>(&'a self, domain: &'a DomainRef) -> DomainFuture<'a, String> {
        (**self).start(domain)
    }

    fn stop<'a>(&'a self, domain: &'a DomainRef) -> DomainFuture<'a, String> {
        (**self).stop(domain)
    }
}

/// A domain acquired for a session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AcquiredDomain {
    /// The domain.
    pub domain: DomainRef,
    /// Whether the domain was running before the session touched it.
    pub already_running: bool,
}

/// Result of releasing one domain.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DomainRelease {
    /// The released domain.
    pub domain: DomainRef,
    /// Whether the domain predated the session.
    pub predated_session: bool,
    /// Outcome of the stop request.
    pub outcome: BestEffort,
}

/// Starts and stops the domains of one session.
#[derive(Debug)]
pub struct DomainManager<A> {
    api: A,
    acquired: Vec<AcquiredDomain>,
}

impl<A: DomainApi> DomainManager<A> {
    /// Creates a manager with nothing acquired.
    #[must_use]
    pub const fn new(api: A) -> Self {
        Self {
            api,
            acquired: Vec::new(),
        }
    }

    /// Borrow the underlying API.
    #[must_use]
    pub const fn api(&self) -> &A {
        &self.api
    }

    /// Domains acquired so far, in acquisition order.
    #[must_use]
    pub fn acquired(&self) -> &[AcquiredDomain] {
        &self.acquired
    }

    /// Ensures `domain` is running and records whether it already was.
    ///
    /// A domain that is already acquired is returned as recorded, without
    /// querying or starting it again.
    ///
    /// A stopped domain is recorded before the start request is sent, so a
    /// domain whose start failed or timed out is still stopped on release.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError`] when the query or start fails. A failed
    /// query records nothing.
    pub async fn acquire(&mut self, domain: &DomainRef) -> Result<AcquiredDomain, DomainError> {
        if let Some(existing) = self.acquired.iter().find(|known| &known.domain == domain) {
            return Ok(existing.clone());
        }

        let already_running = self.api.verify_state(domain, DomainState::Running).await?;
        let acquired = AcquiredDomain {
            domain: domain.clone(),
            already_running,
        };
        self.acquired.push(acquired.clone());

        if already_running {
            tracing::info!(domain = %domain.name, "domain is already running");
        } else {
            tracing::info!(domain = %domain.name, locator = %domain.locator, "starting domain");
            let status = self.api.start(domain).await?;
            tracing::info!(domain = %domain.name, status = %status, "domain started");
        }
        Ok(acquired)
    }

    /// Stops `acquired`, warning first when the domain predated the
    /// session. Failures are recorded, never returned.
    pub async fn release(&self, acquired: &AcquiredDomain) -> DomainRelease {
        let domain = &acquired.domain;
        if acquired.already_running {
            tracing::warn!(
                domain = %domain.name,
                locator = %domain.locator,
                "domain was running before the session started; shutting it down for a clean environment"
            );
        }
        tracing::info!(domain = %domain.name, locator = %domain.locator, "stopping domain");
        let result = self.api.stop(domain).await;
        if let Ok(status) = &result {
            tracing::info!(domain = %domain.name, status = %status, "domain stopped");
        }

        DomainRelease {
            domain: domain.clone(),
            predated_session: acquired.already_running,
            outcome: BestEffort::from_result(format!("stop domain {domain}"), result),
        }
    }

    /// Releases every acquired domain in acquisition order. One failure
    /// does not stop the others from being attempted.
    pub async fn release_all(&self) -> Vec<DomainRelease> {
        let mut releases = Vec::with_capacity(self.acquired.len());
        for acquired in &self.acquired {
            releases.push(self.release(acquired).await);
        }
        releases
    }
}
