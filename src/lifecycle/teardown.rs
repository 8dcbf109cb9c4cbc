//! Release guards registered as resources are acquired.
//!
//! Each acquisition pushes the [`Release`] that undoes it. Teardown pops the
//! stack, so resources are released innermost first whatever phase failed.

use crate::outcome::BestEffort;

/// Cleanup owed for one acquired resource.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Release {
    /// Stop every domain acquired for the session, after a settle delay.
    Domains,
    /// Terminate the instances tagged with `job_name`.
    Instances {
        /// Job tag of the instances.
        job_name: String,
    },
    /// Print final status and, when `destroy` is set, destroy the
    /// bootstrapped environment.
    Environment {
        /// Whether the environment is destroyed.
        destroy: bool,
    },
}

/// Last-in, first-out collection of pending releases.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TeardownStack {
    pending: Vec<Release>,
}

impl TeardownStack {
    /// Creates an empty stack.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pending: Vec::new(),
        }
    }

    /// Registers a release.
    pub fn push(&mut self, release: Release) {
        tracing::debug!(release = ?release, "registered teardown step");
        self.pending.push(release);
    }

    /// Pending releases, oldest first.
    #[must_use]
    pub fn pending(&self) -> &[Release] {
        &self.pending
    }

    /// Returns `true` when nothing needs releasing.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Consumes the stack, yielding releases newest first.
    pub fn unwind(self) -> impl Iterator<Item = Release> {
        self.pending.into_iter().rev()
    }
}

/// Every teardown step attempted, in execution order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TeardownReport {
    /// Recorded steps.
    pub steps: Vec<BestEffort>,
}

impl TeardownReport {
    /// Steps that failed.
    pub fn failures(&self) -> impl Iterator<Item = &BestEffort> {
        self.steps.iter().filter(|step| step.is_failed())
    }

    /// Descriptions of every step, in execution order.
    #[must_use]
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(BestEffort::step).collect()
    }
}
