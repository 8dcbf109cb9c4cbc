//! Outcome records for steps that must never abort the steps after them.

use std::fmt::Display;

/// Result of a best-effort step such as log collection or teardown.
///
/// Failures are logged where they happen and recorded here so callers can
/// inspect what went wrong without the failure propagating.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BestEffort {
    /// The step finished.
    Completed {
        /// Short description of the step.
        step: String,
    },
    /// The step failed and was skipped over.
    Failed {
        /// Short description of the step.
        step: String,
        /// Rendered error.
        message: String,
    },
}

impl BestEffort {
    /// Records a completed step.
    #[must_use]
    pub fn completed(step: impl Into<String>) -> Self {
        Self::Completed { step: step.into() }
    }

    /// Records a failed step and logs it as a warning.
    #[must_use]
    pub fn failed(step: impl Into<String>, error: impl Display) -> Self {
        let description = step.into();
        let message = error.to_string();
        tracing::warn!(step = %description, error = %message, "best-effort step failed");
        Self::Failed {
            step: description,
            message,
        }
    }

    /// Converts a result into an outcome, logging failures.
    #[must_use]
    pub fn from_result<T, E: Display>(step: impl Into<String>, result: Result<T, E>) -> Self {
        match result {
            Ok(_) => Self::completed(step),
            Err(err) => Self::failed(step, err),
        }
    }

    /// Returns `true` when the step failed.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// Returns the step description.
    #[must_use]
    pub fn step(&self) -> &str {
        match self {
            Self::Completed { step } | Self::Failed { step, .. } => step,
        }
    }
}
