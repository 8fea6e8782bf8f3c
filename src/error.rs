//! # Error types used by the opflow runtime and operations.
//!
//! This module defines two main error enums:
//!
//! - [`RuntimeError`] errors raised by the orchestration machinery itself.
//! - [`OperationError`] errors carried by individual operations: execution
//!   failures reported through `finish`, condition failures, and structural
//!   errors propagated by groups.
//!
//! Both types provide `as_label` helpers for logs and metrics.

use std::time::Duration;

use thiserror::Error;

/// # Errors produced by the orchestration machinery.
///
/// These represent misuse of the queue or group surface, never failures of
/// the work itself.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The operation was already submitted to a queue.
    #[error("operation '{name}' is already enqueued")]
    AlreadyEnqueued {
        /// Name of the duplicate operation.
        name: String,
    },

    /// The group has begun finishing; no further children are accepted.
    #[error("group '{name}' is finishing; no more operations may be added")]
    GroupFinishing {
        /// Name of the finishing group.
        name: String,
    },

    /// `produce` was called after the producer had already finished.
    #[error("operation '{name}' has finished; cannot produce '{child}'")]
    ProduceAfterFinish {
        /// Name of the producer.
        name: String,
        /// Name of the rejected child.
        child: String,
    },
}

impl RuntimeError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            RuntimeError::AlreadyEnqueued { .. } => "runtime_already_enqueued",
            RuntimeError::GroupFinishing { .. } => "runtime_group_finishing",
            RuntimeError::ProduceAfterFinish { .. } => "runtime_produce_after_finish",
        }
    }
}

/// # Errors carried by operations.
///
/// Condition failures prevent execution; execution failures are reported via
/// `finish`; structural errors wrap causes propagated across the operation
/// graph (e.g. a cancelled parent group).
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    /// A pre-flight condition evaluated to failed.
    #[error("condition '{name}' failed: {reason}")]
    ConditionFailed {
        /// Condition name.
        name: String,
        /// Human-readable cause.
        reason: String,
    },

    /// A composed condition's inner requirement did not hold.
    #[error("condition '{name}' requirement not satisfied")]
    RequirementNotSatisfied {
        /// Name of the composed condition.
        name: String,
    },

    /// At least one dependency was cancelled.
    #[error("a dependency was cancelled")]
    CancelledDependencies,

    /// At least one dependency finished with errors.
    #[error("a dependency finished with errors")]
    FailedDependencies,

    /// The enclosing group was cancelled; wraps the group's cancellation cause.
    #[error("parent operation was cancelled")]
    ParentCancelled {
        /// Errors the parent was cancelled with.
        errors: Vec<OperationError>,
    },

    /// The operation exceeded a deadline imposed by a timeout observer.
    #[error("timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// Domain failure reported by the operation's own work.
    #[error("execution failed: {reason}")]
    Fail {
        /// Human-readable cause.
        reason: String,
    },
}

impl OperationError {
    /// Convenience constructor for domain failures.
    pub fn fail(reason: impl Into<String>) -> Self {
        OperationError::Fail {
            reason: reason.into(),
        }
    }

    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            OperationError::ConditionFailed { .. } => "op_condition_failed",
            OperationError::RequirementNotSatisfied { .. } => "op_requirement_not_satisfied",
            OperationError::CancelledDependencies => "op_cancelled_dependencies",
            OperationError::FailedDependencies => "op_failed_dependencies",
            OperationError::ParentCancelled { .. } => "op_parent_cancelled",
            OperationError::Timeout { .. } => "op_timeout",
            OperationError::Fail { .. } => "op_failed",
        }
    }

    /// Indicates whether the error originated in condition evaluation.
    pub fn is_condition_failure(&self) -> bool {
        matches!(
            self,
            OperationError::ConditionFailed { .. }
                | OperationError::RequirementNotSatisfied { .. }
                | OperationError::CancelledDependencies
                | OperationError::FailedDependencies
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_stable() {
        assert_eq!(OperationError::fail("x").as_label(), "op_failed");
        assert_eq!(
            RuntimeError::AlreadyEnqueued { name: "a".into() }.as_label(),
            "runtime_already_enqueued"
        );
    }

    #[test]
    fn condition_failures_are_classified() {
        assert!(OperationError::FailedDependencies.is_condition_failure());
        assert!(!OperationError::fail("boom").is_condition_failure());
    }
}
