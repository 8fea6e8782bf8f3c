//! Condition gating an operation on the health of its dependencies.

use async_trait::async_trait;

use crate::conditions::{Condition, ConditionResult};
use crate::error::OperationError;
use crate::operation::{OperationExt, OperationRef};

/// Fails when any direct dependency of the target was cancelled or finished
/// with errors.
///
/// Inspection happens at evaluation time, after the dependencies have
/// settled. Cancelled dependencies take precedence over failed ones. Group
/// dependencies are judged by their public failed flag, which already folds
/// in their children's fatal errors. With zero dependencies the condition is
/// satisfied.
pub struct NoFailedDependencies;

#[async_trait]
impl Condition for NoFailedDependencies {
    fn name(&self) -> &str {
        "NoFailedDependencies"
    }

    async fn evaluate(&self, operation: &OperationRef) -> ConditionResult {
        let dependencies = operation.core().dependencies();
        if dependencies.iter().any(|d| d.is_cancelled()) {
            return ConditionResult::Failed(OperationError::CancelledDependencies);
        }
        if dependencies.iter().any(|d| d.failed()) {
            return ConditionResult::Failed(OperationError::FailedDependencies);
        }
        ConditionResult::Satisfied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::BlockOperation;

    fn op(name: &'static str) -> OperationRef {
        BlockOperation::arc(name, |_ctx| async { Ok(()) })
    }

    #[tokio::test]
    async fn zero_dependencies_is_satisfied() {
        let target = op("target");
        assert_eq!(
            NoFailedDependencies.evaluate(&target).await,
            ConditionResult::Satisfied
        );
    }

    #[tokio::test]
    async fn failed_dependency_fails_the_condition() {
        let target = op("target");
        let dep = op("dep");
        dep.core().finish(vec![OperationError::fail("simulated")]);
        target.add_dependency(dep);

        assert_eq!(
            NoFailedDependencies.evaluate(&target).await,
            ConditionResult::Failed(OperationError::FailedDependencies)
        );
    }

    #[tokio::test]
    async fn cancelled_dependency_takes_precedence() {
        let target = op("target");
        let cancelled = op("cancelled");
        cancelled.cancel();
        cancelled.core().finish(Vec::new());
        let failed = op("failed");
        failed.core().finish(vec![OperationError::fail("simulated")]);
        target.add_dependency(cancelled);
        target.add_dependency(failed);

        assert_eq!(
            NoFailedDependencies.evaluate(&target).await,
            ConditionResult::Failed(OperationError::CancelledDependencies)
        );
    }
}
