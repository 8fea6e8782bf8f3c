//! Wrapping conditions: pass-through composition, negation, silencing.

use std::sync::Arc;

use async_trait::async_trait;

use crate::conditions::{Condition, ConditionResult};
use crate::error::OperationError;
use crate::operation::OperationRef;

/// Delegates everything to an inner condition.
///
/// Name, mutual-exclusion flag, category, indirect dependency, and result
/// are all inherited, so composing is idempotent with respect to outcome:
/// `Composed(Composed(c))` evaluates exactly like `Composed(c)`.
pub struct ComposedCondition {
    inner: Arc<dyn Condition>,
}

impl ComposedCondition {
    pub fn new(inner: Arc<dyn Condition>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Condition for ComposedCondition {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn mutually_exclusive(&self) -> bool {
        self.inner.mutually_exclusive()
    }

    fn category(&self) -> String {
        self.inner.category()
    }

    fn dependency(&self, operation: &OperationRef) -> Option<OperationRef> {
        self.inner.dependency(operation)
    }

    async fn evaluate(&self, operation: &OperationRef) -> ConditionResult {
        self.inner.evaluate(operation).await
    }
}

/// Inverts the inner condition's result.
///
/// A satisfied inner condition becomes a `RequirementNotSatisfied` failure;
/// a failed inner condition becomes satisfied. `Ignored` stays ignored.
pub struct NegatedCondition {
    name: String,
    inner: Arc<dyn Condition>,
}

impl NegatedCondition {
    pub fn new(inner: Arc<dyn Condition>) -> Self {
        Self {
            name: format!("Not<{}>", inner.name()),
            inner,
        }
    }
}

#[async_trait]
impl Condition for NegatedCondition {
    fn name(&self) -> &str {
        &self.name
    }

    fn mutually_exclusive(&self) -> bool {
        self.inner.mutually_exclusive()
    }

    fn category(&self) -> String {
        self.inner.category()
    }

    fn dependency(&self, operation: &OperationRef) -> Option<OperationRef> {
        self.inner.dependency(operation)
    }

    async fn evaluate(&self, operation: &OperationRef) -> ConditionResult {
        match self.inner.evaluate(operation).await {
            ConditionResult::Satisfied => {
                ConditionResult::Failed(OperationError::RequirementNotSatisfied {
                    name: self.name.clone(),
                })
            }
            ConditionResult::Failed(_) => ConditionResult::Satisfied,
            ConditionResult::Ignored => ConditionResult::Ignored,
        }
    }
}

/// Suppresses the inner condition's indirect dependency.
///
/// Evaluation is unchanged; only the auxiliary operation is dropped, so the
/// condition is checked without any preparatory side effects.
pub struct SilentCondition {
    inner: Arc<dyn Condition>,
}

impl SilentCondition {
    pub fn new(inner: Arc<dyn Condition>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Condition for SilentCondition {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn mutually_exclusive(&self) -> bool {
        self.inner.mutually_exclusive()
    }

    fn category(&self) -> String {
        self.inner.category()
    }

    async fn evaluate(&self, operation: &OperationRef) -> ConditionResult {
        self.inner.evaluate(operation).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::{FalseCondition, TrueCondition};
    use crate::operation::{BlockOperation, DelayOperation};
    use std::time::Duration;

    fn target() -> OperationRef {
        BlockOperation::arc("target", |_ctx| async { Ok(()) })
    }

    struct WithDependency;

    #[async_trait]
    impl Condition for WithDependency {
        fn dependency(&self, _operation: &OperationRef) -> Option<OperationRef> {
            Some(DelayOperation::arc("prep", Duration::from_millis(1)))
        }

        async fn evaluate(&self, _operation: &OperationRef) -> ConditionResult {
            ConditionResult::Satisfied
        }
    }

    #[tokio::test]
    async fn composing_is_idempotent_for_results() {
        let op = target();
        let once = ComposedCondition::new(Arc::new(FalseCondition));
        let twice = ComposedCondition::new(Arc::new(ComposedCondition::new(Arc::new(
            FalseCondition,
        ))));
        assert_eq!(once.evaluate(&op).await, twice.evaluate(&op).await);
        assert_eq!(once.name(), twice.name());
    }

    #[tokio::test]
    async fn negation_inverts_results() {
        let op = target();
        let not_false = NegatedCondition::new(Arc::new(FalseCondition));
        assert_eq!(not_false.evaluate(&op).await, ConditionResult::Satisfied);

        let not_true = NegatedCondition::new(Arc::new(TrueCondition));
        assert!(matches!(
            not_true.evaluate(&op).await,
            ConditionResult::Failed(OperationError::RequirementNotSatisfied { name }) if name == "Not<TrueCondition>"
        ));
    }

    #[tokio::test]
    async fn silent_drops_the_indirect_dependency() {
        let op = target();
        assert!(WithDependency.dependency(&op).is_some());
        let silent = SilentCondition::new(Arc::new(WithDependency));
        assert!(silent.dependency(&op).is_none());
        assert_eq!(silent.evaluate(&op).await, ConditionResult::Satisfied);
    }
}
