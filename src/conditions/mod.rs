//! # Pre-flight conditions.
//!
//! A [`Condition`] is a predicate evaluated before its operation may become
//! ready. Evaluation is always asynchronous and runs inside a synthesized
//! [`ConditionEvaluator`] operation that the queue injects as a dependency
//! of the target. A condition may contribute an auxiliary operation (an
//! *indirect dependency*) that runs before evaluation, and may claim a
//! mutual-exclusion category.
//!
//! Built-ins: [`TrueCondition`], [`FalseCondition`], [`BlockCondition`],
//! [`NoFailedDependencies`], [`MutuallyExclusive`], and the wrappers
//! [`ComposedCondition`], [`NegatedCondition`], [`SilentCondition`].

mod block;
mod composed;
mod dependencies;
mod exclusive;

pub use block::{BlockCondition, FalseCondition, TrueCondition};
pub use composed::{ComposedCondition, NegatedCondition, SilentCondition};
pub use dependencies::NoFailedDependencies;
pub use exclusive::MutuallyExclusive;

use std::sync::{Arc, Weak};

use async_trait::async_trait;

use crate::error::OperationError;
use crate::operation::{Operation, OperationCore, OperationExt, OperationRef};

/// Outcome of evaluating a condition against its target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConditionResult {
    /// The operation may proceed.
    Satisfied,
    /// The operation must not execute; the error lands on the target.
    Failed(OperationError),
    /// The condition abstains; treated as satisfied.
    Ignored,
}

/// Pre-flight predicate attached to an operation.
///
/// Owned by the operation it is attached to until that operation finishes.
#[async_trait]
pub trait Condition: Send + Sync + 'static {
    /// Condition name, used in error reporting and debug dumps.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Whether operations carrying this condition are serialized per
    /// [`category`](Condition::category) across the whole process.
    fn mutually_exclusive(&self) -> bool {
        false
    }

    /// Mutual-exclusion category. Defaults to the type's symbolic name.
    fn category(&self) -> String {
        self.name().to_string()
    }

    /// Auxiliary operation that must finish before this condition is
    /// evaluated, or `None`.
    fn dependency(&self, operation: &OperationRef) -> Option<OperationRef> {
        let _ = operation;
        None
    }

    /// Evaluates the condition against its target.
    async fn evaluate(&self, operation: &OperationRef) -> ConditionResult;
}

/// Internal operation that runs a target's condition list.
///
/// Finishes with the concatenated failures, or clean when every condition is
/// satisfied or ignored. The target transitions out of
/// `EvaluatingConditions` when this operation finishes.
pub(crate) struct ConditionEvaluator {
    core: OperationCore,
    conditions: Vec<Arc<dyn Condition>>,
    target: Weak<dyn Operation>,
}

impl ConditionEvaluator {
    pub(crate) fn new(target: &OperationRef, conditions: Vec<Arc<dyn Condition>>) -> Arc<Self> {
        let name = format!("{}.conditions", target.name());
        let evaluator = Arc::<Self>::new_cyclic(|me| {
            let weak: Weak<dyn Operation> = me.clone();
            Self {
                core: OperationCore::new(name, weak),
                conditions,
                target: Arc::downgrade(target),
            }
        });
        evaluator.core.set_internal();
        evaluator
    }
}

#[async_trait]
impl Operation for ConditionEvaluator {
    fn core(&self) -> &OperationCore {
        &self.core
    }

    async fn execute(&self) {
        let mut failures = Vec::new();
        if let Some(target) = self.target.upgrade() {
            for condition in &self.conditions {
                match condition.evaluate(&target).await {
                    ConditionResult::Satisfied | ConditionResult::Ignored => {}
                    ConditionResult::Failed(error) => failures.push(error),
                }
            }
        }
        self.core.finish(failures);
    }
}
