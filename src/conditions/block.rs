//! Trivial and predicate-backed conditions.

use async_trait::async_trait;

use crate::conditions::{Condition, ConditionResult};
use crate::error::OperationError;
use crate::operation::OperationRef;

/// Always satisfied.
pub struct TrueCondition;

#[async_trait]
impl Condition for TrueCondition {
    fn name(&self) -> &str {
        "TrueCondition"
    }

    async fn evaluate(&self, _operation: &OperationRef) -> ConditionResult {
        ConditionResult::Satisfied
    }
}

/// Always failed.
pub struct FalseCondition;

#[async_trait]
impl Condition for FalseCondition {
    fn name(&self) -> &str {
        "FalseCondition"
    }

    async fn evaluate(&self, _operation: &OperationRef) -> ConditionResult {
        ConditionResult::Failed(OperationError::ConditionFailed {
            name: self.name().to_string(),
            reason: "condition is always false".to_string(),
        })
    }
}

/// Satisfied iff the predicate returns true at evaluation time.
pub struct BlockCondition {
    predicate: Box<dyn Fn() -> bool + Send + Sync>,
}

impl BlockCondition {
    pub fn new(predicate: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        Self {
            predicate: Box::new(predicate),
        }
    }
}

#[async_trait]
impl Condition for BlockCondition {
    fn name(&self) -> &str {
        "BlockCondition"
    }

    async fn evaluate(&self, _operation: &OperationRef) -> ConditionResult {
        if (self.predicate)() {
            ConditionResult::Satisfied
        } else {
            ConditionResult::Failed(OperationError::ConditionFailed {
                name: self.name().to_string(),
                reason: "predicate returned false".to_string(),
            })
        }
    }
}
