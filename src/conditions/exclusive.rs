//! Condition that places its operation in a mutual-exclusion category.

use async_trait::async_trait;

use crate::conditions::{Condition, ConditionResult};
use crate::operation::OperationRef;

/// Always-satisfied condition whose only job is to claim a category.
///
/// Operations carrying the same category execute one at a time, process
/// wide, in submission order. The serialization itself is enforced by the
/// exclusivity manager during queue admission.
pub struct MutuallyExclusive {
    category: String,
}

impl MutuallyExclusive {
    pub fn new(category: impl Into<String>) -> Self {
        Self {
            category: category.into(),
        }
    }
}

#[async_trait]
impl Condition for MutuallyExclusive {
    fn name(&self) -> &str {
        "MutuallyExclusive"
    }

    fn mutually_exclusive(&self) -> bool {
        true
    }

    fn category(&self) -> String {
        self.category.clone()
    }

    async fn evaluate(&self, _operation: &OperationRef) -> ConditionResult {
        ConditionResult::Satisfied
    }
}
