//! Operation that finishes after a duration elapses.

use std::borrow::Cow;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;

use crate::operation::{Operation, OperationCore, OperationRef};

/// Sleeps for a fixed duration, then finishes clean.
///
/// Cancellation skips the remaining sleep. Useful as a scheduling primitive:
/// make an operation depend on a `DelayOperation` to hold it back.
pub struct DelayOperation {
    core: OperationCore,
    delay: Duration,
}

impl DelayOperation {
    pub fn arc(name: impl Into<Cow<'static, str>>, delay: Duration) -> OperationRef {
        Self::new(name, delay)
    }

    pub fn new(name: impl Into<Cow<'static, str>>, delay: Duration) -> Arc<Self> {
        Arc::<Self>::new_cyclic(|me| {
            let weak: Weak<dyn Operation> = me.clone();
            Self {
                core: OperationCore::new(name, weak),
                delay,
            }
        })
    }

    /// The configured delay.
    pub fn delay(&self) -> Duration {
        self.delay
    }
}

#[async_trait]
impl Operation for DelayOperation {
    fn core(&self) -> &OperationCore {
        &self.core
    }

    async fn execute(&self) {
        let token = self.core.cancel_token();
        tokio::select! {
            _ = token.cancelled() => {}
            _ = tokio::time::sleep(self.delay) => {}
        }
        self.core.finish(Vec::new());
    }
}
