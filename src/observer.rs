//! # Lifecycle events and per-operation observers.
//!
//! Every operation owns an observer bus: an ordered list of [`Observer`]s
//! that receive [`OperationEvent`]s synchronously, in registration order, on
//! whichever task fires them. Observers never mutate the operation's state
//! machine; they may enqueue further work.
//!
//! [`BlockObserver`] is the record-of-callbacks convenience: attach closures
//! for any subset of the lifecycle phases. [`TimeoutObserver`] cancels its
//! operation after a deadline.

use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::error::OperationError;
use crate::operation::{Operation, OperationExt, OperationRef};

/// Lifecycle event dispatched to an operation's observers.
///
/// `WillAddChild` is fired only by group operations, for each child accepted
/// into the group.
#[derive(Clone)]
pub enum OperationEvent {
    /// An observer was attached to the operation.
    DidAttach,
    /// The operation is about to run its work.
    WillExecute,
    /// The operation is about to be cancelled; carries the cancellation errors.
    WillCancel { errors: Vec<OperationError> },
    /// The operation was cancelled.
    DidCancel,
    /// The operation emitted a child for its enclosing queue.
    DidProduce { child: OperationRef },
    /// A group operation accepted a new child.
    WillAddChild { child: OperationRef },
    /// The operation is finishing; dependents are still blocked.
    WillFinish { errors: Vec<OperationError> },
    /// The operation finished; the error list is frozen.
    DidFinish { errors: Vec<OperationError> },
}

impl OperationEvent {
    /// Returns a short stable label for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            OperationEvent::DidAttach => "did_attach",
            OperationEvent::WillExecute => "will_execute",
            OperationEvent::WillCancel { .. } => "will_cancel",
            OperationEvent::DidCancel => "did_cancel",
            OperationEvent::DidProduce { .. } => "did_produce",
            OperationEvent::WillAddChild { .. } => "will_add_child",
            OperationEvent::WillFinish { .. } => "will_finish",
            OperationEvent::DidFinish { .. } => "did_finish",
        }
    }
}

/// Receiver of operation lifecycle events.
///
/// Callbacks run synchronously on the task that fired the event; keep them
/// short and never block. Hold the operation weakly in anything that
/// outlives the callback.
pub trait Observer: Send + Sync + 'static {
    fn on_event(&self, operation: &OperationRef, event: &OperationEvent);
}

type OpCallback = Box<dyn Fn(&OperationRef) + Send + Sync>;
type ErrorsCallback = Box<dyn Fn(&OperationRef, &[OperationError]) + Send + Sync>;
type ChildCallback = Box<dyn Fn(&OperationRef, &OperationRef) + Send + Sync>;

/// Observer built from closures for any subset of lifecycle phases.
#[derive(Default)]
pub struct BlockObserver {
    did_attach: Option<OpCallback>,
    will_execute: Option<OpCallback>,
    will_cancel: Option<ErrorsCallback>,
    did_cancel: Option<OpCallback>,
    did_produce: Option<ChildCallback>,
    will_finish: Option<ErrorsCallback>,
    did_finish: Option<ErrorsCallback>,
}

impl BlockObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_did_attach(mut self, f: impl Fn(&OperationRef) + Send + Sync + 'static) -> Self {
        self.did_attach = Some(Box::new(f));
        self
    }

    pub fn with_will_execute(mut self, f: impl Fn(&OperationRef) + Send + Sync + 'static) -> Self {
        self.will_execute = Some(Box::new(f));
        self
    }

    pub fn with_will_cancel(
        mut self,
        f: impl Fn(&OperationRef, &[OperationError]) + Send + Sync + 'static,
    ) -> Self {
        self.will_cancel = Some(Box::new(f));
        self
    }

    pub fn with_did_cancel(mut self, f: impl Fn(&OperationRef) + Send + Sync + 'static) -> Self {
        self.did_cancel = Some(Box::new(f));
        self
    }

    pub fn with_did_produce(
        mut self,
        f: impl Fn(&OperationRef, &OperationRef) + Send + Sync + 'static,
    ) -> Self {
        self.did_produce = Some(Box::new(f));
        self
    }

    pub fn with_will_finish(
        mut self,
        f: impl Fn(&OperationRef, &[OperationError]) + Send + Sync + 'static,
    ) -> Self {
        self.will_finish = Some(Box::new(f));
        self
    }

    pub fn with_did_finish(
        mut self,
        f: impl Fn(&OperationRef, &[OperationError]) + Send + Sync + 'static,
    ) -> Self {
        self.did_finish = Some(Box::new(f));
        self
    }
}

impl Observer for BlockObserver {
    fn on_event(&self, operation: &OperationRef, event: &OperationEvent) {
        match event {
            OperationEvent::DidAttach => {
                if let Some(f) = &self.did_attach {
                    f(operation);
                }
            }
            OperationEvent::WillExecute => {
                if let Some(f) = &self.will_execute {
                    f(operation);
                }
            }
            OperationEvent::WillCancel { errors } => {
                if let Some(f) = &self.will_cancel {
                    f(operation, errors);
                }
            }
            OperationEvent::DidCancel => {
                if let Some(f) = &self.did_cancel {
                    f(operation);
                }
            }
            OperationEvent::DidProduce { child } => {
                if let Some(f) = &self.did_produce {
                    f(operation, child);
                }
            }
            OperationEvent::WillAddChild { .. } => {}
            OperationEvent::WillFinish { errors } => {
                if let Some(f) = &self.will_finish {
                    f(operation, errors);
                }
            }
            OperationEvent::DidFinish { errors } => {
                if let Some(f) = &self.did_finish {
                    f(operation, errors);
                }
            }
        }
    }
}

/// Bundles several observers behind a single registration slot.
pub struct CompositeObserver {
    observers: Vec<Arc<dyn Observer>>,
}

impl CompositeObserver {
    pub fn new(observers: Vec<Arc<dyn Observer>>) -> Self {
        Self { observers }
    }
}

impl Observer for CompositeObserver {
    fn on_event(&self, operation: &OperationRef, event: &OperationEvent) {
        for obs in &self.observers {
            obs.on_event(operation, event);
        }
    }
}

/// Cancels the operation if it is still unfinished `timeout` after it began
/// executing.
///
/// The timer holds the operation weakly; if the operation finishes first the
/// timer wakes, sees the finished flag, and exits without effect.
pub struct TimeoutObserver {
    timeout: Duration,
}

impl TimeoutObserver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Observer for TimeoutObserver {
    fn on_event(&self, operation: &OperationRef, event: &OperationEvent) {
        if !matches!(event, OperationEvent::WillExecute) {
            return;
        }
        let timeout = self.timeout;
        let weak: Weak<dyn Operation> = Arc::downgrade(operation);
        let mut finished = operation.core().finished_signal();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    if let Some(op) = weak.upgrade() {
                        op.cancel_with_errors(vec![OperationError::Timeout { timeout }]);
                    }
                }
                _ = finished.wait_for(|done| *done) => {}
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::Protected;
    use crate::operation::BlockOperation;

    #[test]
    fn block_observer_dispatches_matching_phase() {
        let seen = Arc::new(Protected::new(Vec::new()));
        let log = seen.clone();
        let observer = BlockObserver::new()
            .with_will_execute(move |op| log.write(|v| v.push(format!("exec:{}", op.name()))));

        let op: OperationRef = BlockOperation::arc("unit", |_ctx| async { Ok(()) });
        observer.on_event(&op, &OperationEvent::WillExecute);
        observer.on_event(&op, &OperationEvent::DidCancel);

        assert_eq!(seen.get(), vec!["exec:unit".to_string()]);
    }

    #[test]
    fn observers_fire_in_registration_order() {
        let order = Arc::new(Protected::new(Vec::new()));
        let op: OperationRef = BlockOperation::arc("ordered", |_ctx| async { Ok(()) });
        for tag in ["first", "second", "third"] {
            let log = order.clone();
            op.add_observer(Arc::new(
                BlockObserver::new().with_did_finish(move |_, _| log.write(|v| v.push(tag))),
            ));
        }

        op.core().finish(Vec::new());
        assert_eq!(order.get(), vec!["first", "second", "third"]);
    }

    #[test]
    fn composite_fans_out() {
        let count = Arc::new(Protected::new(0u32));
        let mk = |count: Arc<Protected<u32>>| {
            Arc::new(BlockObserver::new().with_did_cancel(move |_| count.write(|c| *c += 1)))
                as Arc<dyn Observer>
        };
        let composite = CompositeObserver::new(vec![mk(count.clone()), mk(count.clone())]);
        let op: OperationRef = BlockOperation::arc("fanout", |_ctx| async { Ok(()) });
        composite.on_event(&op, &OperationEvent::DidCancel);
        assert_eq!(count.get(), 2);
    }
}
