//! # Group operation.
//!
//! A group runs a bag of children on a private queue and finishes only when
//! every child, including any added or produced at runtime, has finished.
//!
//! Quiescence detection uses a rotating barrier: a zero-work `can-finish`
//! operation depends on every current child. When it runs it re-checks the
//! child ledger under the group lock; children that slipped in after the
//! barrier was built get a fresh barrier, and only a barrier that finds the
//! ledger fully finished flips the group into its finishing phase. A
//! separate finishing sentinel depends on every barrier ever installed and,
//! once the last one resolves, finishes the group with its accumulated fatal
//! errors. The two-step design closes the race between "the barrier became
//! ready" and "a child was added before it actually ran"; without the
//! rotation a late child would be orphaned.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::cell::Protected;
use crate::debug::DebugRecord;
use crate::error::{OperationError, RuntimeError};
use crate::observer::OperationEvent;
use crate::operation::{Operation, OperationCore, OperationExt, OperationRef};
use crate::queue::{OperationQueue, QueueConfig, QueueDelegate};

type RecoveryFn = Arc<dyn Fn(&OperationRef, &[OperationError]) -> bool + Send + Sync>;
type ChildFinishFn = Arc<dyn Fn(&OperationRef, &[OperationError]) + Send + Sync>;

/// Operation that owns a private queue of child operations.
///
/// Children start when the group itself executes. Errors from children
/// accumulate as the group's fatal errors unless a recovery hook claims
/// them. Cancelling the group cancels every child; if the cancellation
/// carries errors, children receive them wrapped in
/// [`OperationError::ParentCancelled`].
pub struct GroupOperation {
    core: OperationCore,
    inner: Arc<GroupInner>,
}

struct GroupBook {
    operations: Vec<OperationRef>,
    is_finishing: bool,
}

struct GroupInner {
    group: Weak<dyn Operation>,
    queue: OperationQueue,
    book: Protected<GroupBook>,
    fatal: Protected<Vec<OperationError>>,
    attempted_recovery: Protected<HashMap<u64, Vec<OperationError>>>,
    /// Count of in-flight `add_operations` calls; the barrier defers while
    /// it is non-zero.
    adding: watch::Sender<usize>,
    barrier: Protected<Option<OperationRef>>,
    finishing: Protected<Option<OperationRef>>,
    recovery: Protected<Option<RecoveryFn>>,
    child_will_finish: Protected<Option<ChildFinishFn>>,
}

impl GroupOperation {
    /// Creates a group with an initial set of children.
    pub fn new(name: impl Into<Cow<'static, str>>, children: Vec<OperationRef>) -> Arc<Self> {
        let name = name.into();
        let group = Arc::<Self>::new_cyclic(|me| {
            let weak: Weak<dyn Operation> = me.clone();
            let queue = OperationQueue::new(QueueConfig {
                name: format!("{name}.queue"),
                start_suspended: true,
                ..QueueConfig::default()
            });
            let (adding, _) = watch::channel(0usize);
            let inner = Arc::new(GroupInner {
                group: weak.clone(),
                queue,
                book: Protected::new(GroupBook {
                    operations: Vec::new(),
                    is_finishing: false,
                }),
                fatal: Protected::default(),
                attempted_recovery: Protected::default(),
                adding,
                barrier: Protected::new(None),
                finishing: Protected::new(None),
                recovery: Protected::new(None),
                child_will_finish: Protected::new(None),
            });
            GroupOperation {
                core: OperationCore::new(name.clone(), weak),
                inner,
            }
        });

        group.inner.queue.set_delegate(Arc::new(GroupDelegate {
            inner: Arc::downgrade(&group.inner),
        }));

        let barrier = CanFinish::new(&group.inner, Vec::new());
        let finishing = FinishingSentinel::new(&group.inner);
        finishing.add_dependency(barrier.clone());
        group.inner.barrier.write(|b| *b = Some(barrier.clone()));
        group.inner.finishing.write(|f| *f = Some(finishing.clone()));
        if let Err(e) = group.inner.queue.add(barrier) {
            warn!(group = %group.name(), error = %e, "barrier rejected");
        }
        if let Err(e) = group.inner.queue.add(finishing) {
            warn!(group = %group.name(), error = %e, "finishing sentinel rejected");
        }

        if let Err(e) = group.add_operations(children) {
            warn!(group = %group.name(), error = %e, "initial children rejected");
        }
        group
    }

    /// Adds one child. Fails once the group has begun finishing.
    pub fn add_operation(&self, operation: OperationRef) -> Result<(), RuntimeError> {
        self.add_operations([operation])
    }

    /// Adds a batch of children. Fails once the group has begun finishing.
    pub fn add_operations(
        &self,
        operations: impl IntoIterator<Item = OperationRef>,
    ) -> Result<(), RuntimeError> {
        if self.inner.book.read(|b| b.is_finishing) {
            return Err(RuntimeError::GroupFinishing {
                name: self.core.name().to_string(),
            });
        }
        self.inner.adding.send_modify(|n| *n += 1);
        let result = (|| {
            for operation in operations {
                self.inner.queue.add(operation)?;
            }
            Ok(())
        })();
        self.inner.adding.send_modify(|n| *n -= 1);
        result
    }

    /// Snapshot of the child ledger: initial children plus any added or
    /// produced later.
    pub fn operations(&self) -> Vec<OperationRef> {
        self.inner.book.read(|b| b.operations.clone())
    }

    /// Errors accumulated from children (minus those claimed by recovery).
    pub fn fatal_errors(&self) -> Vec<OperationError> {
        self.inner.fatal.get()
    }

    /// Installs the recovery hook consulted when a child is about to finish
    /// with errors. Returning `true` claims the errors: they are withheld
    /// from the group's fatal list on the expectation that compensating work
    /// has been scheduled.
    pub fn set_recovery(
        &self,
        hook: impl Fn(&OperationRef, &[OperationError]) -> bool + Send + Sync + 'static,
    ) {
        self.inner.recovery.write(|r| *r = Some(Arc::new(hook)));
    }

    /// Installs a hook observing every child as it finishes.
    pub fn set_child_will_finish(
        &self,
        hook: impl Fn(&OperationRef, &[OperationError]) + Send + Sync + 'static,
    ) {
        self.inner
            .child_will_finish
            .write(|h| *h = Some(Arc::new(hook)));
    }
}

#[async_trait]
impl Operation for GroupOperation {
    fn core(&self) -> &OperationCore {
        &self.core
    }

    async fn execute(&self) {
        debug!(group = %self.core.name(), "starting children");
        // The group finishes when the finishing sentinel runs; auto-finish
        // on return is deliberately absent.
        self.inner.queue.resume();
    }

    fn cancel_with_errors(&self, errors: Vec<OperationError>) {
        let child_errors = if errors.is_empty() {
            Vec::new()
        } else {
            vec![OperationError::ParentCancelled {
                errors: errors.clone(),
            }]
        };
        let children = self.inner.book.read(|b| b.operations.clone());
        for child in children {
            child.cancel_with_errors(child_errors.clone());
        }
        self.core.cancel(errors);
        // Unpark the private queue so cancelled children and the internal
        // barrier/sentinel can drain even if the group never executed.
        self.inner.queue.resume();
    }

    fn debug_record(&self) -> DebugRecord {
        let mut record = self.core.debug_record();
        record.sub_operations = self
            .inner
            .book
            .read(|b| b.operations.iter().map(|op| op.debug_record()).collect());
        record
    }
}

/// Queue-delegate shim holding the group weakly.
struct GroupDelegate {
    inner: Weak<GroupInner>,
}

impl QueueDelegate for GroupDelegate {
    fn will_add(&self, _queue: &OperationQueue, operation: &OperationRef) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if operation.core().is_internal() {
            return;
        }
        if let Some(group) = inner.group.upgrade() {
            if group.is_cancelled() {
                operation.cancel();
            }
        }
        let rejected = inner.book.write(|book| {
            if book.is_finishing {
                true
            } else {
                book.operations.push(operation.clone());
                false
            }
        });
        if rejected {
            warn!(
                operation = %operation.name(),
                "operation arrived while group was finishing; cancelling"
            );
            operation.cancel();
            return;
        }
        if let Some(barrier) = inner.barrier.get() {
            barrier.add_dependency(operation.clone());
        }
        if let Some(group) = inner.group.upgrade() {
            group.core().fire_event(OperationEvent::WillAddChild {
                child: operation.clone(),
            });
        }
    }

    fn will_finish(
        &self,
        _queue: &OperationQueue,
        operation: &OperationRef,
        errors: &[OperationError],
    ) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if operation.core().is_internal() {
            return;
        }
        if let Some(hook) = inner.child_will_finish.get() {
            hook(operation, errors);
        }
        if errors.is_empty() {
            return;
        }
        let attempt = inner
            .recovery
            .get()
            .map(|hook| hook(operation, errors))
            .unwrap_or(false);
        if attempt {
            debug!(child = %operation.name(), "recovery claimed child errors");
            inner.attempted_recovery.write(|m| {
                m.insert(operation.id(), errors.to_vec());
            });
        } else {
            inner.fatal.write(|f| f.extend(errors.iter().cloned()));
        }
    }

    fn did_finish(
        &self,
        _queue: &OperationQueue,
        operation: &OperationRef,
        _errors: &[OperationError],
    ) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if operation.core().is_internal() {
            return;
        }
        // A declared recovery is considered successful once the child has
        // finished; the stashed errors are dropped.
        inner.attempted_recovery.write(|m| {
            m.remove(&operation.id());
        });
    }
}

/// Zero-work barrier depending on every current child.
struct CanFinish {
    core: OperationCore,
    group: Weak<GroupInner>,
}

impl CanFinish {
    fn new(inner: &Arc<GroupInner>, dependencies: Vec<OperationRef>) -> OperationRef {
        let barrier = Arc::<Self>::new_cyclic(|me| {
            let weak: Weak<dyn Operation> = me.clone();
            Self {
                core: OperationCore::new("group.can-finish", weak),
                group: Arc::downgrade(inner),
            }
        });
        barrier.core.set_internal();
        for dependency in dependencies {
            barrier.core.add_dependency(dependency);
        }
        barrier
    }
}

#[async_trait]
impl Operation for CanFinish {
    fn core(&self) -> &OperationCore {
        &self.core
    }

    async fn execute(&self) {
        let Some(inner) = self.group.upgrade() else {
            self.core.finish(Vec::new());
            return;
        };
        // Defer while an add_operations call is mid-flight.
        {
            let mut rx = inner.adding.subscribe();
            let _ = rx.wait_for(|n| *n == 0).await;
        }
        let stragglers = inner.book.write(|book| {
            let unfinished: Vec<OperationRef> = book
                .operations
                .iter()
                .filter(|op| !op.is_finished())
                .cloned()
                .collect();
            if unfinished.is_empty() {
                book.is_finishing = true;
                None
            } else {
                Some(unfinished)
            }
        });
        match stragglers {
            None => {
                trace!("group quiescent; finishing unblocked");
            }
            Some(remaining) => {
                // Children slipped in after this barrier was built; hand
                // off to a fresh barrier before finishing ourselves.
                debug!(stragglers = remaining.len(), "rotating can-finish barrier");
                let next = CanFinish::new(&inner, remaining);
                inner.barrier.write(|b| *b = Some(next.clone()));
                if let Some(finishing) = inner.finishing.get() {
                    finishing.add_dependency(next.clone());
                }
                if let Err(e) = inner.queue.add(next) {
                    warn!(error = %e, "rotated barrier rejected");
                }
            }
        }
        self.core.finish(Vec::new());
    }
}

/// Runs once the last barrier resolves; finishes the group.
struct FinishingSentinel {
    core: OperationCore,
    group: Weak<GroupInner>,
}

impl FinishingSentinel {
    fn new(inner: &Arc<GroupInner>) -> OperationRef {
        let sentinel = Arc::<Self>::new_cyclic(|me| {
            let weak: Weak<dyn Operation> = me.clone();
            Self {
                core: OperationCore::new("group.finishing", weak),
                group: Arc::downgrade(inner),
            }
        });
        sentinel.core.set_internal();
        sentinel
    }
}

#[async_trait]
impl Operation for FinishingSentinel {
    fn core(&self) -> &OperationCore {
        &self.core
    }

    async fn execute(&self) {
        if let Some(inner) = self.group.upgrade() {
            let fatal = inner.fatal.get();
            if let Some(group) = inner.group.upgrade() {
                group.core().finish(fatal);
            }
        }
        self.core.finish(Vec::new());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::BlockOperation;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn flagged(name: &'static str, flag: Arc<AtomicBool>) -> OperationRef {
        BlockOperation::arc(name, move |_ctx| {
            let flag = flag.clone();
            async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn finishes_after_all_children() {
        let ran_a = Arc::new(AtomicBool::new(false));
        let ran_b = Arc::new(AtomicBool::new(false));
        let group = GroupOperation::new(
            "pair",
            vec![flagged("a", ran_a.clone()), flagged("b", ran_b.clone())],
        );

        let queue = OperationQueue::default();
        queue.add(group.clone()).expect("admitted");
        group.core().await_finish().await;

        assert!(ran_a.load(Ordering::SeqCst));
        assert!(ran_b.load(Ordering::SeqCst));
        assert!(group.succeeded());
        for child in group.operations() {
            assert!(child.is_finished());
        }
    }

    #[tokio::test]
    async fn empty_group_finishes() {
        let group = GroupOperation::new("empty", Vec::new());
        let queue = OperationQueue::default();
        queue.add(group.clone()).expect("admitted");
        group.core().await_finish().await;
        assert!(group.succeeded());
    }

    #[tokio::test]
    async fn produced_child_holds_the_group_open() {
        let produced_ran = Arc::new(AtomicBool::new(false));
        let grand = {
            let flag = produced_ran.clone();
            move || {
                let flag = flag.clone();
                BlockOperation::arc("produced", move |_ctx| {
                    let flag = flag.clone();
                    async move {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        flag.store(true, Ordering::SeqCst);
                        Ok(())
                    }
                })
            }
        };

        struct ProducingOp {
            core: OperationCore,
            make_child: Box<dyn Fn() -> OperationRef + Send + Sync>,
        }
        #[async_trait]
        impl Operation for ProducingOp {
            fn core(&self) -> &OperationCore {
                &self.core
            }
            async fn execute(&self) {
                tokio::time::sleep(Duration::from_millis(5)).await;
                let child = (self.make_child)();
                let _ = self.core.produce(child);
                self.core.finish(Vec::new());
            }
        }

        let producer: OperationRef = Arc::<ProducingOp>::new_cyclic(|me| {
            let weak: Weak<dyn Operation> = me.clone();
            ProducingOp {
                core: OperationCore::new("producer", weak),
                make_child: Box::new(grand),
            }
        });

        let group = GroupOperation::new("with-produced", vec![producer]);
        let queue = OperationQueue::default();
        queue.add(group.clone()).expect("admitted");
        group.core().await_finish().await;

        assert!(produced_ran.load(Ordering::SeqCst));
        assert_eq!(group.operations().len(), 2);
        for child in group.operations() {
            assert!(child.is_finished());
        }
    }

    #[tokio::test]
    async fn child_errors_become_fatal() {
        let failing = BlockOperation::arc("failing", |_ctx| async {
            Err(OperationError::fail("simulated"))
        });
        let group = GroupOperation::new("strict", vec![failing]);
        let queue = OperationQueue::default();
        queue.add(group.clone()).expect("admitted");
        group.core().await_finish().await;

        assert!(group.failed());
        assert_eq!(group.errors(), vec![OperationError::fail("simulated")]);
    }

    #[tokio::test]
    async fn recovery_withholds_child_errors() {
        let failing = BlockOperation::arc("failing", |_ctx| async {
            Err(OperationError::fail("simulated"))
        });
        let group = GroupOperation::new("forgiving", vec![failing]);
        group.set_recovery(|_child, _errors| true);

        let queue = OperationQueue::default();
        queue.add(group.clone()).expect("admitted");
        group.core().await_finish().await;

        assert!(group.succeeded());
        assert!(group.fatal_errors().is_empty());
    }

    #[tokio::test]
    async fn cancel_propagates_to_children() {
        let slow = crate::operation::DelayOperation::arc("slow", Duration::from_secs(30));
        let group = GroupOperation::new("doomed", vec![slow.clone()]);

        let queue = OperationQueue::default();
        queue.add(group.clone()).expect("admitted");
        tokio::time::sleep(Duration::from_millis(10)).await;

        group.cancel_with_errors(vec![OperationError::fail("abort")]);
        group.core().await_finish().await;

        assert!(slow.is_cancelled());
        assert!(slow
            .errors()
            .iter()
            .any(|e| matches!(e, OperationError::ParentCancelled { .. })));
        assert!(group.is_cancelled());
    }

    #[tokio::test]
    async fn adds_are_rejected_after_finish() {
        let group = GroupOperation::new("closed", Vec::new());
        let queue = OperationQueue::default();
        queue.add(group.clone()).expect("admitted");
        group.core().await_finish().await;

        let late = flagged("late", Arc::new(AtomicBool::new(false)));
        let err = group.add_operation(late).expect_err("group is closed");
        assert_eq!(err.as_label(), "runtime_group_finishing");
    }
}
