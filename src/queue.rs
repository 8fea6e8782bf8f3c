//! # Operation queue.
//!
//! [`OperationQueue`] accepts operations, wires the runtime around them, and
//! hands them to the tokio scheduler. For each admission it installs the
//! internal observers (producer router, finish relays), resolves conditions
//! into an injected evaluator dependency, registers mutual-exclusion
//! categories, notifies the delegate, and spawns a driver task that walks
//! the operation through its lifecycle.
//!
//! The queue owns submitted operations until they finish and never rejects
//! feasible work: an operation cancelled before `add` simply short-circuits
//! to finished without executing.

use std::sync::{Arc, Weak};

use tokio::sync::{watch, Semaphore};
use tracing::{debug, warn};

use crate::cell::Protected;
use crate::conditions::ConditionEvaluator;
use crate::debug::DebugRecord;
use crate::error::{OperationError, RuntimeError};
use crate::exclusivity::ExclusivityManager;
use crate::observer::{Observer, OperationEvent};
use crate::operation::{OperationExt, OperationRef};

/// Scheduling hint attached to a queue. Advisory only.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum QualityOfService {
    #[default]
    Default,
    UserInitiated,
    Utility,
    Background,
}

impl QualityOfService {
    pub fn as_label(&self) -> &'static str {
        match self {
            QualityOfService::Default => "default",
            QualityOfService::UserInitiated => "user_initiated",
            QualityOfService::Utility => "utility",
            QualityOfService::Background => "background",
        }
    }
}

/// Queue configuration.
#[derive(Clone, Debug)]
pub struct QueueConfig {
    /// Queue name, used in logs and debug dumps.
    pub name: String,
    /// Maximum number of operations executing concurrently (0 = unlimited).
    pub max_concurrent: usize,
    /// Advisory quality-of-service hint.
    pub qos: QualityOfService,
    /// Whether the queue starts suspended.
    pub start_suspended: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "opflow.queue".to_string(),
            max_concurrent: 0,
            qos: QualityOfService::Default,
            start_suspended: false,
        }
    }
}

/// Hooks fired around queue bookkeeping. All methods default to no-ops.
pub trait QueueDelegate: Send + Sync + 'static {
    /// The operation passed admission and is about to be dispatched.
    fn will_add(&self, queue: &OperationQueue, operation: &OperationRef) {
        let _ = (queue, operation);
    }

    /// A running operation produced `child`, which is about to be enqueued.
    fn will_produce(
        &self,
        queue: &OperationQueue,
        producer: &OperationRef,
        child: &OperationRef,
    ) {
        let _ = (queue, producer, child);
    }

    /// The operation is finishing; dependents are still blocked.
    fn will_finish(
        &self,
        queue: &OperationQueue,
        operation: &OperationRef,
        errors: &[OperationError],
    ) {
        let _ = (queue, operation, errors);
    }

    /// The operation finished and the queue released ownership.
    fn did_finish(
        &self,
        queue: &OperationQueue,
        operation: &OperationRef,
        errors: &[OperationError],
    ) {
        let _ = (queue, operation, errors);
    }
}

/// Queue that drives operations through their lifecycle on the tokio
/// scheduler.
#[derive(Clone)]
pub struct OperationQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    config: QueueConfig,
    semaphore: Option<Arc<Semaphore>>,
    suspended: watch::Sender<bool>,
    delegate: Protected<Option<Arc<dyn QueueDelegate>>>,
    operations: Protected<Vec<OperationRef>>,
}

impl Default for OperationQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

impl OperationQueue {
    pub fn new(config: QueueConfig) -> Self {
        let semaphore = match config.max_concurrent {
            0 => None,
            n => Some(Arc::new(Semaphore::new(n))),
        };
        let (suspended, _) = watch::channel(config.start_suspended);
        Self {
            inner: Arc::new(QueueInner {
                config,
                semaphore,
                suspended,
                delegate: Protected::new(None),
                operations: Protected::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn qos(&self) -> QualityOfService {
        self.inner.config.qos
    }

    /// Installs the delegate. Replaces any previous one.
    pub fn set_delegate(&self, delegate: Arc<dyn QueueDelegate>) {
        self.inner.delegate.write(|d| *d = Some(delegate));
    }

    /// Stops dispatching ready operations. Work already executing is
    /// unaffected.
    pub fn suspend(&self) {
        let _ = self.inner.suspended.send(true);
    }

    /// Resumes dispatch.
    pub fn resume(&self) {
        let _ = self.inner.suspended.send(false);
    }

    pub fn is_suspended(&self) -> bool {
        *self.inner.suspended.borrow()
    }

    /// Submits one operation.
    pub fn add(&self, operation: OperationRef) -> Result<(), RuntimeError> {
        QueueInner::admit(&self.inner, operation)
    }

    /// Submits a batch of operations, stopping at the first rejection.
    pub fn add_all(
        &self,
        operations: impl IntoIterator<Item = OperationRef>,
    ) -> Result<(), RuntimeError> {
        for operation in operations {
            self.add(operation)?;
        }
        Ok(())
    }

    /// Snapshot of the operations the queue currently owns.
    pub fn operations(&self) -> Vec<OperationRef> {
        self.inner.operations.get()
    }

    /// Resolves once every currently-owned operation has finished,
    /// including any produced along the way.
    pub async fn wait_idle(&self) {
        loop {
            let pending = self.inner.operations.get();
            if pending.is_empty() {
                return;
            }
            for operation in pending {
                operation.core().await_finish().await;
            }
        }
    }

    /// Debug snapshot: queue properties plus records of owned operations.
    pub fn debug_record(&self) -> DebugRecord {
        let mut record = DebugRecord::new(format!("queue '{}'", self.inner.config.name));
        record.push_property("qos", self.inner.config.qos.as_label());
        record.push_property("suspended", self.is_suspended().to_string());
        record.push_property(
            "max_concurrent",
            self.inner.config.max_concurrent.to_string(),
        );
        record.sub_operations = self
            .operations()
            .iter()
            .map(|op| op.debug_record())
            .collect();
        record
    }
}

impl QueueInner {
    /// Admission: duplicate check, internal observers, condition wiring,
    /// delegate notification, then dispatch.
    fn admit(inner: &Arc<QueueInner>, operation: OperationRef) -> Result<(), RuntimeError> {
        if !operation.core().mark_enqueued() {
            return Err(RuntimeError::AlreadyEnqueued {
                name: operation.name().to_string(),
            });
        }
        debug!(queue = %inner.config.name, operation = %operation.name(), "admitting");
        inner.operations.write(|ops| ops.push(operation.clone()));

        operation.add_observer(Arc::new(ProducerRouter {
            queue: Arc::downgrade(inner),
        }));
        operation.add_observer(Arc::new(FinishRelay {
            queue: Arc::downgrade(inner),
        }));

        let conditions = operation.core().conditions();
        if !conditions.is_empty() {
            // Register mutual-exclusion categories; previous holders become
            // dependencies of the evaluator so execution serializes.
            let mut previous = Vec::new();
            for condition in conditions.iter().filter(|c| c.mutually_exclusive()) {
                let category = condition.category();
                if let Some(holder) = ExclusivityManager::shared().acquire(&operation, &category)
                {
                    previous.push(holder);
                }
            }

            let evaluator: OperationRef =
                ConditionEvaluator::new(&operation, conditions.clone());
            let direct = operation.core().dependencies();

            // Indirect dependencies run after the previous category holders
            // and after every direct dependency of the target.
            for condition in &conditions {
                if let Some(indirect) = condition.dependency(&operation) {
                    for holder in &previous {
                        indirect.add_dependency(holder.clone());
                    }
                    for dependency in &direct {
                        indirect.add_dependency(dependency.clone());
                    }
                    evaluator.add_dependency(indirect.clone());
                    // An indirect dependency may be shared and already in
                    // flight; depending on it is enough.
                    if let Err(e) = Self::admit(inner, indirect) {
                        debug!(queue = %inner.config.name, error = %e, "indirect dependency already running");
                    }
                }
            }
            for holder in &previous {
                evaluator.add_dependency(holder.clone());
            }
            for dependency in &direct {
                evaluator.add_dependency(dependency.clone());
            }

            operation.core().set_evaluator(evaluator.clone());
            if let Err(e) = Self::admit(inner, evaluator) {
                warn!(queue = %inner.config.name, error = %e, "condition evaluator rejected");
            }
        }

        let queue = OperationQueue {
            inner: inner.clone(),
        };
        if let Some(delegate) = inner.delegate.get() {
            delegate.will_add(&queue, &operation);
        }
        tokio::spawn(Self::drive(inner.clone(), operation));
        Ok(())
    }

    /// Walks one operation through its lifecycle.
    async fn drive(inner: Arc<QueueInner>, operation: OperationRef) {
        let core = operation.core();
        let token = core.cancel_token();

        // Pending: wait for direct dependencies, unless cancellation
        // supervenes.
        tokio::select! {
            _ = token.cancelled() => {}
            _ = Self::wait_dependencies(&operation) => {}
        }

        // Conditions: wait for the injected evaluator; its failures land on
        // the operation and prevent execution.
        if !core.is_cancelled() {
            if let Some(evaluator) = core.evaluator() {
                core.begin_evaluating();
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = evaluator.core().await_finish() => {
                        let failures = evaluator.errors();
                        if !failures.is_empty() {
                            operation.cancel_with_errors(failures);
                        }
                    }
                }
            }
        }

        core.make_ready();
        if core.is_cancelled() {
            core.finish(Vec::new());
            return;
        }

        tokio::select! {
            _ = token.cancelled() => {}
            _ = inner.wait_resumed() => {}
        }

        let permit = match &inner.semaphore {
            Some(semaphore) => tokio::select! {
                _ = token.cancelled() => None,
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            },
            None => None,
        };

        if core.is_cancelled() {
            core.finish(Vec::new());
            return;
        }

        debug!(
            queue = %inner.config.name,
            operation = %operation.name(),
            qos = inner.config.qos.as_label(),
            "dispatching"
        );
        core.begin_executing();
        operation.execute().await;
        // `execute` may finish asynchronously; hold the concurrency slot
        // until the operation is observably finished.
        core.await_finish().await;
        drop(permit);
    }

    /// Waits until every direct dependency is finished, re-snapshotting the
    /// edge list after each pass so edges added while pending are honored.
    async fn wait_dependencies(operation: &OperationRef) {
        loop {
            let pending: Vec<OperationRef> = operation
                .core()
                .dependencies()
                .into_iter()
                .filter(|d| !d.is_finished())
                .collect();
            if pending.is_empty() {
                return;
            }
            for dependency in pending {
                dependency.core().await_finish().await;
            }
        }
    }

    async fn wait_resumed(&self) {
        let mut rx = self.suspended.subscribe();
        let _ = rx.wait_for(|suspended| !*suspended).await;
    }
}

/// Forwards produced children into the queue.
struct ProducerRouter {
    queue: Weak<QueueInner>,
}

impl Observer for ProducerRouter {
    fn on_event(&self, operation: &OperationRef, event: &OperationEvent) {
        let OperationEvent::DidProduce { child } = event else {
            return;
        };
        let Some(inner) = self.queue.upgrade() else {
            warn!(operation = %operation.name(), "produced operation dropped; queue is gone");
            return;
        };
        let queue = OperationQueue {
            inner: inner.clone(),
        };
        if let Some(delegate) = inner.delegate.get() {
            delegate.will_produce(&queue, operation, child);
        }
        if let Err(e) = queue.add(child.clone()) {
            warn!(
                operation = %operation.name(),
                error = %e,
                "produced operation rejected"
            );
        }
    }
}

/// Relays finish events to the delegate and releases queue ownership.
struct FinishRelay {
    queue: Weak<QueueInner>,
}

impl Observer for FinishRelay {
    fn on_event(&self, operation: &OperationRef, event: &OperationEvent) {
        let Some(inner) = self.queue.upgrade() else {
            return;
        };
        let queue = OperationQueue {
            inner: inner.clone(),
        };
        match event {
            OperationEvent::WillFinish { errors } => {
                if let Some(delegate) = inner.delegate.get() {
                    delegate.will_finish(&queue, operation, errors);
                }
            }
            OperationEvent::DidFinish { errors } => {
                if let Some(delegate) = inner.delegate.get() {
                    delegate.did_finish(&queue, operation, errors);
                }
                let id = operation.id();
                inner.operations.write(|ops| ops.retain(|op| op.id() != id));
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::{FalseCondition, NoFailedDependencies};
    use crate::operation::BlockOperation;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    fn tracked(name: &'static str, flag: Arc<AtomicBool>) -> OperationRef {
        BlockOperation::arc(name, move |_ctx| {
            let flag = flag.clone();
            async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn executes_and_finishes_clean() {
        let queue = OperationQueue::default();
        let executed = Arc::new(AtomicBool::new(false));
        let op = tracked("basic", executed.clone());

        queue.add(op.clone()).expect("admitted");
        op.core().await_finish().await;

        assert!(executed.load(Ordering::SeqCst));
        assert!(op.succeeded());
        assert!(queue.operations().is_empty());
    }

    #[tokio::test]
    async fn double_add_is_detected() {
        let queue = OperationQueue::default();
        let op = tracked("dup", Arc::new(AtomicBool::new(false)));

        queue.add(op.clone()).expect("first add");
        let err = queue.add(op.clone()).expect_err("second add rejected");
        assert_eq!(err.as_label(), "runtime_already_enqueued");

        op.core().await_finish().await;
    }

    #[tokio::test]
    async fn dependencies_run_first() {
        let queue = OperationQueue::default();
        let order = Arc::new(Protected::new(Vec::new()));

        let mk = |name: &'static str, order: Arc<Protected<Vec<&'static str>>>| {
            BlockOperation::arc(name, move |_ctx| {
                let order = order.clone();
                async move {
                    order.write(|o| o.push(name));
                    Ok(())
                }
            })
        };

        let first = mk("first", order.clone());
        let second = mk("second", order.clone());
        second.add_dependency(first.clone());

        // submit the dependent first to prove ordering comes from the edge
        queue.add(second.clone()).expect("admitted");
        queue.add(first.clone()).expect("admitted");
        second.core().await_finish().await;

        assert_eq!(order.get(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn cancelled_before_add_short_circuits() {
        let queue = OperationQueue::default();
        let executed = Arc::new(AtomicBool::new(false));
        let op = tracked("cancelled", executed.clone());

        op.cancel();
        queue.add(op.clone()).expect("admission never rejects");
        op.core().await_finish().await;

        assert!(!executed.load(Ordering::SeqCst));
        assert!(op.is_finished());
        assert!(!op.failed());
    }

    #[tokio::test]
    async fn suspended_queue_defers_dispatch() {
        let queue = OperationQueue::new(QueueConfig {
            start_suspended: true,
            ..QueueConfig::default()
        });
        let executed = Arc::new(AtomicBool::new(false));
        let op = tracked("deferred", executed.clone());

        queue.add(op.clone()).expect("admitted");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!executed.load(Ordering::SeqCst));

        queue.resume();
        op.core().await_finish().await;
        assert!(executed.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn max_concurrent_bounds_parallelism() {
        let queue = OperationQueue::new(QueueConfig {
            max_concurrent: 1,
            ..QueueConfig::default()
        });
        let in_flight = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicBool::new(false));

        let mut ops = Vec::new();
        for i in 0..3 {
            let in_flight = in_flight.clone();
            let overlapped = overlapped.clone();
            let op = BlockOperation::arc(format!("bounded-{i}"), move |_ctx| {
                let in_flight = in_flight.clone();
                let overlapped = overlapped.clone();
                async move {
                    if in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
                        overlapped.store(true, Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            });
            queue.add(op.clone()).expect("admitted");
            ops.push(op);
        }
        for op in &ops {
            op.core().await_finish().await;
        }

        assert!(!overlapped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn failed_condition_prevents_execution() {
        let queue = OperationQueue::default();
        let executed = Arc::new(AtomicBool::new(false));
        let op = tracked("gated", executed.clone());
        op.add_condition(Arc::new(FalseCondition));

        queue.add(op.clone()).expect("admitted");
        op.core().await_finish().await;

        assert!(!executed.load(Ordering::SeqCst));
        assert!(op.is_cancelled());
        assert!(op.failed());
        assert!(op.errors().iter().any(|e| e.is_condition_failure()));
    }

    #[tokio::test]
    async fn failed_dependency_condition_reports_failed_dependencies() {
        let queue = OperationQueue::default();
        let failing = BlockOperation::arc("failing", |_ctx| async {
            Err(OperationError::fail("simulated"))
        });
        let executed = Arc::new(AtomicBool::new(false));
        let target = tracked("guarded", executed.clone());
        target.add_dependency(failing.clone());
        target.add_condition(Arc::new(NoFailedDependencies));

        queue.add(target.clone()).expect("admitted");
        queue.add(failing.clone()).expect("admitted");
        target.core().await_finish().await;

        assert!(!executed.load(Ordering::SeqCst));
        assert!(target
            .errors()
            .contains(&OperationError::FailedDependencies));
    }

    #[tokio::test]
    async fn wait_idle_covers_produced_work() {
        struct Producing {
            core: crate::operation::OperationCore,
        }
        #[async_trait::async_trait]
        impl crate::operation::Operation for Producing {
            fn core(&self) -> &crate::operation::OperationCore {
                &self.core
            }
            async fn execute(&self) {
                let child = BlockOperation::arc("spawned", |_ctx| async {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(())
                });
                self.core.produce(child).expect("still executing");
                self.core.finish(Vec::new());
            }
        }

        let producer: OperationRef = Arc::<Producing>::new_cyclic(|me| {
            let weak: Weak<dyn crate::operation::Operation> = me.clone();
            Producing {
                core: crate::operation::OperationCore::new("producer", weak),
            }
        });

        let queue = OperationQueue::default();
        queue.add(producer).expect("admitted");
        queue.wait_idle().await;
        assert!(queue.operations().is_empty());
    }

    #[tokio::test]
    async fn delegate_sees_each_phase_once() {
        #[derive(Default)]
        struct CountingDelegate {
            will_add: AtomicUsize,
            will_finish: AtomicUsize,
            did_finish: AtomicUsize,
        }
        impl QueueDelegate for CountingDelegate {
            fn will_add(&self, _q: &OperationQueue, _op: &OperationRef) {
                self.will_add.fetch_add(1, Ordering::SeqCst);
            }
            fn will_finish(
                &self,
                _q: &OperationQueue,
                _op: &OperationRef,
                _errors: &[OperationError],
            ) {
                self.will_finish.fetch_add(1, Ordering::SeqCst);
            }
            fn did_finish(
                &self,
                _q: &OperationQueue,
                _op: &OperationRef,
                _errors: &[OperationError],
            ) {
                self.did_finish.fetch_add(1, Ordering::SeqCst);
            }
        }

        let queue = OperationQueue::default();
        let delegate = Arc::new(CountingDelegate::default());
        queue.set_delegate(delegate.clone());

        let op = tracked("delegated", Arc::new(AtomicBool::new(false)));
        queue.add(op.clone()).expect("admitted");
        op.core().await_finish().await;

        assert_eq!(delegate.will_add.load(Ordering::SeqCst), 1);
        assert_eq!(delegate.will_finish.load(Ordering::SeqCst), 1);
        assert_eq!(delegate.did_finish.load(Ordering::SeqCst), 1);
    }
}
