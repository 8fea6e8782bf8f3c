//! # Shared state machine backing every operation.
//!
//! [`OperationCore`] is the composition seam of the runtime: each concrete
//! operation type (block, delay, group, retry, condition evaluator) embeds
//! one and exposes it through [`Operation::core`](super::Operation::core).
//! It owns identity, the lifecycle [`State`], the sticky cancellation flag,
//! dependency edges, conditions, observers, the error list, and the finish
//! rendezvous that dependents await.
//!
//! Observer callbacks are dispatched synchronously with no internal lock
//! held; state snapshots are cloned out first.

use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::cell::Protected;
use crate::conditions::Condition;
use crate::debug::DebugRecord;
use crate::error::{OperationError, RuntimeError};
use crate::observer::{Observer, OperationEvent};
use crate::operation::{Operation, OperationExt, OperationRef, State};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Hint describing why the work exists, propagated to produced children.
///
/// Ordered so that propagation can only raise a child's intent, never lower
/// it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum UserIntent {
    /// No particular intent (default).
    #[default]
    None,
    /// Work performed on the user's behalf but not awaited by them.
    SideEffect,
    /// Work the user explicitly asked for and is waiting on.
    Initiated,
}

/// State machine and shared data for one operation.
pub struct OperationCore {
    id: u64,
    name: Cow<'static, str>,
    this: Weak<dyn Operation>,
    state: Protected<State>,
    cancelled: AtomicBool,
    internal: AtomicBool,
    token: CancellationToken,
    errors: Protected<Vec<OperationError>>,
    observers: Protected<Vec<Arc<dyn Observer>>>,
    dependencies: Protected<Vec<OperationRef>>,
    conditions: Protected<Vec<Arc<dyn Condition>>>,
    evaluator: Protected<Option<OperationRef>>,
    user_intent: Protected<UserIntent>,
    finished: watch::Sender<bool>,
}

impl OperationCore {
    /// Creates a core for the operation `this` is being constructed as.
    ///
    /// Concrete operation types call this from `Arc::new_cyclic` so the core
    /// can hand its own reference to observers.
    pub fn new(name: impl Into<Cow<'static, str>>, this: Weak<dyn Operation>) -> Self {
        let (finished, _) = watch::channel(false);
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            this,
            state: Protected::new(State::Initialized),
            cancelled: AtomicBool::new(false),
            internal: AtomicBool::new(false),
            token: CancellationToken::new(),
            errors: Protected::default(),
            observers: Protected::default(),
            dependencies: Protected::default(),
            conditions: Protected::default(),
            evaluator: Protected::new(None),
            user_intent: Protected::default(),
            finished,
        }
    }

    /// Process-unique identity.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Human-readable name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        self.state.get()
    }

    /// Whether `cancel` has been called. Sticky.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Whether the operation reached its terminal state.
    pub fn is_finished(&self) -> bool {
        self.state.get() == State::Finished
    }

    /// `finished ∧ errors.nonEmpty`.
    pub fn failed(&self) -> bool {
        self.is_finished() && self.errors.read(|e| !e.is_empty())
    }

    /// `finished ∧ ¬cancelled ∧ errors.empty`.
    pub fn succeeded(&self) -> bool {
        self.is_finished() && !self.is_cancelled() && self.errors.read(|e| e.is_empty())
    }

    /// Snapshot of the accumulated errors.
    pub fn errors(&self) -> Vec<OperationError> {
        self.errors.get()
    }

    /// Token tripped by cancellation; work hooks select on it.
    pub fn cancel_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Current user-intent hint.
    pub fn user_intent(&self) -> UserIntent {
        self.user_intent.get()
    }

    /// Sets the user-intent hint.
    pub fn set_user_intent(&self, intent: UserIntent) {
        self.user_intent.write(|i| *i = intent);
    }

    /// Raises the intent to `intent` if it is higher than the current hint.
    pub(crate) fn raise_user_intent(&self, intent: UserIntent) {
        self.user_intent.write(|i| {
            if intent > *i {
                *i = intent;
            }
        });
    }

    // ---- graph edges ----

    /// Adds a direct dependency edge. Duplicates (by identity) are ignored.
    pub fn add_dependency(&self, dependency: OperationRef) {
        let dep_id = dependency.core().id();
        if dep_id == self.id {
            return;
        }
        self.dependencies.write(|deps| {
            if deps.iter().all(|d| d.core().id() != dep_id) {
                deps.push(dependency);
            }
        });
    }

    /// Removes a direct dependency edge by identity. Idempotent.
    pub fn remove_dependency(&self, dependency: &OperationRef) {
        let dep_id = dependency.core().id();
        self.dependencies
            .write(|deps| deps.retain(|d| d.core().id() != dep_id));
    }

    /// Snapshot of the direct dependency edges.
    pub fn dependencies(&self) -> Vec<OperationRef> {
        self.dependencies.get()
    }

    /// Attaches a pre-flight condition. Conditions belong to this operation
    /// until it finishes; attaching after enqueue has no effect on admission.
    pub fn add_condition(&self, condition: Arc<dyn Condition>) {
        self.conditions.write(|c| c.push(condition));
    }

    /// Snapshot of the attached conditions.
    pub fn conditions(&self) -> Vec<Arc<dyn Condition>> {
        self.conditions.get()
    }

    /// Registers an observer and fires `DidAttach` to it.
    pub fn add_observer(&self, observer: Arc<dyn Observer>) {
        self.observers.write(|o| o.push(observer.clone()));
        if let Some(op) = self.this.upgrade() {
            observer.on_event(&op, &OperationEvent::DidAttach);
        }
    }

    // ---- lifecycle ----

    /// Cancels the operation, recording `errors` against it.
    ///
    /// Non-blocking and idempotent; a no-op once finishing has begun. The
    /// operation still transitions through `Finishing → Finished` (driven by
    /// its queue) so observers fire exactly once.
    pub fn cancel(&self, errors: Vec<OperationError>) {
        if self.state.read(|s| *s >= State::Finishing) {
            return;
        }
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(operation = %self.name, id = self.id, "cancelled");
        self.fire_event(OperationEvent::WillCancel {
            errors: errors.clone(),
        });
        if !errors.is_empty() {
            self.errors.write(|e| e.extend(errors));
        }
        self.token.cancel();
        self.fire_event(OperationEvent::DidCancel);
    }

    /// Moves the operation to its terminal state, appending `errors`.
    ///
    /// Fires `WillFinish`, freezes the error list, fires `DidFinish`, then
    /// unblocks dependents. Calling it more than once is a traced no-op.
    pub fn finish(&self, errors: Vec<OperationError>) {
        let proceed = self.state.write(|s| {
            if *s >= State::Finishing {
                false
            } else {
                *s = State::Finishing;
                true
            }
        });
        if !proceed {
            trace!(operation = %self.name, id = self.id, "finish ignored; already finishing");
            return;
        }
        if !errors.is_empty() {
            self.errors.write(|e| e.extend(errors));
        }
        let errors = self.errors.get();
        debug!(
            operation = %self.name,
            id = self.id,
            error_count = errors.len(),
            cancelled = self.is_cancelled(),
            "finishing"
        );
        self.fire_event(OperationEvent::WillFinish {
            errors: errors.clone(),
        });
        self.state.write(|s| *s = State::Finished);
        self.fire_event(OperationEvent::DidFinish { errors });
        let _ = self.finished.send(true);
    }

    /// Emits `child` toward the enclosing queue via the `DidProduce` event.
    ///
    /// Produced children are not dependencies of their producer. The child
    /// inherits the producer's user intent at this moment and is never
    /// retroactively adjusted.
    pub fn produce(&self, child: OperationRef) -> Result<(), RuntimeError> {
        if self.state.read(|s| *s >= State::Finishing) {
            return Err(RuntimeError::ProduceAfterFinish {
                name: self.name.to_string(),
                child: child.name().to_string(),
            });
        }
        child.core().raise_user_intent(self.user_intent());
        self.fire_event(OperationEvent::DidProduce { child });
        Ok(())
    }

    /// Resolves once the operation is observably finished.
    pub async fn await_finish(&self) {
        if self.is_finished() {
            return;
        }
        let mut rx = self.finished.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Receiver on the finish rendezvous, for callers that need to select.
    pub fn finished_signal(&self) -> watch::Receiver<bool> {
        self.finished.subscribe()
    }

    // ---- queue-driven transitions ----

    /// `Initialized → Pending`; false if the operation was already enqueued.
    pub(crate) fn mark_enqueued(&self) -> bool {
        self.state.write(|s| {
            if *s == State::Initialized {
                *s = State::Pending;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn begin_evaluating(&self) {
        self.advance(State::EvaluatingConditions);
    }

    pub(crate) fn make_ready(&self) {
        if !self.is_cancelled() {
            self.advance(State::Ready);
        }
    }

    /// `Ready → Executing`; fires `WillExecute` before the work hook runs.
    pub(crate) fn begin_executing(&self) {
        self.advance(State::Executing);
        self.fire_event(OperationEvent::WillExecute);
    }

    pub(crate) fn set_evaluator(&self, evaluator: OperationRef) {
        self.evaluator.write(|e| *e = Some(evaluator));
    }

    pub(crate) fn evaluator(&self) -> Option<OperationRef> {
        self.evaluator.get()
    }

    /// Marks runtime-synthesized operations (evaluators, group barriers) so
    /// group bookkeeping can skip them.
    pub(crate) fn set_internal(&self) {
        self.internal.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_internal(&self) -> bool {
        self.internal.load(Ordering::SeqCst)
    }

    /// Dispatches `event` to all observers in registration order.
    pub(crate) fn fire_event(&self, event: OperationEvent) {
        let Some(op) = self.this.upgrade() else {
            return;
        };
        let observers = self.observers.get();
        for observer in &observers {
            observer.on_event(&op, &event);
        }
    }

    fn advance(&self, to: State) -> bool {
        let moved = self.state.write(|s| {
            if to > *s {
                *s = to;
                true
            } else {
                false
            }
        });
        if moved {
            trace!(operation = %self.name, id = self.id, state = to.as_label(), "state");
        }
        moved
    }

    // ---- introspection ----

    /// Builds the debug record for this operation and its dependency tree.
    pub fn debug_record(&self) -> DebugRecord {
        self.debug_record_at(0)
    }

    pub(crate) fn debug_record_at(&self, depth: usize) -> DebugRecord {
        let mut record = DebugRecord::new(format!("{} #{}", self.name, self.id));
        record.push_property("state", self.state().as_label());
        record.push_property("cancelled", self.is_cancelled().to_string());
        record.push_property("errors", self.errors.read(|e| e.len()).to_string());
        record.conditions = self
            .conditions
            .read(|c| c.iter().map(|c| c.name().to_string()).collect());
        if depth < DebugRecord::DEPTH_CAP {
            record.dependencies = self
                .dependencies
                .get()
                .iter()
                .map(|d| d.core().debug_record_at(depth + 1))
                .collect();
        } else if !self.dependencies.read(|d| d.is_empty()) {
            record.dependencies = vec![DebugRecord::new("…")];
        }
        record
    }
}
