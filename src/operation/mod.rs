//! # Operation abstraction and basic implementations.
//!
//! An operation is a unit of asynchronous work with a lifecycle, dependency
//! edges, pre-flight conditions, observers, and an error list. The
//! [`Operation`] trait is the capability interface; all shared machinery
//! lives in the embedded [`OperationCore`]. [`OperationExt`] puts the core's
//! surface directly onto any operation handle.
//!
//! [`BlockOperation`] wraps a closure and is the workhorse implementation;
//! [`DelayOperation`] finishes after a duration elapses.

mod block;
mod core;
mod delay;
mod state;

pub use self::block::BlockOperation;
pub use self::core::{OperationCore, UserIntent};
pub use self::delay::DelayOperation;
pub use self::state::State;

use std::sync::Arc;

use async_trait::async_trait;

use crate::conditions::Condition;
use crate::debug::DebugRecord;
use crate::error::{OperationError, RuntimeError};
use crate::observer::Observer;

/// Shared handle to an operation object.
pub type OperationRef = Arc<dyn Operation>;

/// # A unit of asynchronous work.
///
/// Implementors embed an [`OperationCore`] and expose it through
/// [`core`](Operation::core); the queue drives the lifecycle and invokes
/// [`execute`](Operation::execute) exactly once, after dependencies have
/// finished and conditions are satisfied.
///
/// `execute` must arrange for `core().finish(..)` to be called, not
/// necessarily before returning: the operation stays `Executing` until the
/// finish event arrives. Long-running work should select on
/// `core().cancel_token()` and finish promptly once it trips.
#[async_trait]
pub trait Operation: Send + Sync + 'static {
    /// The embedded state machine.
    fn core(&self) -> &OperationCore;

    /// The work hook. Runs at most once.
    async fn execute(&self);

    /// Cancels the operation, recording `errors` against it.
    ///
    /// Compound operations override this to propagate cancellation into the
    /// work they own (group children, a retry's in-flight attempt) before
    /// delegating to the core.
    fn cancel_with_errors(&self, errors: Vec<OperationError>) {
        self.core().cancel(errors);
    }

    /// Debug snapshot of this operation. Compound operations override to
    /// include their sub-operations.
    fn debug_record(&self) -> DebugRecord {
        self.core().debug_record()
    }
}

/// Core surface lifted onto every operation handle.
pub trait OperationExt: Operation {
    fn id(&self) -> u64 {
        self.core().id()
    }

    fn name(&self) -> &str {
        self.core().name()
    }

    fn state(&self) -> State {
        self.core().state()
    }

    fn is_cancelled(&self) -> bool {
        self.core().is_cancelled()
    }

    fn is_finished(&self) -> bool {
        self.core().is_finished()
    }

    /// `finished ∧ errors.nonEmpty`.
    fn failed(&self) -> bool {
        self.core().failed()
    }

    /// `finished ∧ ¬cancelled ∧ errors.empty`.
    fn succeeded(&self) -> bool {
        self.core().succeeded()
    }

    fn errors(&self) -> Vec<OperationError> {
        self.core().errors()
    }

    fn add_dependency(&self, dependency: OperationRef) {
        self.core().add_dependency(dependency);
    }

    fn remove_dependency(&self, dependency: &OperationRef) {
        self.core().remove_dependency(dependency);
    }

    fn add_condition(&self, condition: Arc<dyn Condition>) {
        self.core().add_condition(condition);
    }

    fn add_observer(&self, observer: Arc<dyn Observer>) {
        self.core().add_observer(observer);
    }

    /// Cancels without errors.
    fn cancel(&self) {
        self.cancel_with_errors(Vec::new());
    }

    /// Emits a child operation toward the enclosing queue.
    fn produce(&self, child: OperationRef) -> Result<(), RuntimeError> {
        self.core().produce(child)
    }
}

impl<T: Operation + ?Sized> OperationExt for T {}
