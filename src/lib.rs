//! # opflow
//!
//! **Opflow** is an operation runtime: a work-scheduling library built
//! around composable units of async work.
//!
//! An operation carries a lifecycle, dependency edges, pre-flight
//! conditions, observers, and an error list. Submit it to a queue and the
//! runtime enforces dependency ordering, evaluates conditions
//! asynchronously, serializes mutually-exclusive categories process-wide,
//! propagates cancellation, routes dynamically-produced children back to
//! the queue, composes recursive groups, and retries failed work with
//! configurable delay strategies.
//!
//! ## Features
//!
//! | Area            | Description                                                      | Key types / traits                           |
//! |-----------------|------------------------------------------------------------------|----------------------------------------------|
//! | **Operations**  | Define work as closures or custom types with a shared lifecycle. | [`Operation`], [`BlockOperation`], [`OperationCore`] |
//! | **Queues**      | Submit, suspend, bound concurrency, observe via a delegate.      | [`OperationQueue`], [`QueueDelegate`]        |
//! | **Conditions**  | Gate execution on async predicates and dependency health.        | [`Condition`], [`NoFailedDependencies`]      |
//! | **Exclusivity** | Serialize work by category across the whole process.             | [`ExclusivityManager`], [`MutuallyExclusive`] |
//! | **Observers**   | Hook into lifecycle events (logging, timeouts, custom).          | [`Observer`], [`BlockObserver`]              |
//! | **Groups**      | Run child operations on a private queue; finish when they do.    | [`GroupOperation`]                           |
//! | **Retries**     | Re-attempt generator-produced work with backoff.                 | [`RetryOperation`], [`DelayStrategy`]        |
//! | **Errors**      | Typed errors for the runtime and for operations.                 | [`RuntimeError`], [`OperationError`]         |
//!
//! ```no_run
//! use opflow::{BlockOperation, Operation, OperationExt, OperationQueue};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let queue = OperationQueue::default();
//!
//!     let fetch = BlockOperation::arc("fetch", |ctx| async move {
//!         if ctx.is_cancelled() {
//!             return Ok(());
//!         }
//!         // do work...
//!         Ok(())
//!     });
//!     let report = BlockOperation::arc("report", |_ctx| async move {
//!         println!("fetch finished, reporting");
//!         Ok(())
//!     });
//!     report.add_dependency(fetch.clone());
//!
//!     queue.add(report.clone())?;
//!     queue.add(fetch)?;
//!     report.core().await_finish().await;
//!     Ok(())
//! }
//! ```
//!
//! ---

mod background;
mod cell;
mod clock;
mod conditions;
mod debug;
mod error;
mod exclusivity;
mod group;
mod observer;
mod operation;
mod queue;
mod retry;

// ---- Public re-exports ----

pub use background::{AppState, AppStateSource, BackgroundObserver, BackgroundTaskId};
pub use cell::Protected;
pub use clock::{Clock, DelayStrategy, FakeClock, SystemClock};
pub use conditions::{
    BlockCondition, ComposedCondition, Condition, ConditionResult, FalseCondition,
    MutuallyExclusive, NegatedCondition, NoFailedDependencies, SilentCondition, TrueCondition,
};
pub use debug::{dump, DebugRecord, DebugSink, TracingSink};
pub use error::{OperationError, RuntimeError};
pub use exclusivity::ExclusivityManager;
pub use group::GroupOperation;
pub use observer::{
    BlockObserver, CompositeObserver, Observer, OperationEvent, TimeoutObserver,
};
pub use operation::{
    BlockOperation, DelayOperation, Operation, OperationCore, OperationExt, OperationRef, State,
    UserIntent,
};
pub use queue::{OperationQueue, QualityOfService, QueueConfig, QueueDelegate};
pub use retry::{RetryBuilder, RetryFailureInfo, RetryOperation, RetryPayload};
