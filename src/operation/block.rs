//! # Closure-backed operation.
//!
//! [`BlockOperation`] wraps a closure `Fnc: FnMut(CancellationToken) -> Fut`.
//! The closure is guarded by a mutex so `execute(&self)` can invoke an
//! `FnMut`; the mutex is held only while the future is created, never while
//! it runs. Use [`BlockOperation::arc`] for a one-liner that returns an
//! [`OperationRef`].

use std::borrow::Cow;
use std::future::Future;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::OperationError;
use crate::operation::{Operation, OperationCore, OperationRef};

/// Operation whose work is a closure returning a future.
///
/// The operation finishes automatically when the future resolves: `Ok(())`
/// finishes clean, `Err(e)` finishes with that error. A closure that calls
/// `finish` itself (e.g. after producing follow-up work) wins; the automatic
/// finish is then a no-op.
///
/// # Example
/// ```
/// use opflow::{BlockOperation, OperationRef};
///
/// let op: OperationRef = BlockOperation::arc("worker", |ctx| async move {
///     if ctx.is_cancelled() {
///         return Ok(());
///     }
///     // do work...
///     Ok(())
/// });
/// ```
pub struct BlockOperation<Fnc, Fut>
where
    Fnc: FnMut(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), OperationError>> + Send + 'static,
{
    core: OperationCore,
    func: Mutex<Fnc>,
}

impl<Fnc, Fut> BlockOperation<Fnc, Fut>
where
    Fnc: FnMut(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), OperationError>> + Send + 'static,
{
    /// Creates the operation and returns it as a shared handle.
    pub fn arc(name: impl Into<Cow<'static, str>>, func: Fnc) -> OperationRef {
        Self::new(name, func)
    }

    /// Creates a new closure-backed operation.
    pub fn new(name: impl Into<Cow<'static, str>>, func: Fnc) -> Arc<Self> {
        Arc::<Self>::new_cyclic(|me| {
            let weak: Weak<dyn Operation> = me.clone();
            Self {
                core: OperationCore::new(name, weak),
                func: Mutex::new(func),
            }
        })
    }
}

#[async_trait]
impl<Fnc, Fut> Operation for BlockOperation<Fnc, Fut>
where
    Fnc: FnMut(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), OperationError>> + Send + 'static,
{
    fn core(&self) -> &OperationCore {
        &self.core
    }

    async fn execute(&self) {
        let fut = {
            let mut func = self.func.lock();
            (*func)(self.core.cancel_token())
        };
        match fut.await {
            Ok(()) => self.core.finish(Vec::new()),
            Err(e) => self.core.finish(vec![e]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationExt;

    #[tokio::test]
    async fn execute_finishes_with_result() {
        let ok = BlockOperation::new("ok", |_ctx| async { Ok(()) });
        ok.execute().await;
        assert!(ok.succeeded());

        let failing = BlockOperation::new("failing", |_ctx| async {
            Err(OperationError::fail("boom"))
        });
        failing.execute().await;
        assert!(failing.failed());
        assert_eq!(failing.errors(), vec![OperationError::fail("boom")]);
    }

    #[tokio::test]
    async fn explicit_finish_wins_over_auto_finish() {
        let op = BlockOperation::new("manual", |_ctx| async { Ok(()) });
        op.core().finish(vec![OperationError::fail("early")]);
        op.execute().await;
        assert_eq!(op.errors(), vec![OperationError::fail("early")]);
    }
}
