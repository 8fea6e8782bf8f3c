//! # Host application-state hook.
//!
//! The runtime does not integrate with any platform's background-task API;
//! it only consumes [`AppStateSource`] and offers [`BackgroundObserver`],
//! which keeps a host-managed background task open while an operation
//! executes with the application out of the foreground.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use crate::cell::Protected;
use crate::observer::{Observer, OperationEvent};
use crate::operation::OperationRef;

/// Foreground/background state of the host application.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppState {
    Active,
    Background,
}

/// Token identifying a host background task.
pub type BackgroundTaskId = u64;

/// Interface the host supplies: current state, a state-change stream, and
/// begin/end background-task hooks.
pub trait AppStateSource: Send + Sync + 'static {
    fn current_state(&self) -> AppState;

    /// Watch channel carrying state transitions.
    fn state_changes(&self) -> watch::Receiver<AppState>;

    /// Asks the host for extra execution time; returns a token.
    fn begin_background_task(&self) -> BackgroundTaskId;

    /// Returns a previously-acquired token.
    fn end_background_task(&self, id: BackgroundTaskId);
}

/// Observer that opens a host background task while its operation executes
/// in the background, and closes it on return to foreground or on finish.
pub struct BackgroundObserver {
    source: Arc<dyn AppStateSource>,
    active: Arc<Protected<Option<BackgroundTaskId>>>,
}

impl BackgroundObserver {
    pub fn new(source: Arc<dyn AppStateSource>) -> Self {
        Self {
            source,
            active: Arc::new(Protected::new(None)),
        }
    }

    fn begin_if_needed(source: &Arc<dyn AppStateSource>, active: &Protected<Option<BackgroundTaskId>>) {
        let already = active.read(|a| a.is_some());
        if already {
            return;
        }
        let id = source.begin_background_task();
        active.write(|a| *a = Some(id));
        debug!(task = id, "background task begun");
    }

    fn end_if_needed(source: &Arc<dyn AppStateSource>, active: &Protected<Option<BackgroundTaskId>>) {
        if let Some(id) = active.write(|a| a.take()) {
            source.end_background_task(id);
            debug!(task = id, "background task ended");
        }
    }
}

impl Observer for BackgroundObserver {
    fn on_event(&self, operation: &OperationRef, event: &OperationEvent) {
        match event {
            OperationEvent::WillExecute => {
                if self.source.current_state() == AppState::Background {
                    Self::begin_if_needed(&self.source, &self.active);
                }
                // Track transitions for the lifetime of the execution.
                let source = self.source.clone();
                let active = self.active.clone();
                let mut states = self.source.state_changes();
                let mut finished = operation.core().finished_signal();
                tokio::spawn(async move {
                    loop {
                        let done = tokio::select! {
                            _ = finished.wait_for(|done| *done) => true,
                            changed = states.changed() => changed.is_err(),
                        };
                        if done {
                            break;
                        }
                        match *states.borrow() {
                            AppState::Background => Self::begin_if_needed(&source, &active),
                            AppState::Active => Self::end_if_needed(&source, &active),
                        }
                    }
                    Self::end_if_needed(&source, &active);
                });
            }
            OperationEvent::DidFinish { .. } => {
                Self::end_if_needed(&self.source, &self.active);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{BlockOperation, OperationExt};
    use crate::queue::OperationQueue;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    struct TestSource {
        state: watch::Sender<AppState>,
        begun: AtomicU64,
        ended: AtomicU64,
    }

    impl TestSource {
        fn new(initial: AppState) -> Arc<Self> {
            let (state, _) = watch::channel(initial);
            Arc::new(Self {
                state,
                begun: AtomicU64::new(0),
                ended: AtomicU64::new(0),
            })
        }
    }

    impl AppStateSource for TestSource {
        fn current_state(&self) -> AppState {
            *self.state.borrow()
        }

        fn state_changes(&self) -> watch::Receiver<AppState> {
            self.state.subscribe()
        }

        fn begin_background_task(&self) -> BackgroundTaskId {
            self.begun.fetch_add(1, Ordering::SeqCst) + 1
        }

        fn end_background_task(&self, _id: BackgroundTaskId) {
            self.ended.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn backgrounded_execution_opens_and_closes_a_task() {
        let source = TestSource::new(AppState::Background);
        let queue = OperationQueue::default();
        let op = BlockOperation::arc("bg", |_ctx| async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(())
        });
        op.add_observer(Arc::new(BackgroundObserver::new(source.clone())));

        queue.add(op.clone()).expect("admitted");
        op.core().await_finish().await;

        assert_eq!(source.begun.load(Ordering::SeqCst), 1);
        assert_eq!(source.ended.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn foreground_execution_needs_no_task() {
        let source = TestSource::new(AppState::Active);
        let queue = OperationQueue::default();
        let op = BlockOperation::arc("fg", |_ctx| async { Ok(()) });
        op.add_observer(Arc::new(BackgroundObserver::new(source.clone())));

        queue.add(op.clone()).expect("admitted");
        op.core().await_finish().await;

        assert_eq!(source.begun.load(Ordering::SeqCst), 0);
        assert_eq!(source.ended.load(Ordering::SeqCst), 0);
    }
}
