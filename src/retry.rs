//! # Retry operation.
//!
//! [`RetryOperation`] re-attempts failing work. A generator yields payloads
//! (an operation plus an optional delay and configure hook); a policy
//! callback inspects each failure and either accepts the recommended next
//! payload, substitutes its own, or stops. Attempts run on a private queue;
//! delays come from the payload or from the configured [`DelayStrategy`]
//! against the monotonic clock.
//!
//! A successful attempt finishes the retry clean. Exhaustion (generator dry,
//! policy stop, or the attempt cap) surfaces the last attempt's errors;
//! earlier failures accumulate in the historical error list.

use std::borrow::Cow;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::cell::Protected;
use crate::clock::{Clock, DelayStrategy, SystemClock};
use crate::error::OperationError;
use crate::operation::{Operation, OperationCore, OperationExt, OperationRef};
use crate::queue::{OperationQueue, QueueConfig};

/// One unit the generator yields: the next attempt and how to run it.
pub struct RetryPayload {
    /// Wait before the attempt starts. `None` defers to the delay strategy.
    pub delay: Option<Duration>,
    /// The operation to run.
    pub operation: OperationRef,
    /// Hook applied to the operation just before it is enqueued.
    pub configure: Option<Box<dyn FnOnce(&OperationRef) + Send>>,
}

impl RetryPayload {
    /// Payload with no explicit delay and no configure hook.
    pub fn new(operation: OperationRef) -> Self {
        Self {
            delay: None,
            operation,
            configure: None,
        }
    }
}

/// Failure snapshot handed to the policy callback.
#[derive(Clone, Debug)]
pub struct RetryFailureInfo {
    /// Attempts started so far.
    pub count: u32,
    /// Errors from the most recent attempt.
    pub errors: Vec<OperationError>,
    /// Union of all prior attempts' errors.
    pub historical_errors: Vec<OperationError>,
}

type Generator = Box<dyn FnMut() -> Option<RetryPayload> + Send>;
type Policy = Box<dyn FnMut(&RetryFailureInfo, RetryPayload) -> Option<RetryPayload> + Send>;

/// Builder for [`RetryOperation`] with fluent configuration.
pub struct RetryBuilder {
    name: Cow<'static, str>,
    generator: Generator,
    policy: Policy,
    max_count: Option<u32>,
    strategy: DelayStrategy,
    clock: Arc<dyn Clock>,
}

impl RetryBuilder {
    /// Accepts the recommended payload on every failure unless overridden.
    pub fn new(
        name: impl Into<Cow<'static, str>>,
        generator: impl FnMut() -> Option<RetryPayload> + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            generator: Box::new(generator),
            policy: Box::new(|_info, recommended| Some(recommended)),
            max_count: None,
            strategy: DelayStrategy::Immediate,
            clock: Arc::new(SystemClock),
        }
    }

    /// Decision callback run after each failed attempt. Returning `None`
    /// stops retrying; returning a payload (the recommended one or a
    /// substitute) schedules it.
    pub fn with_policy(
        mut self,
        policy: impl FnMut(&RetryFailureInfo, RetryPayload) -> Option<RetryPayload> + Send + 'static,
    ) -> Self {
        self.policy = Box::new(policy);
        self
    }

    /// Caps the number of attempts. Unbounded by default.
    pub fn with_max_count(mut self, max_count: u32) -> Self {
        self.max_count = Some(max_count);
        self
    }

    /// Delay strategy used when a payload carries no explicit delay.
    pub fn with_strategy(mut self, strategy: DelayStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Clock consulted by deadline-based strategies.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Arc<RetryOperation> {
        let RetryBuilder {
            name,
            generator,
            policy,
            max_count,
            strategy,
            clock,
        } = self;
        Arc::<RetryOperation>::new_cyclic(|me| {
            let weak: Weak<dyn Operation> = me.clone();
            RetryOperation {
                core: OperationCore::new(name.clone(), weak),
                queue: OperationQueue::new(QueueConfig {
                    name: format!("{name}.retry"),
                    ..QueueConfig::default()
                }),
                generator: Mutex::new(generator),
                policy: Mutex::new(policy),
                counters: Protected::default(),
                current: Protected::new(None),
                max_count,
                strategy,
                clock,
            }
        })
    }
}

#[derive(Default)]
struct RetryCounters {
    count: u32,
    last_errors: Vec<OperationError>,
    historical_errors: Vec<OperationError>,
}

/// Operation that re-attempts generator-produced work until it succeeds,
/// the generator runs dry, the policy stops it, or the attempt cap is hit.
pub struct RetryOperation {
    core: OperationCore,
    queue: OperationQueue,
    generator: Mutex<Generator>,
    policy: Mutex<Policy>,
    counters: Protected<RetryCounters>,
    current: Protected<Option<OperationRef>>,
    max_count: Option<u32>,
    strategy: DelayStrategy,
    clock: Arc<dyn Clock>,
}

impl RetryOperation {
    /// Builder entry point.
    pub fn builder(
        name: impl Into<Cow<'static, str>>,
        generator: impl FnMut() -> Option<RetryPayload> + Send + 'static,
    ) -> RetryBuilder {
        RetryBuilder::new(name, generator)
    }

    /// Attempts started so far.
    pub fn count(&self) -> u32 {
        self.counters.read(|c| c.count)
    }

    /// Errors from the most recent failed attempt.
    pub fn last_errors(&self) -> Vec<OperationError> {
        self.counters.read(|c| c.last_errors.clone())
    }

    /// Union of all prior attempts' errors.
    pub fn historical_errors(&self) -> Vec<OperationError> {
        self.counters.read(|c| c.historical_errors.clone())
    }

    fn next_payload(&self) -> Option<RetryPayload> {
        let mut generator = self.generator.lock();
        (*generator)()
    }
}

#[async_trait]
impl Operation for RetryOperation {
    fn core(&self) -> &OperationCore {
        &self.core
    }

    async fn execute(&self) {
        let token = self.core.cancel_token();
        let mut payload = self.next_payload();

        loop {
            let Some(mut attempt) = payload.take() else {
                let errors = self.counters.read(|c| c.last_errors.clone());
                self.core.finish(errors);
                return;
            };

            let at_cap = self
                .counters
                .read(|c| self.max_count.is_some_and(|max| c.count >= max));
            if at_cap {
                let errors = self.counters.read(|c| c.last_errors.clone());
                self.core.finish(errors);
                return;
            }
            let attempt_no = self.counters.write(|c| {
                c.count += 1;
                c.count
            });

            if let Some(delay) = attempt.delay.filter(|d| *d > Duration::ZERO) {
                debug!(retry = %self.core.name(), attempt = attempt_no, ?delay, "delaying next attempt");
                tokio::select! {
                    _ = token.cancelled() => {
                        self.core.finish(Vec::new());
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            if let Some(configure) = attempt.configure.take() {
                configure(&attempt.operation);
            }
            let operation = attempt.operation;
            self.current.write(|c| *c = Some(operation.clone()));

            if let Err(e) = self.queue.add(operation.clone()) {
                warn!(retry = %self.core.name(), error = %e, "attempt rejected by queue");
                self.core
                    .finish(vec![OperationError::fail(e.to_string())]);
                return;
            }

            tokio::select! {
                _ = token.cancelled() => {
                    operation.cancel();
                    operation.core().await_finish().await;
                    self.current.write(|c| *c = None);
                    self.core.finish(Vec::new());
                    return;
                }
                _ = operation.core().await_finish() => {}
            }
            self.current.write(|c| *c = None);

            let errors = operation.errors();
            if errors.is_empty() {
                debug!(retry = %self.core.name(), attempts = attempt_no, "attempt succeeded");
                self.core.finish(Vec::new());
                return;
            }

            self.counters.write(|c| {
                c.historical_errors.extend(errors.iter().cloned());
                c.last_errors = errors.clone();
            });

            if let Some(max) = self.max_count {
                if attempt_no >= max {
                    debug!(retry = %self.core.name(), attempts = attempt_no, "attempt cap reached");
                    self.core.finish(errors);
                    return;
                }
            }

            let Some(mut recommended) = self.next_payload() else {
                self.core.finish(errors);
                return;
            };
            if recommended.delay.is_none() {
                recommended.delay =
                    Some(self.strategy.delay_after(attempt_no, self.clock.now()));
            }

            let info = RetryFailureInfo {
                count: attempt_no,
                errors: errors.clone(),
                historical_errors: self.counters.read(|c| c.historical_errors.clone()),
            };
            let decision = {
                let mut policy = self.policy.lock();
                (*policy)(&info, recommended)
            };
            match decision {
                Some(next) => payload = Some(next),
                None => {
                    debug!(retry = %self.core.name(), attempts = attempt_no, "policy stopped retrying");
                    self.core.finish(errors);
                    return;
                }
            }
        }
    }

    fn cancel_with_errors(&self, errors: Vec<OperationError>) {
        if let Some(attempt) = self.current.get() {
            attempt.cancel();
        }
        self.core.cancel(errors);
    }
}
