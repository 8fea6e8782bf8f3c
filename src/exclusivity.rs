//! # Process-wide mutual exclusion by category.
//!
//! [`ExclusivityManager`] is a singleton mapping category names to the FIFO
//! of operations currently holding or awaiting that category. Queues call
//! [`acquire`](ExclusivityManager::acquire) during admission; the returned
//! previous holder becomes a dependency of the new operation, which is what
//! actually serializes execution. A release observer is installed on the
//! acquiring operation so the slot frees itself on `DidFinish`.
//!
//! All registry access is funneled through one mutex, so a release can never
//! reorder with a subsequent acquire for the same category.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::observer::{Observer, OperationEvent};
use crate::operation::{Operation, OperationExt, OperationRef};

/// Registry serializing operations by category, process-wide.
pub struct ExclusivityManager {
    categories: Mutex<HashMap<String, Vec<(u64, Weak<dyn Operation>)>>>,
}

impl ExclusivityManager {
    /// The process-wide instance, initialized on first use.
    pub fn shared() -> &'static ExclusivityManager {
        static SHARED: OnceLock<ExclusivityManager> = OnceLock::new();
        SHARED.get_or_init(|| ExclusivityManager {
            categories: Mutex::new(HashMap::new()),
        })
    }

    /// Appends `operation` to the category FIFO and returns the previous
    /// tail, which the caller must register as a dependency.
    ///
    /// Installs a `DidFinish` observer on `operation` that releases the slot.
    pub fn acquire(&self, operation: &OperationRef, category: &str) -> Option<OperationRef> {
        let previous = {
            let mut categories = self.categories.lock();
            let entries = categories.entry(category.to_owned()).or_default();
            let previous = entries.iter().rev().find_map(|(_, weak)| weak.upgrade());
            entries.push((operation.id(), Arc::downgrade(operation)));
            previous
        };
        operation.add_observer(Arc::new(ReleaseOnFinish {
            category: category.to_owned(),
        }));
        debug!(
            category,
            operation = %operation.name(),
            has_previous = previous.is_some(),
            "exclusivity acquired"
        );
        previous
    }

    /// Removes the operation from the category FIFO. Idempotent.
    pub fn release(&self, operation_id: u64, category: &str) {
        let mut categories = self.categories.lock();
        if let Some(entries) = categories.get_mut(category) {
            entries.retain(|(id, _)| *id != operation_id);
            if entries.is_empty() {
                categories.remove(category);
            }
        }
    }

    /// Number of live holders/waiters registered under `category`.
    pub fn holders(&self, category: &str) -> usize {
        self.categories
            .lock()
            .get(category)
            .map(|entries| entries.iter().filter(|(_, w)| w.upgrade().is_some()).count())
            .unwrap_or(0)
    }

    /// Test-only teardown: forgets every category.
    #[doc(hidden)]
    pub fn reset(&self) {
        self.categories.lock().clear();
    }
}

struct ReleaseOnFinish {
    category: String,
}

impl Observer for ReleaseOnFinish {
    fn on_event(&self, operation: &OperationRef, event: &OperationEvent) {
        if matches!(event, OperationEvent::DidFinish { .. }) {
            ExclusivityManager::shared().release(operation.id(), &self.category);
            debug!(category = %self.category, operation = %operation.name(), "exclusivity released");
        }
    }
}
