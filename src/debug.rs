//! # Debug snapshots of operations and queues.
//!
//! Any operation or queue can render itself as a [`DebugRecord`]: a
//! description, key/value properties, condition names, and the records of
//! its dependencies and sub-operations. [`DebugRecord::render`] prints the
//! record as an indented tree; recursion is capped at
//! [`DebugRecord::DEPTH_CAP`] levels so mutually-referencing graphs cannot
//! run away.

use tracing::debug;

/// Structured snapshot of one node in the operation graph.
#[derive(Clone, Debug, Default)]
pub struct DebugRecord {
    /// One-line description, typically `name #id`.
    pub description: String,
    /// Key/value details in insertion order.
    pub properties: Vec<(String, String)>,
    /// Names of attached conditions.
    pub conditions: Vec<String>,
    /// Records of direct dependencies.
    pub dependencies: Vec<DebugRecord>,
    /// Records of owned sub-operations (group children, queue contents).
    pub sub_operations: Vec<DebugRecord>,
}

impl DebugRecord {
    /// Maximum nesting depth included when building or rendering records.
    pub const DEPTH_CAP: usize = 8;

    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Self::default()
        }
    }

    /// Appends a property.
    pub fn push_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.push((key.into(), value.into()));
    }

    /// Renders the record as an indented tree.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out, 0);
        out
    }

    fn render_into(&self, out: &mut String, depth: usize) {
        let pad = "  ".repeat(depth);
        out.push_str(&format!("{pad}{}\n", self.description));
        for (key, value) in &self.properties {
            out.push_str(&format!("{pad}  {key}: {value}\n"));
        }
        if !self.conditions.is_empty() {
            out.push_str(&format!("{pad}  conditions: {}\n", self.conditions.join(", ")));
        }
        if depth >= Self::DEPTH_CAP {
            if !self.dependencies.is_empty() || !self.sub_operations.is_empty() {
                out.push_str(&format!("{pad}  …\n"));
            }
            return;
        }
        for dep in &self.dependencies {
            out.push_str(&format!("{pad}  after:\n"));
            dep.render_into(out, depth + 2);
        }
        for sub in &self.sub_operations {
            out.push_str(&format!("{pad}  owns:\n"));
            sub.render_into(out, depth + 2);
        }
    }
}

/// Destination for rendered debug dumps.
///
/// The runtime only consumes this interface; hosts decide where dumps land.
pub trait DebugSink: Send + Sync {
    fn write_record(&self, rendered: &str);
}

/// Sink that emits dumps through `tracing` at debug level.
#[derive(Default)]
pub struct TracingSink;

impl DebugSink for TracingSink {
    fn write_record(&self, rendered: &str) {
        debug!(target: "opflow::dump", "\n{rendered}");
    }
}

/// Renders `record` and hands it to `sink`.
pub fn dump(record: &DebugRecord, sink: &dyn DebugSink) {
    sink.write_record(&record.render());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_shows_properties_and_children() {
        let mut record = DebugRecord::new("fetch #1");
        record.push_property("state", "ready");
        record.conditions.push("NoFailedDependencies".into());
        record.dependencies.push(DebugRecord::new("login #2"));

        let rendered = record.render();
        assert!(rendered.contains("fetch #1"));
        assert!(rendered.contains("state: ready"));
        assert!(rendered.contains("conditions: NoFailedDependencies"));
        assert!(rendered.contains("login #2"));
    }

    #[test]
    fn render_caps_depth() {
        let mut root = DebugRecord::new("level-0");
        let mut cursor = &mut root;
        for level in 1..=DebugRecord::DEPTH_CAP + 2 {
            cursor.dependencies.push(DebugRecord::new(format!("level-{level}")));
            cursor = &mut cursor.dependencies[0];
        }

        let rendered = root.render();
        assert!(rendered.contains("level-1"));
        assert!(!rendered.contains(&format!("level-{}", DebugRecord::DEPTH_CAP + 2)));
        assert!(rendered.contains('…'));
    }

    #[test]
    fn dump_writes_to_the_sink() {
        struct Capture(crate::cell::Protected<String>);
        impl DebugSink for Capture {
            fn write_record(&self, rendered: &str) {
                self.0.write(|s| s.push_str(rendered));
            }
        }

        let sink = Capture(crate::cell::Protected::new(String::new()));
        dump(&DebugRecord::new("node #9"), &sink);
        assert!(sink.0.get().contains("node #9"));
    }
}
