//! Simulated host for `tessera --demo`: a small counter app that commits on
//! a fixed interval.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tessera_runtime::{CommitTiming, HostValue, Inspector, MemoryTree, NodeKey, NodeSpec};
use tracing::{debug, info};

pub const DEFAULT_TICK: Duration = Duration::from_millis(250);

/// The demo's tree plus the handles it mutates.
pub struct DemoApp {
    tree: MemoryTree,
    counter: NodeKey,
    list: NodeKey,
    spinner: NodeKey,
    items: Vec<NodeKey>,
    tick: u64,
}

impl Default for DemoApp {
    fn default() -> Self {
        Self::new()
    }
}

impl DemoApp {
    pub fn new() -> Self {
        let mut tree = MemoryTree::new();
        let root = tree.set_root(
            NodeSpec::named("App")
                .source("src/App.tsx", 4)
                .context(HostValue::record([("theme", HostValue::str("dark"))])),
        );
        tree.append_child(
            root,
            NodeSpec::named("Header")
                .source("src/Header.tsx", 1)
                .attrs(HostValue::record([("title", HostValue::str("tessera demo"))])),
        );
        let counter = tree.append_child(
            root,
            NodeSpec::named("Counter")
                .source("src/Counter.tsx", 8)
                .attrs(counter_attrs(0))
                .state(HostValue::record([("clicks", HostValue::Int(0))])),
        );
        let list = tree.append_child(root, NodeSpec::named("TodoList").source("src/TodoList.tsx", 3));
        let items = (0..3)
            .map(|n| tree.append_child(list, item_spec(n, false)))
            .collect();
        let spinner = tree.append_child(
            root,
            NodeSpec::named("Spinner")
                .source("src/Spinner.tsx", 12)
                .attrs(spinner_attrs()),
        );
        Self {
            tree,
            counter,
            list,
            spinner,
            items,
            tick: 0,
        }
    }

    pub fn tree(&self) -> &MemoryTree {
        &self.tree
    }

    /// Advances the app by one step.
    pub fn step(&mut self) {
        self.tick += 1;
        let tick = self.tick;

        let count = tick as i64;
        self.tree.update(self.counter, |spec| {
            spec.attributes = counter_attrs(count);
            spec.state = HostValue::record([("clicks", HostValue::Int(count))]);
        });

        // A fresh style object every tick: looks like identity thrash.
        self.tree
            .update(self.spinner, |spec| spec.attributes = spinner_attrs());

        if tick % 4 == 0 && !self.items.is_empty() {
            // Rebuilt element for the same item, same identity.
            let at = (tick / 4) as usize % self.items.len();
            let done = (tick / 4) % 2 == 1;
            let replacement = item_spec(at as i64, done);
            self.items[at] = self.tree.replace(self.items[at], replacement);
        }
        if tick % 10 == 0 {
            let next = self.tree.children(self.list).len() as i64;
            let key = self.tree.append_child(self.list, item_spec(next, false));
            self.items.push(key);
        }
        if tick % 15 == 0
            && let Some(first) = (!self.items.is_empty()).then(|| self.items.remove(0))
        {
            self.tree.remove(first);
        }
    }
}

fn counter_attrs(count: i64) -> HostValue {
    HostValue::record([
        ("count", HostValue::Int(count)),
        ("label", HostValue::str("clicks")),
        ("onIncrement", HostValue::function("increment")),
    ])
}

fn spinner_attrs() -> HostValue {
    HostValue::record([(
        "style",
        HostValue::record([("animation", HostValue::str("spin 1s linear infinite"))]),
    )])
}

fn item_spec(n: i64, done: bool) -> NodeSpec {
    NodeSpec::named("TodoItem")
        .key(format!("todo-{n}"))
        .source("src/TodoItem.tsx", 5)
        .attrs(HostValue::record([
            ("text", HostValue::str(format!("task {n}"))),
            ("done", HostValue::Bool(done)),
        ]))
}

/// Drives a [`DemoApp`] forever, committing every `tick`.
pub async fn run_demo(inspector: Arc<Inspector>, tick: Duration) {
    let mut app = DemoApp::new();
    info!(tick_ms = tick.as_millis() as u64, "demo host running");
    let mut interval = tokio::time::interval(tick);
    let mut first = true;
    loop {
        interval.tick().await;
        let started = Instant::now();
        if !first {
            app.step();
        }
        first = false;
        let sequence_no = inspector.ingest_commit(app.tree(), CommitTiming::now(started.elapsed()));
        debug!(sequence_no, "demo commit");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_runtime::InspectorConfig;
    use tessera_types::{ChangeKind, FindingKind};

    #[test]
    fn steps_produce_updates_and_findings() {
        let (inspector, mut commits) = Inspector::new(InspectorConfig::default());
        let mut app = DemoApp::new();
        inspector.ingest_commit(app.tree(), CommitTiming::now(Duration::ZERO));
        let first = commits.try_recv().unwrap();
        assert!(first.envelope.changes.iter().all(|c| c.kind == ChangeKind::Mount));

        let mut findings = Vec::new();
        for _ in 0..4 {
            app.step();
            inspector.ingest_commit(app.tree(), CommitTiming::now(Duration::ZERO));
            let event = commits.try_recv().unwrap();
            assert!(event.envelope.changes.iter().any(|c| c.name == "Counter"));
            findings.extend(event.findings.iter().map(|(f, _)| f.kind));
        }
        assert!(findings.contains(&FindingKind::IdentityThrash));
    }
}
