//! Per-commit change detection.
//!
//! Each commit walks the host tree once, resolves identities, previews the
//! three value bags of every node, and diffs them against the snapshot kept
//! from the previous commit.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tessera_types::{
    ChangeKind, ChangeReason, ChangeRecord, Fid, FieldDiff, MutationEnvelope, SourcePos,
};
use tracing::{debug, warn};

use crate::identity::IdentityRegistry;
use crate::preview::{Bag, PreviewLimits, diff_bags};
use crate::tree::{NodeKey, TreeView};

pub const ANONYMOUS: &str = "Anonymous";

/// What we know about one node as of the commit that last changed it.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSnapshot {
    pub fid: Fid,
    pub name: Option<String>,
    pub key: Option<String>,
    pub parent: Option<Fid>,
    pub owner: Option<Fid>,
    /// Named ancestors and the node itself, joined with `/`.
    pub path: String,
    pub source: Option<SourcePos>,
    pub cost: Option<f64>,
    pub attrs: Bag,
    pub state: Bag,
    pub context: Bag,
    pub captured_at: u64,
}

impl NodeSnapshot {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(ANONYMOUS)
    }

    /// Whether a person would recognize this node by name.
    pub fn has_meaningful_name(&self) -> bool {
        self.name
            .as_deref()
            .map(str::trim)
            .is_some_and(|name| !name.is_empty() && name != ANONYMOUS)
    }

    fn same_shape(&self, other: &NodeSnapshot) -> bool {
        self.name == other.name
            && self.key == other.key
            && self.parent == other.parent
            && self.owner == other.owner
            && self.path == other.path
            && self.source == other.source
            && self.cost == other.cost
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommitTiming {
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    pub duration_ms: f64,
}

impl CommitTiming {
    pub fn now(duration: Duration) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Self {
            timestamp_ms,
            duration_ms: duration.as_secs_f64() * 1000.0,
        }
    }
}

/// Output of one commit.
#[derive(Debug, Clone)]
pub struct Detected {
    pub envelope: MutationEnvelope,
    /// Snapshot behind each change record, index-aligned with
    /// `envelope.changes`. Unmounted nodes carry their last snapshot.
    pub subjects: Vec<Arc<NodeSnapshot>>,
}

struct Frame {
    node: NodeKey,
    parent: Option<Fid>,
    parent_path: Arc<str>,
}

#[derive(Debug)]
pub struct ChangeDetector {
    session_id: String,
    next_sequence_no: u64,
    limits: PreviewLimits,
    live: HashMap<Fid, Arc<NodeSnapshot>>,
}

impl ChangeDetector {
    pub fn new(limits: PreviewLimits) -> Self {
        Self {
            session_id: new_session_id(),
            next_sequence_no: 1,
            limits,
            live: HashMap::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Sequence number the next commit will get.
    pub fn next_sequence_no(&self) -> u64 {
        self.next_sequence_no
    }

    /// Snapshots of every node seen by the last commit.
    pub fn live(&self) -> &HashMap<Fid, Arc<NodeSnapshot>> {
        &self.live
    }

    /// Starts a new session: fresh id, sequence numbers from 1, no snapshots.
    pub fn reset(&mut self) {
        self.session_id = new_session_id();
        self.next_sequence_no = 1;
        self.live.clear();
    }

    pub fn commit(
        &mut self,
        tree: &impl TreeView,
        registry: &mut IdentityRegistry,
        timing: CommitTiming,
    ) -> Detected {
        let sequence_no = self.next_sequence_no;
        self.next_sequence_no += 1;
        registry.begin_commit(sequence_no);

        let mut visited: HashMap<Fid, Arc<NodeSnapshot>> = HashMap::with_capacity(self.live.len());
        let mut changes = Vec::new();
        let mut subjects = Vec::new();

        // Every handle is queued at most once, so malformed sibling or child
        // links cannot make the walk loop forever.
        let mut queued: HashSet<NodeKey> = HashSet::new();
        let mut stack: Vec<Frame> = Vec::new();
        if let Some(root) = tree.root() {
            queued.insert(root);
            stack.push(Frame {
                node: root,
                parent: None,
                parent_path: Arc::from(""),
            });
        }

        while let Some(frame) = stack.pop() {
            let node = frame.node;
            let fid = registry.identity_for(node, tree.predecessor(node));
            let name = tree.name(node).map(str::to_string);
            let path: Arc<str> = match name.as_deref().map(str::trim) {
                Some(n) if !n.is_empty() && n != ANONYMOUS => {
                    if frame.parent_path.is_empty() {
                        Arc::from(n)
                    } else {
                        Arc::from(format!("{}/{n}", frame.parent_path))
                    }
                }
                _ => frame.parent_path.clone(),
            };

            let mut children = Vec::new();
            let mut next = tree.first_child(node);
            while let Some(child) = next {
                if !queued.insert(child) {
                    warn!(?child, ?node, "node linked twice in one commit; skipping");
                    break;
                }
                children.push(child);
                next = tree.next_sibling(child);
            }
            for child in children.into_iter().rev() {
                stack.push(Frame {
                    node: child,
                    parent: Some(fid),
                    parent_path: path.clone(),
                });
            }

            let candidate = NodeSnapshot {
                fid,
                name,
                key: tree.key(node).map(str::to_string),
                parent: frame.parent,
                owner: tree.owner(node).and_then(|owner| registry.lookup(owner)),
                path: path.to_string(),
                source: tree.source(node),
                cost: tree.cost(node),
                attrs: Bag::capture(&tree.attributes(node), &self.limits),
                state: Bag::capture(&tree.derived_state(node), &self.limits),
                context: Bag::capture(&tree.context(node), &self.limits),
                captured_at: sequence_no,
            };

            let previous = self.live.get(&fid);
            let record = build_record(previous.map(Arc::as_ref), &candidate);
            let snapshot = match previous {
                Some(prev) if record.is_none() && prev.same_shape(&candidate) => prev.clone(),
                _ => Arc::new(candidate),
            };
            if let Some(record) = record {
                changes.push(record);
                subjects.push(snapshot.clone());
            }
            visited.insert(fid, snapshot);
        }

        let mut gone: Vec<Fid> = self
            .live
            .keys()
            .filter(|fid| !visited.contains_key(fid))
            .copied()
            .collect();
        gone.sort();
        for fid in gone {
            let Some(last) = self.live.remove(&fid) else {
                continue;
            };
            changes.push(ChangeRecord {
                fid,
                kind: ChangeKind::Unmount,
                name: last.display_name().to_string(),
                parent_fid: last.parent,
                key: last.key.clone(),
                reasons: vec![ChangeReason::Unmount],
                attr_diff: None,
                state_diff: None,
                context_diff: None,
                source_pos: last.source.clone(),
            });
            subjects.push(last);
            registry.retire(fid);
        }
        self.live = visited;

        debug!(
            sequence_no,
            changes = changes.len(),
            live = self.live.len(),
            "commit processed"
        );

        Detected {
            envelope: MutationEnvelope {
                session_id: self.session_id.clone(),
                sequence_no,
                timestamp: timing.timestamp_ms,
                duration_ms: timing.duration_ms,
                changes,
                coalesced: None,
            },
            subjects,
        }
    }
}

fn non_empty(diff: FieldDiff) -> Option<FieldDiff> {
    (!diff.is_empty()).then_some(diff)
}

/// Builds the change record for one visited node, or `None` if nothing about
/// it changed.
fn build_record(previous: Option<&NodeSnapshot>, next: &NodeSnapshot) -> Option<ChangeRecord> {
    let attr_diff = non_empty(diff_bags(previous.map(|p| &p.attrs), &next.attrs));
    let state_diff = non_empty(diff_bags(previous.map(|p| &p.state), &next.state));
    let context_diff = non_empty(diff_bags(previous.map(|p| &p.context), &next.context));

    let (kind, reasons) = match previous {
        None => (ChangeKind::Mount, vec![ChangeReason::Mount]),
        Some(prev) => {
            let mut reasons = Vec::new();
            if attr_diff.is_some() {
                reasons.push(ChangeReason::Attrs);
            }
            if state_diff.is_some() {
                reasons.push(ChangeReason::State);
            }
            if context_diff.is_some() {
                reasons.push(ChangeReason::Context);
            }
            if prev.owner != next.owner {
                reasons.push(ChangeReason::Owner);
            }
            if reasons.is_empty() {
                return None;
            }
            (ChangeKind::Update, reasons)
        }
    };

    Some(ChangeRecord {
        fid: next.fid,
        kind,
        name: next.display_name().to_string(),
        parent_fid: next.parent,
        key: next.key.clone(),
        reasons,
        attr_diff,
        state_diff,
        context_diff,
        source_pos: next.source.clone(),
    })
}

fn new_session_id() -> String {
    format!("session-{:016x}", rand::random::<u64>())
}
