//! The in-process facade the host calls on every commit, and the read side
//! the front end queries.

use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde_json::{Map, Value};
use tessera_types::{
    Fid, FidParseError, Finding, MutationEnvelope, NotReadyReason, QueryKind, QueryResult,
    QueryType,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::detect::{ChangeDetector, CommitTiming, NodeSnapshot};
use crate::findings::{FindingConfig, FindingEngine};
use crate::history::{History, HistoryEntry, Lookup};
use crate::identity::IdentityRegistry;
use crate::preview::{Bag, PreviewLimits};
use crate::selector::{Selector, selects};
use crate::tree::{NodeKey, TreeView};

#[derive(Debug, Clone)]
pub struct InspectorConfig {
    pub history_capacity: usize,
    pub limits: PreviewLimits,
    pub findings: FindingConfig,
    /// Commits buffered for the fan-out task before new ones are dropped.
    pub commit_queue: usize,
}

impl Default for InspectorConfig {
    fn default() -> Self {
        Self {
            history_capacity: History::DEFAULT_CAPACITY,
            limits: PreviewLimits::default(),
            findings: FindingConfig::default(),
            commit_queue: 256,
        }
    }
}

/// Everything the fan-out side needs to know about one commit.
#[derive(Debug, Clone)]
pub struct CommitEvent {
    pub envelope: MutationEnvelope,
    /// Index-aligned with `envelope.changes`.
    pub subjects: Vec<Arc<NodeSnapshot>>,
    pub findings: Vec<(Finding, Arc<NodeSnapshot>)>,
    pub observed_at: Instant,
}

/// Result of matching a selector against the newest commit.
#[derive(Debug, Clone)]
pub struct Scan {
    pub sequence_no: u64,
    pub matches: Vec<Arc<NodeSnapshot>>,
}

#[derive(Debug)]
struct InspectorState {
    registry: IdentityRegistry,
    detector: ChangeDetector,
    history: History,
    findings: FindingEngine,
}

#[derive(Debug)]
pub struct Inspector {
    state: RwLock<InspectorState>,
    commits: mpsc::Sender<Arc<CommitEvent>>,
    sequence: watch::Sender<u64>,
}

impl Inspector {
    /// Builds an inspector and the receiving end of its commit stream.
    pub fn new(config: InspectorConfig) -> (Arc<Self>, mpsc::Receiver<Arc<CommitEvent>>) {
        let (commits, rx) = mpsc::channel(config.commit_queue.max(1));
        let (sequence, _) = watch::channel(0);
        let inspector = Self {
            state: RwLock::new(InspectorState {
                registry: IdentityRegistry::new(),
                detector: ChangeDetector::new(config.limits),
                history: History::new(config.history_capacity),
                findings: FindingEngine::new(config.findings),
            }),
            commits,
            sequence,
        };
        (Arc::new(inspector), rx)
    }

    pub fn session_id(&self) -> String {
        self.state.read().detector.session_id().to_string()
    }

    /// Sequence number of the newest ingested commit, 0 before the first.
    pub fn latest_sequence_no(&self) -> u64 {
        *self.sequence.borrow()
    }

    pub fn ingest_commit(&self, tree: &impl TreeView, timing: CommitTiming) -> u64 {
        self.ingest_commit_at(tree, timing, Instant::now())
    }

    /// Processes one commit of `tree`. Never blocks on observers: when the
    /// fan-out queue is full the event is dropped with a warning, though
    /// history still records the commit.
    pub fn ingest_commit_at(&self, tree: &impl TreeView, timing: CommitTiming, now: Instant) -> u64 {
        let event = {
            let mut state = self.state.write();
            let InspectorState {
                registry,
                detector,
                history,
                findings,
            } = &mut *state;

            let detected = detector.commit(tree, registry, timing);
            let sequence_no = detected.envelope.sequence_no;
            history.push(HistoryEntry {
                sequence_no,
                timestamp: detected.envelope.timestamp,
                nodes: detector.live().clone(),
            });

            let findings = findings
                .observe(&detected.envelope, now)
                .into_iter()
                .filter_map(|finding| {
                    let subject = detected.subjects.iter().find(|s| s.fid == finding.fid)?;
                    Some((finding, subject.clone()))
                })
                .collect();

            CommitEvent {
                envelope: detected.envelope,
                subjects: detected.subjects,
                findings,
                observed_at: now,
            }
        };

        let sequence_no = event.envelope.sequence_no;
        self.sequence.send_replace(sequence_no);
        match self.commits.try_send(Arc::new(event)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(sequence_no, "commit fan-out queue full; dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(sequence_no, "no fan-out task; commit recorded in history only");
            }
        }
        sequence_no
    }

    /// Forgets every identity, snapshot and retained commit, and starts a
    /// new session.
    pub fn reset(&self) {
        let mut state = self.state.write();
        state.registry.reset();
        state.detector.reset();
        state.history.clear();
        state.findings.clear();
        self.sequence.send_replace(0);
        info!(session_id = state.detector.session_id(), "inspector reset");
    }

    /// Waits until at least one commit has been ingested. Returns `false` on
    /// timeout.
    pub async fn wait_for_commit(&self, timeout: Duration) -> bool {
        let mut rx = self.sequence.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|seq| *seq > 0))
            .await
            .is_ok_and(|r| r.is_ok())
    }

    pub fn latest_entry(&self) -> Option<Arc<HistoryEntry>> {
        self.state.read().history.latest()
    }

    /// Nodes of the newest commit matching `selector`, ordered by fid.
    pub fn scan(&self, selector: Option<&Selector>) -> Option<Scan> {
        let entry = self.latest_entry()?;
        let mut matches: Vec<_> = entry
            .nodes
            .values()
            .filter(|node| selects(selector, node))
            .cloned()
            .collect();
        matches.sort_by_key(|node| node.fid);
        Some(Scan {
            sequence_no: entry.sequence_no,
            matches,
        })
    }

    /// Host node currently carrying `fid`.
    pub fn resolve(&self, fid: Fid) -> Option<NodeKey> {
        self.state.read().registry.resolve(fid)
    }

    /// Reads one bag of one node from history.
    ///
    /// Only a subscription id passed where a fid belongs is an error; any
    /// other unusable `fid` is answered with `notReady`.
    pub fn query(
        &self,
        query_type: QueryType,
        raw_fid: &str,
        commit_id: Option<u64>,
        paths: &[String],
    ) -> Result<QueryResult, FidParseError> {
        let fid = match Fid::from_str(raw_fid) {
            Ok(fid) => fid,
            Err(e @ FidParseError::SubscriptionId(_)) => return Err(e),
            Err(FidParseError::Malformed(_)) => {
                return Ok(QueryResult::not_ready(
                    query_type,
                    raw_fid,
                    commit_id,
                    NotReadyReason::NoSource,
                ));
            }
        };

        let state = self.state.read();
        let history = &state.history;
        let answer = match commit_id {
            None => match history.latest() {
                Some(entry) if entry.nodes.contains_key(&fid) => Some((QueryKind::Exact, entry)),
                _ => history
                    .find_latest_with(fid)
                    .map(|entry| (QueryKind::Latest, entry)),
            },
            Some(requested) => match history.get(requested) {
                Lookup::Exact(entry) if entry.nodes.contains_key(&fid) => {
                    Some((QueryKind::Exact, entry))
                }
                Lookup::Exact(_) | Lookup::Empty => None,
                Lookup::Latest { .. } => {
                    let Some(entry) = history.find_latest_with(fid) else {
                        return Ok(QueryResult::not_ready(
                            query_type,
                            raw_fid,
                            commit_id,
                            NotReadyReason::CommitEvicted,
                        ));
                    };
                    Some((QueryKind::Latest, entry))
                }
            },
        };
        drop(state);

        let Some((kind, entry)) = answer else {
            return Ok(QueryResult::not_ready(
                query_type,
                raw_fid,
                commit_id,
                NotReadyReason::NoSource,
            ));
        };
        let Some(node) = entry.nodes.get(&fid) else {
            return Ok(QueryResult::not_ready(
                query_type,
                raw_fid,
                commit_id,
                NotReadyReason::NoSource,
            ));
        };
        let bag = match query_type {
            QueryType::Props => &node.attrs,
            QueryType::HooksState => &node.state,
            QueryType::Context => &node.context,
        };
        Ok(QueryResult {
            query_type,
            kind,
            fid: fid.to_string(),
            commit_id: Some(entry.sequence_no),
            requested_commit_id: commit_id.filter(|_| kind == QueryKind::Latest),
            data: select_paths(bag, paths),
        })
    }
}

/// The whole bag, or `{path: value}` for each dotted path. Segments index
/// into objects by key and into arrays by position; a miss yields `null`.
fn select_paths(bag: &Bag, paths: &[String]) -> Value {
    let whole = bag.to_value();
    if paths.is_empty() {
        return whole;
    }
    let mut out = Map::new();
    for path in paths {
        let mut cursor = Some(&whole);
        for segment in path.split('.').filter(|s| !s.is_empty()) {
            cursor = cursor.and_then(|value| match value {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            });
        }
        out.insert(path.clone(), cursor.cloned().unwrap_or(Value::Null));
    }
    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preview::HostValue;
    use crate::tree::{MemoryTree, NodeSpec};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn timing() -> CommitTiming {
        CommitTiming {
            timestamp_ms: 0,
            duration_ms: 1.0,
        }
    }

    fn counter(count: i64) -> HostValue {
        HostValue::record([
            ("count", HostValue::Int(count)),
            ("items", HostValue::list([HostValue::str("a"), HostValue::str("b")])),
        ])
    }

    fn small() -> InspectorConfig {
        InspectorConfig {
            history_capacity: 3,
            ..InspectorConfig::default()
        }
    }

    #[test]
    fn query_latest_commit_exactly() {
        let (inspector, _rx) = Inspector::new(small());
        let mut tree = MemoryTree::new();
        let root = tree.set_root(NodeSpec::named("Counter").attrs(counter(1)));
        let seq = inspector.ingest_commit(&tree, timing());
        assert_eq!(seq, 1);

        let fid = inspector.scan(None).unwrap().matches[0].fid.to_string();
        let result = inspector.query(QueryType::Props, &fid, None, &[]).unwrap();
        assert_eq!(result.kind, QueryKind::Exact);
        assert_eq!(result.commit_id, Some(1));
        assert_eq!(result.data, json!({"count": 1, "items": ["a", "b"]}));

        tree.update(root, |spec| spec.attributes = counter(2));
        inspector.ingest_commit(&tree, timing());
        let old = inspector.query(QueryType::Props, &fid, Some(1), &[]).unwrap();
        assert_eq!(old.kind, QueryKind::Exact);
        assert_eq!(old.data["count"], json!(1));
    }

    #[test]
    fn evicted_commit_falls_back_to_latest() {
        let (inspector, _rx) = Inspector::new(small());
        let mut tree = MemoryTree::new();
        let root = tree.set_root(NodeSpec::named("Counter").attrs(counter(0)));
        for n in 0..5 {
            tree.update(root, |spec| spec.attributes = counter(n));
            inspector.ingest_commit(&tree, timing());
        }
        let fid = inspector.scan(None).unwrap().matches[0].fid.to_string();
        let result = inspector.query(QueryType::Props, &fid, Some(1), &[]).unwrap();
        assert_eq!(result.kind, QueryKind::Latest);
        assert_eq!(result.commit_id, Some(5));
        assert_eq!(result.requested_commit_id, Some(1));
        assert_eq!(result.data["count"], json!(4));
    }

    #[test]
    fn unknown_and_malformed_fids_are_not_ready() {
        let (inspector, _rx) = Inspector::new(small());
        let mut tree = MemoryTree::new();
        tree.set_root(NodeSpec::named("App"));
        inspector.ingest_commit(&tree, timing());

        for raw in ["fid-99-0", "banana"] {
            let result = inspector.query(QueryType::HooksState, raw, None, &[]).unwrap();
            assert_eq!(result.kind, QueryKind::NotReady);
            assert_eq!(result.not_ready_reason(), Some(NotReadyReason::NoSource));
        }
        assert!(matches!(
            inspector.query(QueryType::Props, "sub-1", None, &[]),
            Err(FidParseError::SubscriptionId(_))
        ));
    }

    #[test]
    fn paths_pick_nested_values() {
        let (inspector, _rx) = Inspector::new(small());
        let mut tree = MemoryTree::new();
        tree.set_root(NodeSpec::named("Counter").attrs(counter(7)));
        inspector.ingest_commit(&tree, timing());
        let fid = inspector.scan(None).unwrap().matches[0].fid.to_string();
        let paths = vec!["count".to_string(), "items.1".to_string(), "nope.x".to_string()];
        let result = inspector.query(QueryType::Props, &fid, None, &paths).unwrap();
        assert_eq!(
            result.data,
            json!({"count": 7, "items.1": "b", "nope.x": null})
        );
    }

    #[test]
    fn commits_reach_the_fanout_channel() {
        let (inspector, mut rx) = Inspector::new(small());
        let mut tree = MemoryTree::new();
        tree.set_root(NodeSpec::named("App"));
        inspector.ingest_commit(&tree, timing());
        let event = rx.try_recv().unwrap();
        assert_eq!(event.envelope.sequence_no, 1);
        assert_eq!(event.subjects.len(), 1);
        assert_eq!(inspector.latest_sequence_no(), 1);

        inspector.reset();
        assert_eq!(inspector.latest_sequence_no(), 0);
        assert!(inspector.latest_entry().is_none());
        assert_eq!(inspector.ingest_commit(&tree, timing()), 1);
    }

    #[tokio::test]
    async fn wait_for_commit_times_out_then_succeeds() {
        let (inspector, _rx) = Inspector::new(small());
        assert!(!inspector.wait_for_commit(Duration::from_millis(20)).await);
        let mut tree = MemoryTree::new();
        tree.set_root(NodeSpec::named("App"));
        inspector.ingest_commit(&tree, timing());
        assert!(inspector.wait_for_commit(Duration::from_millis(20)).await);
    }
}
