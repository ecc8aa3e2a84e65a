use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tessera_types::Fid;

use crate::detect::NodeSnapshot;

/// Every live node as of one commit. Snapshots are shared with neighbouring
/// entries whenever a node did not change.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub sequence_no: u64,
    pub timestamp: i64,
    pub nodes: HashMap<Fid, Arc<NodeSnapshot>>,
}

#[derive(Debug, Clone)]
pub enum Lookup {
    Exact(Arc<HistoryEntry>),
    /// The requested commit is not retained; this is the newest one.
    Latest {
        requested: u64,
        entry: Arc<HistoryEntry>,
    },
    Empty,
}

/// Fixed-capacity ring of per-commit entries, oldest evicted first.
#[derive(Debug)]
pub struct History {
    capacity: usize,
    entries: VecDeque<Arc<HistoryEntry>>,
}

impl History {
    pub const DEFAULT_CAPACITY: usize = 300;

    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Appends an entry. Sequence numbers are gap-free within a session, so a
    /// discontinuity means a new session and the ring starts over.
    pub fn push(&mut self, entry: HistoryEntry) {
        if let Some(back) = self.entries.back()
            && entry.sequence_no != back.sequence_no + 1
        {
            self.entries.clear();
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(Arc::new(entry));
    }

    pub fn get(&self, sequence_no: u64) -> Lookup {
        let Some(latest) = self.entries.back() else {
            return Lookup::Empty;
        };
        if let Some(front) = self.entries.front()
            && let Some(offset) = sequence_no.checked_sub(front.sequence_no)
            && let Some(entry) = self.entries.get(offset as usize)
        {
            return Lookup::Exact(entry.clone());
        }
        Lookup::Latest {
            requested: sequence_no,
            entry: latest.clone(),
        }
    }

    pub fn latest(&self) -> Option<Arc<HistoryEntry>> {
        self.entries.back().cloned()
    }

    /// Newest retained entry in which `fid` was live.
    pub fn find_latest_with(&self, fid: Fid) -> Option<Arc<HistoryEntry>> {
        self.entries
            .iter()
            .rev()
            .find(|entry| entry.nodes.contains_key(&fid))
            .cloned()
    }

    pub fn oldest_sequence_no(&self) -> Option<u64> {
        self.entries.front().map(|entry| entry.sequence_no)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for History {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
