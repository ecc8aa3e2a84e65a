use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::Fid;

/// Source position of the code that declared a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourcePos {
    pub file: String,
    pub line: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Mount,
    Update,
    Unmount,
}

/// Why a node produced a change record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeReason {
    Mount,
    Attrs,
    State,
    Context,
    Owner,
    Unmount,
}

/// Shallow difference between two attribute (or state, or context) bags.
///
/// `preview` carries the new previews of the changed and added keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDiff {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changed: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub added: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed: Vec<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub preview: Map<String, Value>,
}

impl FieldDiff {
    /// Synthetic field standing in for the whole bag when either side is not a
    /// plain record.
    pub const ROOT_FIELD: &'static str = "(root)";

    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.added.is_empty() && self.removed.is_empty()
    }

    /// Every key mentioned by this diff, in changed/added/removed order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.changed
            .iter()
            .chain(&self.added)
            .chain(&self.removed)
            .map(String::as_str)
    }

    /// Keeps only the listed keys in `preview`. Key lists stay intact so a
    /// consumer still learns that something outside its projection changed.
    pub fn project(&mut self, fields: &[String]) {
        self.preview
            .retain(|key, _| fields.iter().any(|field| field == key));
    }
}

/// One node's computed change for one commit. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub fid: Fid,
    pub kind: ChangeKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_fid: Option<Fid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub reasons: Vec<ChangeReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attr_diff: Option<FieldDiff>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_diff: Option<FieldDiff>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_diff: Option<FieldDiff>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_pos: Option<SourcePos>,
}

impl ChangeRecord {
    /// Restricts the previews of every diff to `fields`.
    pub fn project(&mut self, fields: &[String]) {
        for diff in [
            &mut self.attr_diff,
            &mut self.state_diff,
            &mut self.context_diff,
        ]
        .into_iter()
        .flatten()
        {
            diff.project(fields);
        }
    }
}

/// Present on envelopes produced by merging several commits together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Coalesced {
    pub first_sequence_no: u64,
    pub envelopes: u32,
}

/// The batch of change records for one commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationEnvelope {
    pub session_id: String,
    pub sequence_no: u64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub duration_ms: f64,
    pub changes: Vec<ChangeRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coalesced: Option<Coalesced>,
}
