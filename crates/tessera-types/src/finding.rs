use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Fid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FindingKind {
    /// Attributes changed on several consecutive commits.
    IdentityThrash,
    /// Too many updates within the trailing second.
    RunawayUpdateLoop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// Advisory derived from a sequence of change records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub id: String,
    pub kind: FindingKind,
    pub severity: Severity,
    pub fid: Fid,
    pub name: String,
    pub evidence: Value,
    pub suggestion: String,
}
