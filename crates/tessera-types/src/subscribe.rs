use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{BudgetSpec, Channel, Fid, SourcePos, SubscriptionId, WireEnvelope};

/// Declarative node filter as sent by a subscriber.
///
/// `nameMatch` and `fileMatch` are literal substrings unless written as
/// `/pattern/flags`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SelectorSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_match: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_match: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_contains: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_equals: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_gte: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attrs_match: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeParams {
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub selector: Option<SelectorSpec>,
    #[serde(default)]
    pub fields: Option<Vec<String>>,
    #[serde(default)]
    pub budgets: Option<BudgetSpec>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl SubscribeParams {
    pub const DEFAULT_TIMEOUT_MS: u64 = 250;
    pub const MIN_TIMEOUT_MS: u64 = 50;
    pub const MAX_TIMEOUT_MS: u64 = 1500;

    /// How long `subscribe` may wait for the first commit.
    pub fn timeout(&self) -> Duration {
        let ms = self
            .timeout_ms
            .unwrap_or(Self::DEFAULT_TIMEOUT_MS)
            .clamp(Self::MIN_TIMEOUT_MS, Self::MAX_TIMEOUT_MS);
        Duration::from_millis(ms)
    }
}

/// One node matched by a subscription's initial scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub fid: Fid,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourcePos>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscribeStatus {
    Ok,
    Empty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeResult {
    pub subscription_id: SubscriptionId,
    pub channels: Vec<Channel>,
    pub selector: Option<SelectorSpec>,
    pub targets: Vec<Target>,
    pub status: SubscribeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeParams {
    pub subscription_id: SubscriptionId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeResult {
    pub subscription_id: SubscriptionId,
    pub removed: bool,
    /// Events still waiting in the queue; drain them with `nextEvents`.
    pub queued: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextEventsParams {
    pub subscription_id: SubscriptionId,
    #[serde(default)]
    pub max: Option<usize>,
}

impl NextEventsParams {
    pub const DEFAULT_MAX: usize = 50;
    pub const LIMIT: usize = 500;

    pub fn max(&self) -> usize {
        self.max.unwrap_or(Self::DEFAULT_MAX).clamp(1, Self::LIMIT)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextEventsResult {
    pub subscription_id: SubscriptionId,
    pub events: Vec<WireEnvelope>,
    /// Events left in the queue after this drain.
    pub remaining: usize,
    /// Events discarded because the queue was full, since the subscription began.
    pub dropped: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResyncParams {
    #[serde(default)]
    pub subscription_id: Option<SubscriptionId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResyncResult {
    pub resynced: Vec<SubscriptionId>,
    pub sequence_no: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn timeout_defaults_and_clamps() {
        let mut params: SubscribeParams =
            serde_json::from_value(json!({"channels": ["mutation-stream"]})).unwrap();
        assert_eq!(params.timeout(), Duration::from_millis(250));
        params.timeout_ms = Some(1);
        assert_eq!(params.timeout(), Duration::from_millis(50));
        params.timeout_ms = Some(60_000);
        assert_eq!(params.timeout(), Duration::from_millis(1500));
    }

    #[test]
    fn selector_rejects_unknown_fields() {
        let err = serde_json::from_value::<SelectorSpec>(json!({"nmeMatch": "Counter"}));
        assert!(err.is_err());
    }
}
