use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::SubscriptionId;

/// Outbound budget class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Channel {
    /// Per-commit change records.
    MutationStream,
    /// Findings derived from the change stream.
    DerivedFindings,
    /// Per-commit counters; high frequency, sampled under pressure.
    Metrics,
    /// Advisories and lifecycle notices.
    Control,
    /// Full selector-filtered scans.
    Snapshot,
}

impl Channel {
    pub const ALL: [Channel; 5] = [
        Channel::MutationStream,
        Channel::DerivedFindings,
        Channel::Metrics,
        Channel::Control,
        Channel::Snapshot,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Channel::MutationStream => "mutation-stream",
            Channel::DerivedFindings => "derived-findings",
            Channel::Metrics => "metrics",
            Channel::Control => "control",
            Channel::Snapshot => "snapshot",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-second limits for one channel. Missing dimensions fall back to the
/// server defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Budget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_per_sec: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_per_sec: Option<u64>,
}

/// Budgets as supplied by a subscriber: either one budget for every channel or
/// a budget per channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BudgetSpec {
    PerChannel(BTreeMap<Channel, Budget>),
    Uniform(Budget),
}

impl BudgetSpec {
    pub fn for_channel(&self, channel: Channel) -> Option<Budget> {
        match self {
            BudgetSpec::PerChannel(map) => map.get(&channel).copied(),
            BudgetSpec::Uniform(budget) => Some(*budget),
        }
    }
}

/// Push envelope delivered to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEnvelope {
    pub channel: Channel,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<SubscriptionId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn uniform_budget_parses() {
        let spec: BudgetSpec = serde_json::from_value(json!({"msgPerSec": 1})).unwrap();
        assert_eq!(
            spec.for_channel(Channel::Metrics),
            Some(Budget {
                bytes_per_sec: None,
                msg_per_sec: Some(1),
            })
        );
    }

    #[test]
    fn per_channel_budget_parses() {
        let spec: BudgetSpec =
            serde_json::from_value(json!({"mutation-stream": {"bytesPerSec": 512}})).unwrap();
        assert_eq!(
            spec.for_channel(Channel::MutationStream).unwrap().bytes_per_sec,
            Some(512)
        );
        assert_eq!(spec.for_channel(Channel::Control), None);
    }

    #[test]
    fn channel_names_match_serde() {
        for channel in Channel::ALL {
            assert_eq!(
                serde_json::to_value(channel).unwrap(),
                json!(channel.as_str())
            );
        }
    }
}
