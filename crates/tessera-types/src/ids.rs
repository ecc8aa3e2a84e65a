use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

const FID_PREFIX: &str = "fid-";
const SUBSCRIPTION_PREFIX: &str = "sub-";

// ── Node identity ───────────────────────────────────────────────

/// Stable identity of a logical component across node replacement.
///
/// A `Fid` names an arena slot plus the generation the slot had when the
/// identity was minted. Slots are recycled, generations are not, so a `Fid`
/// never refers to two unrelated nodes. Rendered as `fid-<slot>-<generation>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fid {
    slot: u32,
    generation: u32,
}

impl Fid {
    pub fn new(slot: u32, generation: u32) -> Self {
        Self { slot, generation }
    }

    pub fn slot(self) -> u32 {
        self.slot
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for Fid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{FID_PREFIX}{}-{}", self.slot, self.generation)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FidParseError {
    #[error("`{0}` is a subscription id; expected a node fid of the form fid-<slot>-<generation>")]
    SubscriptionId(String),
    #[error("`{0}` is not a node fid (expected fid-<slot>-<generation>)")]
    Malformed(String),
}

impl FromStr for Fid {
    type Err = FidParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        if trimmed.starts_with(SUBSCRIPTION_PREFIX) {
            return Err(FidParseError::SubscriptionId(trimmed.to_string()));
        }
        let malformed = || FidParseError::Malformed(trimmed.to_string());
        let rest = trimmed.strip_prefix(FID_PREFIX).ok_or_else(malformed)?;
        let (slot, generation) = rest.split_once('-').ok_or_else(malformed)?;
        let slot = slot.parse::<u32>().map_err(|_| malformed())?;
        let generation = generation.parse::<u32>().map_err(|_| malformed())?;
        Ok(Self { slot, generation })
    }
}

impl Serialize for Fid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Fid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ── Subscription identity ───────────────────────────────────────

/// Server-assigned subscription handle, rendered as `sub-<n>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SUBSCRIPTION_PREFIX}{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("`{0}` is not a subscription id (expected sub-<n>)")]
pub struct SubscriptionIdParseError(String);

impl FromStr for SubscriptionId {
    type Err = SubscriptionIdParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        trimmed
            .strip_prefix(SUBSCRIPTION_PREFIX)
            .and_then(|n| n.parse::<u64>().ok())
            .map(Self)
            .ok_or_else(|| SubscriptionIdParseError(trimmed.to_string()))
    }
}

impl Serialize for SubscriptionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SubscriptionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
