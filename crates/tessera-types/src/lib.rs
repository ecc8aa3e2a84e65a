//! Shared data model for tessera.
//!
//! Everything that crosses a boundary lives here: stable node identities
//! ([`Fid`]), per-commit change records ([`ChangeRecord`], [`MutationEnvelope`]),
//! derived [`Finding`]s, channel and budget vocabulary, and the parameter and
//! result shapes of the tools the front end exposes.
//!
//! All types serialize to the camelCase JSON shapes observers see on the wire.

mod change;
mod channel;
mod finding;
mod ids;
mod query;
mod subscribe;

pub use change::{
    ChangeKind, ChangeReason, ChangeRecord, Coalesced, FieldDiff, MutationEnvelope, SourcePos,
};
pub use channel::{Budget, BudgetSpec, Channel, WireEnvelope};
pub use finding::{Finding, FindingKind, Severity};
pub use ids::{Fid, FidParseError, SubscriptionId, SubscriptionIdParseError};
pub use query::{NotReadyReason, QueryKind, QueryParams, QueryResult, QueryType};
pub use subscribe::{
    NextEventsParams, NextEventsResult, ResyncParams, ResyncResult, SelectorSpec,
    SubscribeParams, SubscribeResult, SubscribeStatus, Target, UnsubscribeParams,
    UnsubscribeResult,
};
