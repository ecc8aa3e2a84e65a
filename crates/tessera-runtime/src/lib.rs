//! In-process core of tessera.
//!
//! The host hands every committed tree to an [`Inspector`]. It assigns stable
//! identities, previews and diffs each node's value bags, retains a bounded
//! history for on-demand queries, and derives findings. Each commit is then
//! published as a [`CommitEvent`] for the [`SubscriptionManager`], which
//! filters it per subscriber and meters it through a per-subscription
//! [`Governor`].
//!
//! Nothing here performs I/O; transports live in `tessera-web`.

pub mod detect;
pub mod findings;
pub mod governor;
pub mod history;
pub mod identity;
pub mod inspector;
pub mod preview;
pub mod selector;
pub mod subscription;
pub mod tree;

pub use detect::{ANONYMOUS, ChangeDetector, CommitTiming, Detected, NodeSnapshot};
pub use findings::{FindingConfig, FindingEngine};
pub use governor::{ChannelBudget, Emitted, Governor, GovernorConfig, Offer};
pub use history::{History, HistoryEntry, Lookup};
pub use identity::IdentityRegistry;
pub use inspector::{CommitEvent, Inspector, InspectorConfig, Scan};
pub use preview::{Bag, HostField, HostList, HostRecord, HostRef, HostValue, ObjectId, PreviewLimits, preview};
pub use selector::{Selector, SelectorError, TextMatch, selects};
pub use subscription::{
    DEFAULT_QUEUE_CAPACITY, Delivery, Drained, OwnerId, Subscription, SubscriptionManager,
    UnknownSubscription, target_of,
};
pub use tree::{MemoryTree, NodeKey, NodeSpec, TreeView};
