use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{Value, json};
use tessera_types::{
    BudgetSpec, Channel, MutationEnvelope, SelectorSpec, SubscriptionId, Target, WireEnvelope,
};
use tracing::{debug, info};

use crate::detect::NodeSnapshot;
use crate::governor::{Emitted, Governor, GovernorConfig, Offer};
use crate::history::HistoryEntry;
use crate::inspector::CommitEvent;
use crate::selector::{Selector, selects};

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// The connection (or HTTP session) a subscription belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(pub u64);

/// An envelope ready for a specific owner.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub owner: OwnerId,
    pub envelope: WireEnvelope,
}

#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub owner: OwnerId,
    pub channels: BTreeSet<Channel>,
    pub spec: Option<SelectorSpec>,
    selector: Option<Selector>,
    fields: Option<Vec<String>>,
    /// `None` once unsubscribed and the governor has nothing left to send.
    governor: Option<Governor>,
    /// Unsubscribed; only the governor's backlog still flows.
    closing: bool,
    queue: VecDeque<WireEnvelope>,
    dropped: u64,
}

impl Subscription {
    pub fn is_active(&self) -> bool {
        self.governor.is_some() && !self.closing
    }

    /// Unsubscribed, flushed, and drained.
    fn is_finished(&self) -> bool {
        self.governor.is_none() && self.queue.is_empty()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn matches(&self, node: &NodeSnapshot) -> bool {
        selects(self.selector.as_ref(), node)
    }

    fn deliveries(&self, emitted: Vec<Emitted>) -> impl Iterator<Item = Delivery> + '_ {
        emitted.into_iter().map(|e| Delivery {
            owner: self.owner,
            envelope: WireEnvelope {
                channel: e.channel,
                payload: e.payload,
                subscription_id: Some(self.id),
            },
        })
    }

    /// Restricts a mutation envelope to the changes this subscription selects.
    fn filter_envelope(&self, event: &CommitEvent) -> Option<MutationEnvelope> {
        let changes: Vec<_> = event
            .envelope
            .changes
            .iter()
            .zip(&event.subjects)
            .filter(|(_, subject)| self.matches(subject))
            .map(|(change, _)| {
                let mut change = change.clone();
                if let Some(fields) = &self.fields {
                    change.project(fields);
                }
                change
            })
            .collect();
        if changes.is_empty() {
            return None;
        }
        Some(MutationEnvelope {
            changes,
            ..event.envelope.clone()
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Drained {
    pub events: Vec<WireEnvelope>,
    pub remaining: usize,
    pub dropped: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown subscription {0}")]
pub struct UnknownSubscription(pub SubscriptionId);

/// All subscriptions of a process, keyed by id.
#[derive(Debug)]
pub struct SubscriptionManager {
    config: GovernorConfig,
    queue_capacity: usize,
    next_id: u64,
    subscriptions: BTreeMap<SubscriptionId, Subscription>,
    seeds: StdRng,
}

impl SubscriptionManager {
    pub fn new(config: GovernorConfig) -> Self {
        Self::with_seed(config, rand::random())
    }

    pub fn with_seed(config: GovernorConfig, seed: u64) -> Self {
        Self {
            config,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            next_id: 0,
            subscriptions: BTreeMap::new(),
            seeds: StdRng::seed_from_u64(seed),
        }
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn get(&self, id: SubscriptionId) -> Option<&Subscription> {
        self.subscriptions.get(&id)
    }

    pub fn active_count(&self) -> usize {
        self.subscriptions.values().filter(|s| s.is_active()).count()
    }

    pub fn ids_for(&self, owner: OwnerId) -> Vec<SubscriptionId> {
        self.subscriptions
            .values()
            .filter(|s| s.owner == owner && s.is_active())
            .map(|s| s.id)
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn subscribe(
        &mut self,
        owner: OwnerId,
        channels: &[Channel],
        spec: Option<SelectorSpec>,
        selector: Option<Selector>,
        fields: Option<Vec<String>>,
        budgets: Option<&BudgetSpec>,
        now: Instant,
    ) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId::new(self.next_id);
        let governor = Governor::new(self.config.clone(), budgets, self.seeds.random(), now)
            .for_subscription(id);
        self.subscriptions.insert(
            id,
            Subscription {
                id,
                owner,
                channels: channels.iter().copied().collect(),
                spec,
                selector,
                fields,
                governor: Some(governor),
                closing: false,
                queue: VecDeque::new(),
                dropped: 0,
            },
        );
        info!(%id, owner = owner.0, ?channels, "subscription created");
        id
    }

    /// Stops matching new commits for `id` and offers an `unsubscribed`
    /// advisory on its `control` channel. The governor lives on until its
    /// backlog is flushed; events already queued stay drainable.
    ///
    /// Returns the number of queued events and whatever the governor lets
    /// through right away, or `None` if `id` is unknown or already
    /// unsubscribed. Callers deliver the result, then [`sweep`](Self::sweep).
    pub fn unsubscribe(&mut self, id: SubscriptionId, now: Instant) -> Option<(usize, Vec<Delivery>)> {
        let subscription = self.subscriptions.get_mut(&id)?;
        if !subscription.is_active() {
            return None;
        }
        subscription.closing = true;
        let queued = subscription.queue.len();
        let advisory = json!({ "type": "unsubscribed", "subscriptionId": id });
        let (emitted, idle) = match subscription.governor.as_mut() {
            Some(governor) => {
                let emitted = governor.offer(Offer::Control(advisory), now);
                (emitted, governor.is_idle())
            }
            None => (Vec::new(), true),
        };
        if idle {
            subscription.governor = None;
        }
        let out = subscription.deliveries(emitted).collect();
        info!(%id, queued, "subscription removed");
        Some((queued, out))
    }

    /// Forgets unsubscribed subscriptions with nothing left to send or drain.
    pub fn sweep(&mut self) -> usize {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|_, s| !s.is_finished());
        before - self.subscriptions.len()
    }

    /// Drops every subscription of a closed connection, queued events
    /// included.
    pub fn drop_owner(&mut self, owner: OwnerId) -> usize {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|_, s| s.owner != owner);
        let removed = before - self.subscriptions.len();
        if removed > 0 {
            info!(owner = owner.0, removed, "dropped subscriptions of closed connection");
        }
        removed
    }

    /// Fans one commit out to every active subscription.
    pub fn on_commit(&mut self, event: &CommitEvent, now: Instant) -> Vec<Delivery> {
        let mut out = Vec::new();
        for subscription in self.subscriptions.values_mut() {
            if subscription.closing {
                continue;
            }
            let Some(mut governor) = subscription.governor.take() else {
                continue;
            };
            let mut emitted = Vec::new();

            if subscription.channels.contains(&Channel::MutationStream)
                && let Some(envelope) = subscription.filter_envelope(event)
            {
                emitted.extend(governor.offer(Offer::Mutation(envelope), now));
            }

            if subscription.channels.contains(&Channel::DerivedFindings) {
                for (finding, subject) in &event.findings {
                    if subscription.matches(subject) {
                        emitted.extend(governor.offer(Offer::Finding(finding.clone()), now));
                    }
                }
            }

            if subscription.channels.contains(&Channel::Metrics) {
                let matched = event
                    .subjects
                    .iter()
                    .filter(|subject| subscription.matches(subject))
                    .count();
                let payload = json!({
                    "sequenceNo": event.envelope.sequence_no,
                    "durationMs": event.envelope.duration_ms,
                    "changes": event.envelope.changes.len(),
                    "matched": matched,
                });
                emitted.extend(governor.offer(Offer::Metrics(payload), now));
            }

            subscription.governor = Some(governor);
            out.extend(subscription.deliveries(emitted));
        }
        out
    }

    /// Flushes whatever the governors have due at `now`.
    pub fn poll(&mut self, now: Instant) -> Vec<Delivery> {
        let mut out = Vec::new();
        for subscription in self.subscriptions.values_mut() {
            let Some(governor) = subscription.governor.as_mut() else {
                continue;
            };
            if governor.next_deadline().is_some_and(|d| d <= now) {
                let emitted = governor.poll(now);
                let flushed = governor.is_idle();
                if subscription.closing && flushed {
                    subscription.governor = None;
                }
                out.extend(subscription.deliveries(emitted));
            }
        }
        out
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.subscriptions
            .values()
            .filter_map(|s| s.governor.as_ref()?.next_deadline())
            .min()
    }

    /// Rebuilds the matching node set of one subscription (or all of them)
    /// from `entry` and offers it on the `snapshot` channel.
    pub fn resync(
        &mut self,
        target: Option<SubscriptionId>,
        entry: Option<&HistoryEntry>,
        now: Instant,
    ) -> Result<(Vec<SubscriptionId>, Vec<Delivery>), UnknownSubscription> {
        if let Some(id) = target
            && !self.subscriptions.get(&id).is_some_and(|s| s.is_active())
        {
            return Err(UnknownSubscription(id));
        }
        let mut resynced = Vec::new();
        let mut out = Vec::new();
        for subscription in self.subscriptions.values_mut() {
            if subscription.closing || target.is_some_and(|id| id != subscription.id) {
                continue;
            }
            let Some(mut governor) = subscription.governor.take() else {
                continue;
            };
            let payload = snapshot_payload(subscription, entry);
            let emitted = governor.offer(Offer::Snapshot(payload), now);
            subscription.governor = Some(governor);
            out.extend(subscription.deliveries(emitted));
            resynced.push(subscription.id);
        }
        debug!(count = resynced.len(), "resync offered snapshots");
        Ok((resynced, out))
    }

    /// Queues an event that could not be pushed, dropping the oldest when
    /// full. Returns `false` if the subscription is gone.
    pub fn enqueue(&mut self, envelope: WireEnvelope) -> bool {
        let Some(id) = envelope.subscription_id else {
            return false;
        };
        let capacity = self.queue_capacity;
        let Some(subscription) = self.subscriptions.get_mut(&id) else {
            return false;
        };
        if subscription.queue.len() == capacity {
            subscription.queue.pop_front();
            subscription.dropped += 1;
        }
        subscription.queue.push_back(envelope);
        true
    }

    /// Takes up to `max` queued events. A subscription that was already
    /// unsubscribed is forgotten once its queue runs empty and its governor
    /// has flushed.
    pub fn drain(&mut self, id: SubscriptionId, max: usize) -> Result<Drained, UnknownSubscription> {
        let subscription = self
            .subscriptions
            .get_mut(&id)
            .ok_or(UnknownSubscription(id))?;
        let take = max.min(subscription.queue.len());
        let events: Vec<_> = subscription.queue.drain(..take).collect();
        let drained = Drained {
            events,
            remaining: subscription.queue.len(),
            dropped: subscription.dropped,
        };
        if subscription.is_finished() {
            self.subscriptions.remove(&id);
        }
        Ok(drained)
    }
}

pub fn target_of(node: &NodeSnapshot) -> Target {
    Target {
        fid: node.fid,
        display_name: node.display_name().to_string(),
        path: (!node.path.is_empty()).then(|| node.path.clone()),
        key: node.key.clone(),
        source: node.source.clone(),
    }
}

fn project(value: Value, fields: Option<&[String]>) -> Value {
    match (value, fields) {
        (Value::Object(map), Some(fields)) => Value::Object(
            map.into_iter()
                .filter(|(k, _)| fields.iter().any(|f| f == k))
                .collect(),
        ),
        (value, _) => value,
    }
}

fn snapshot_payload(subscription: &Subscription, entry: Option<&HistoryEntry>) -> Value {
    let Some(entry) = entry else {
        return json!({ "sequenceNo": null, "targets": [], "nodes": [] });
    };
    let mut matched: Vec<&Arc<NodeSnapshot>> = entry
        .nodes
        .values()
        .filter(|node| subscription.matches(node))
        .collect();
    matched.sort_by_key(|node| node.fid);
    let fields = subscription.fields.as_deref();
    let nodes: Vec<Value> = matched
        .iter()
        .map(|node| {
            json!({
                "fid": node.fid,
                "name": node.display_name(),
                "path": node.path,
                "key": node.key,
                "attrs": project(node.attrs.to_value(), fields),
                "state": project(node.state.to_value(), fields),
                "context": project(node.context.to_value(), fields),
            })
        })
        .collect();
    let targets: Vec<Target> = matched.iter().map(|node| target_of(node)).collect();
    json!({
        "sequenceNo": entry.sequence_no,
        "targets": targets,
        "nodes": nodes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::CommitTiming;
    use crate::inspector::{Inspector, InspectorConfig};
    use crate::preview::HostValue;
    use crate::tree::{MemoryTree, NodeSpec, TreeView};
    use std::time::Duration;

    fn timing() -> CommitTiming {
        CommitTiming {
            timestamp_ms: 0,
            duration_ms: 2.0,
        }
    }

    fn setup() -> (Arc<Inspector>, tokio::sync::mpsc::Receiver<Arc<CommitEvent>>, MemoryTree) {
        let (inspector, commits) = Inspector::new(InspectorConfig::default());
        let mut tree = MemoryTree::new();
        let root = tree.set_root(NodeSpec::named("App"));
        tree.append_child(
            root,
            NodeSpec::named("Counter").attrs(HostValue::record([
                ("count", HostValue::Int(0)),
                ("label", HostValue::str("clicks")),
            ])),
        );
        tree.append_child(root, NodeSpec::named("Footer"));
        (inspector, commits, tree)
    }

    fn counter_selector() -> (SelectorSpec, Selector) {
        let spec = SelectorSpec {
            name_match: Some("Counter".into()),
            ..SelectorSpec::default()
        };
        let selector = Selector::compile(&spec).unwrap();
        (spec, selector)
    }

    #[test]
    fn mutation_stream_is_filtered_and_projected() {
        let (inspector, mut commits, mut tree) = setup();
        inspector.ingest_commit(&tree, timing());
        let _ = commits.try_recv().unwrap();

        let mut manager = SubscriptionManager::with_seed(GovernorConfig::default(), 7);
        let (spec, selector) = counter_selector();
        let now = Instant::now();
        let id = manager.subscribe(
            OwnerId(1),
            &[Channel::MutationStream],
            Some(spec),
            Some(selector),
            Some(vec!["count".into()]),
            None,
            now,
        );

        let counter = tree.children(tree.root().unwrap())[0];
        tree.update(counter, |spec| {
            spec.attributes = HostValue::record([
                ("count", HostValue::Int(1)),
                ("label", HostValue::str("taps")),
            ])
        });
        inspector.ingest_commit(&tree, timing());
        let event = commits.try_recv().unwrap();

        let deliveries = manager.on_commit(&event, now);
        assert_eq!(deliveries.len(), 1);
        let envelope = &deliveries[0].envelope;
        assert_eq!(envelope.subscription_id, Some(id));
        assert_eq!(envelope.channel, Channel::MutationStream);
        let change = &envelope.payload["changes"][0];
        assert_eq!(change["name"], "Counter");
        assert_eq!(change["attrDiff"]["changed"], json!(["count", "label"]));
        assert_eq!(change["attrDiff"]["preview"], json!({"count": 1}));
    }

    #[test]
    fn unsubscribe_stops_delivery_but_keeps_queue() {
        let (inspector, mut commits, tree) = setup();
        let mut manager = SubscriptionManager::with_seed(GovernorConfig::default(), 7);
        let now = Instant::now();
        let id = manager.subscribe(OwnerId(1), &[Channel::Metrics], None, None, None, None, now);

        inspector.ingest_commit(&tree, timing());
        let event = commits.try_recv().unwrap();
        for delivery in manager.on_commit(&event, now) {
            assert!(manager.enqueue(delivery.envelope));
        }
        let (queued, advisory) = manager.unsubscribe(id, now).unwrap();
        assert_eq!(queued, 1);
        assert_eq!(advisory.len(), 1);
        assert_eq!(advisory[0].envelope.channel, Channel::Control);
        assert_eq!(
            advisory[0].envelope.payload,
            json!({"type": "unsubscribed", "subscriptionId": id})
        );
        assert_eq!(manager.unsubscribe(id, now), None);
        assert_eq!(manager.active_count(), 0);

        inspector.ingest_commit(&tree, timing());
        let event = commits.try_recv().unwrap();
        assert!(manager.on_commit(&event, now + Duration::from_secs(1)).is_empty());

        let drained = manager.drain(id, 10).unwrap();
        assert_eq!(drained.events.len(), 1);
        assert_eq!(drained.events[0].payload["matched"], json!(3));
        assert!(manager.drain(id, 10).is_err());
    }

    #[test]
    fn unsubscribe_advisory_waits_for_control_budget() {
        let mut manager = SubscriptionManager::with_seed(GovernorConfig::default(), 7);
        let now = Instant::now();
        let budgets = BudgetSpec::Uniform(tessera_types::Budget {
            bytes_per_sec: None,
            msg_per_sec: Some(1),
        });
        let id = manager.subscribe(OwnerId(1), &[Channel::Snapshot], None, None, None, Some(&budgets), now);

        // Second snapshot is held and spends the window's control message
        // on a `suspended` advisory.
        manager.resync(Some(id), None, now).unwrap();
        let (_, held) = manager.resync(Some(id), None, now).unwrap();
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].envelope.payload["type"], "suspended");

        let (_, advisory) = manager.unsubscribe(id, now).unwrap();
        assert!(advisory.is_empty());
        assert_eq!(manager.sweep(), 0);
        assert_eq!(manager.next_deadline(), Some(now + Duration::from_secs(1)));

        let flushed = manager.poll(now + Duration::from_secs(1));
        let control: Vec<_> = flushed
            .iter()
            .filter(|d| d.envelope.channel == Channel::Control)
            .map(|d| d.envelope.payload["type"].clone())
            .collect();
        assert_eq!(control, vec![json!("unsubscribed")]);
        assert_eq!(manager.next_deadline(), None);
        assert_eq!(manager.sweep(), 1);
        assert!(manager.get(id).is_none());
    }

    #[test]
    fn queue_is_bounded_and_counts_drops() {
        let mut manager =
            SubscriptionManager::with_seed(GovernorConfig::default(), 7).with_queue_capacity(2);
        let id = manager.subscribe(OwnerId(1), &[Channel::Control], None, None, None, None, Instant::now());
        for n in 0..5 {
            manager.enqueue(WireEnvelope {
                channel: Channel::Control,
                payload: json!({"n": n}),
                subscription_id: Some(id),
            });
        }
        let drained = manager.drain(id, 1).unwrap();
        assert_eq!(drained.events[0].payload, json!({"n": 3}));
        assert_eq!(drained.remaining, 1);
        assert_eq!(drained.dropped, 3);
    }

    #[test]
    fn resync_pushes_matching_nodes_on_snapshot() {
        let (inspector, _commits, tree) = setup();
        inspector.ingest_commit(&tree, timing());
        let mut manager = SubscriptionManager::with_seed(GovernorConfig::default(), 7);
        let (spec, selector) = counter_selector();
        let id = manager.subscribe(
            OwnerId(9),
            &[Channel::MutationStream],
            Some(spec),
            Some(selector),
            None,
            None,
            Instant::now(),
        );
        let latest = inspector.latest_entry();
        let (resynced, deliveries) = manager
            .resync(None, latest.as_deref(), Instant::now())
            .unwrap();
        assert_eq!(resynced, vec![id]);
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].owner, OwnerId(9));
        assert_eq!(deliveries[0].envelope.channel, Channel::Snapshot);
        let nodes = deliveries[0].envelope.payload["nodes"].as_array().unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0]["attrs"]["count"], json!(0));

        assert_eq!(
            manager.resync(Some(SubscriptionId::new(99)), None, Instant::now()),
            Err(UnknownSubscription(SubscriptionId::new(99)))
        );
    }

    #[test]
    fn dropping_an_owner_removes_its_subscriptions() {
        let mut manager = SubscriptionManager::with_seed(GovernorConfig::default(), 7);
        let now = Instant::now();
        manager.subscribe(OwnerId(1), &[Channel::Metrics], None, None, None, None, now);
        manager.subscribe(OwnerId(2), &[Channel::Metrics], None, None, None, None, now);
        assert_eq!(manager.drop_owner(OwnerId(1)), 1);
        assert_eq!(manager.active_count(), 1);
        assert!(manager.ids_for(OwnerId(1)).is_empty());
    }
}
