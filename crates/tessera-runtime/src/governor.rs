//! Per-subscription channel budgets.
//!
//! Every channel has a byte and a message allowance per fixed window of the
//! governor's clock. Bytes are counted as the serialized `notifications/event`
//! message a payload travels in, transport framing excluded. Nothing is ever emitted past the allowance; instead each
//! channel degrades in its own way once it runs dry:
//!
//! | channel            | over budget                                           |
//! |--------------------|-------------------------------------------------------|
//! | `mutation-stream`  | coalesce by `(fid, kind)`, flush one merged envelope  |
//! | `derived-findings` | batch, deduplicated by `(fid, kind)`                  |
//! | `metrics`          | drop most, keep a sample for the next window          |
//! | `control`          | hold until the next window                            |
//! | `snapshot`         | hold until the next window                            |
//!
//! Held queues keep the newest 64 payloads; older ones are counted in
//! [`Governor::dropped`].
//!
//! The governor owns no timers. Callers feed it the current instant and ask
//! for [`Governor::next_deadline`]; polling early or with nothing pending is
//! a no-op.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{Value, json};
use tessera_types::{
    BudgetSpec, ChangeKind, ChangeRecord, Channel, Coalesced, Fid, Finding, FindingKind,
    MutationEnvelope, SubscriptionId, WireEnvelope,
};
use tessera_wire::event_notification;
use tracing::{debug, warn};

const HELD_PER_CHANNEL: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelBudget {
    pub bytes_per_sec: u64,
    pub msg_per_sec: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GovernorConfig {
    pub window: Duration,
    pub coalesce_window: Duration,
    /// Fraction of over-budget metrics samples that are discarded outright.
    pub sample_drop: f64,
    pub defaults: BTreeMap<Channel, ChannelBudget>,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        let defaults = [
            (Channel::MutationStream, 64 * 1024, 30),
            (Channel::DerivedFindings, 16 * 1024, 10),
            (Channel::Metrics, 8 * 1024, 5),
            (Channel::Control, 4 * 1024, 5),
            (Channel::Snapshot, 512 * 1024, 2),
        ]
        .into_iter()
        .map(|(channel, bytes_per_sec, msg_per_sec)| {
            (
                channel,
                ChannelBudget {
                    bytes_per_sec,
                    msg_per_sec,
                },
            )
        })
        .collect();
        Self {
            window: Duration::from_secs(1),
            coalesce_window: Duration::from_millis(50),
            sample_drop: 0.9,
            defaults,
        }
    }
}

impl GovernorConfig {
    /// Effective budget for `channel`: subscriber overrides on top of the
    /// defaults. Zero allowances are raised to one.
    pub fn budget_for(&self, channel: Channel, overrides: Option<&BudgetSpec>) -> ChannelBudget {
        let base = self.defaults.get(&channel).copied().unwrap_or(ChannelBudget {
            bytes_per_sec: 4 * 1024,
            msg_per_sec: 5,
        });
        let custom = overrides.and_then(|spec| spec.for_channel(channel));
        ChannelBudget {
            bytes_per_sec: custom
                .and_then(|b| b.bytes_per_sec)
                .unwrap_or(base.bytes_per_sec)
                .max(1),
            msg_per_sec: custom
                .and_then(|b| b.msg_per_sec)
                .unwrap_or(base.msg_per_sec)
                .max(1),
        }
    }
}

/// A payload the governor let through.
#[derive(Debug, Clone, PartialEq)]
pub struct Emitted {
    pub channel: Channel,
    pub payload: Value,
}

/// Something a subscription wants to send.
#[derive(Debug, Clone)]
pub enum Offer {
    Mutation(MutationEnvelope),
    Finding(Finding),
    Metrics(Value),
    Control(Value),
    Snapshot(Value),
}

impl Offer {
    pub fn channel(&self) -> Channel {
        match self {
            Offer::Mutation(_) => Channel::MutationStream,
            Offer::Finding(_) => Channel::DerivedFindings,
            Offer::Metrics(_) => Channel::Metrics,
            Offer::Control(_) => Channel::Control,
            Offer::Snapshot(_) => Channel::Snapshot,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Advisory {
    Sampling,
    Suspended,
    Oversized,
}

impl Advisory {
    fn as_str(self) -> &'static str {
        match self {
            Advisory::Sampling => "sampling",
            Advisory::Suspended => "suspended",
            Advisory::Oversized => "oversized",
        }
    }
}

// ── Buckets ─────────────────────────────────────────────────────

#[derive(Debug)]
struct Bucket {
    budget: ChannelBudget,
    window: u64,
    bytes_used: u64,
    msgs_used: u64,
}

impl Bucket {
    fn fits(&self, bytes: u64) -> bool {
        self.msgs_used < self.budget.msg_per_sec
            && self.bytes_used.saturating_add(bytes) <= self.budget.bytes_per_sec
    }

    fn take(&mut self, bytes: u64) {
        self.msgs_used += 1;
        self.bytes_used += bytes;
    }

    fn roll(&mut self, window: u64) {
        if window != self.window {
            self.window = window;
            self.bytes_used = 0;
            self.msgs_used = 0;
        }
    }
}

// ── Coalescing ──────────────────────────────────────────────────

#[derive(Debug)]
struct CoalesceBuffer {
    session_id: String,
    first_sequence_no: u64,
    last_sequence_no: u64,
    timestamp: i64,
    duration_ms: f64,
    envelopes: u32,
    changes: Vec<ChangeRecord>,
    index: HashMap<(Fid, ChangeKind), usize>,
    deadline: Instant,
}

impl CoalesceBuffer {
    fn new(envelope: MutationEnvelope, deadline: Instant) -> Self {
        let first_sequence_no = envelope
            .coalesced
            .map(|c| c.first_sequence_no)
            .unwrap_or(envelope.sequence_no);
        let mut buffer = Self {
            session_id: envelope.session_id.clone(),
            first_sequence_no,
            last_sequence_no: envelope.sequence_no,
            timestamp: envelope.timestamp,
            duration_ms: 0.0,
            envelopes: 0,
            changes: Vec::new(),
            index: HashMap::new(),
            deadline,
        };
        buffer.absorb(envelope);
        buffer
    }

    /// Repeated `(fid, kind)` pairs overwrite the earlier record in place.
    fn absorb(&mut self, envelope: MutationEnvelope) {
        self.last_sequence_no = envelope.sequence_no;
        self.timestamp = envelope.timestamp;
        self.duration_ms += envelope.duration_ms;
        self.envelopes += envelope.coalesced.map(|c| c.envelopes).unwrap_or(1);
        for change in envelope.changes {
            let key = (change.fid, change.kind);
            match self.index.get(&key) {
                Some(&at) => self.changes[at] = change,
                None => {
                    self.index.insert(key, self.changes.len());
                    self.changes.push(change);
                }
            }
        }
    }

    fn merged(&self) -> MutationEnvelope {
        MutationEnvelope {
            session_id: self.session_id.clone(),
            sequence_no: self.last_sequence_no,
            timestamp: self.timestamp,
            duration_ms: self.duration_ms,
            changes: self.changes.clone(),
            coalesced: (self.envelopes > 1).then_some(Coalesced {
                first_sequence_no: self.first_sequence_no,
                envelopes: self.envelopes,
            }),
        }
    }
}

// ── Governor ────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Governor {
    config: GovernorConfig,
    epoch: Instant,
    buckets: BTreeMap<Channel, Bucket>,
    coalesce: Option<CoalesceBuffer>,
    findings: Vec<Finding>,
    finding_keys: HashSet<(Fid, FindingKind)>,
    metrics_sample: Option<Value>,
    held: BTreeMap<Channel, VecDeque<Value>>,
    /// Held payloads evicted to make room, per channel.
    held_dropped: BTreeMap<Channel, u64>,
    /// Bytes a notification adds around its payload, per channel.
    overhead: BTreeMap<Channel, u64>,
    /// Window in which each advisory was last sent, per channel.
    advised: HashMap<(Channel, Advisory), u64>,
    /// Set whenever something waits for a future window.
    backlog_deadline: Option<Instant>,
    rng: StdRng,
}

impl Governor {
    pub fn new(
        config: GovernorConfig,
        overrides: Option<&BudgetSpec>,
        seed: u64,
        epoch: Instant,
    ) -> Self {
        let buckets = Channel::ALL
            .into_iter()
            .map(|channel| {
                (
                    channel,
                    Bucket {
                        budget: config.budget_for(channel, overrides),
                        window: 0,
                        bytes_used: 0,
                        msgs_used: 0,
                    },
                )
            })
            .collect();
        Self {
            config,
            epoch,
            buckets,
            coalesce: None,
            findings: Vec::new(),
            finding_keys: HashSet::new(),
            metrics_sample: None,
            held: BTreeMap::new(),
            held_dropped: BTreeMap::new(),
            overhead: envelope_overhead(None),
            advised: HashMap::new(),
            backlog_deadline: None,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Accounts for the subscription id stamped on every envelope.
    pub fn for_subscription(mut self, id: SubscriptionId) -> Self {
        self.overhead = envelope_overhead(Some(id));
        self
    }

    pub fn budget(&self, channel: Channel) -> Option<ChannelBudget> {
        self.buckets.get(&channel).map(|b| b.budget)
    }

    fn window_index(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.epoch).as_nanos();
        (elapsed / self.config.window.as_nanos().max(1)) as u64
    }

    fn window_start(&self, index: u64) -> Instant {
        let nanos = self.config.window.as_nanos().max(1) * index as u128;
        self.epoch + Duration::from_nanos(nanos as u64)
    }

    fn next_window_start(&self, now: Instant) -> Instant {
        self.window_start(self.window_index(now) + 1)
    }

    fn roll(&mut self, now: Instant) -> u64 {
        let window = self.window_index(now);
        for bucket in self.buckets.values_mut() {
            bucket.roll(window);
        }
        window
    }

    /// Payloads evicted from `channel`'s held queue so far.
    pub fn dropped(&self, channel: Channel) -> u64 {
        self.held_dropped.get(&channel).copied().unwrap_or(0)
    }

    /// Wire size of `payload` once wrapped for delivery on `channel`.
    fn cost(&self, channel: Channel, payload: &Value) -> u64 {
        payload_len(payload) + self.overhead.get(&channel).copied().unwrap_or(0)
    }

    /// Charges `bytes` to `channel` if it fits this window.
    fn admit(&mut self, channel: Channel, bytes: u64) -> bool {
        match self.buckets.get_mut(&channel) {
            Some(bucket) if bucket.fits(bytes) => {
                bucket.take(bytes);
                true
            }
            _ => false,
        }
    }

    fn oversized(&self, channel: Channel, bytes: u64) -> bool {
        self.buckets
            .get(&channel)
            .is_some_and(|b| bytes > b.budget.bytes_per_sec)
    }

    fn wait_for_next_window(&mut self, now: Instant) {
        let next = self.next_window_start(now);
        self.backlog_deadline = Some(self.backlog_deadline.map_or(next, |d| d.min(next)));
    }

    pub fn offer(&mut self, offer: Offer, now: Instant) -> Vec<Emitted> {
        let window = self.roll(now);
        let mut out = Vec::new();
        let channel = offer.channel();
        match offer {
            Offer::Mutation(envelope) => self.offer_mutation(envelope, now, window, &mut out),
            Offer::Finding(finding) => self.offer_finding(finding, now, window, &mut out),
            Offer::Metrics(payload) => self.offer_metrics(payload, now, window, &mut out),
            Offer::Control(payload) | Offer::Snapshot(payload) => {
                self.offer_held(channel, payload, now, window, &mut out)
            }
        }
        out
    }

    fn offer_mutation(
        &mut self,
        envelope: MutationEnvelope,
        now: Instant,
        window: u64,
        out: &mut Vec<Emitted>,
    ) {
        if let Some(buffer) = &mut self.coalesce {
            buffer.absorb(envelope);
            return;
        }
        let payload = to_payload(&envelope);
        let bytes = self.cost(Channel::MutationStream, &payload);
        if self.oversized(Channel::MutationStream, bytes) {
            self.advise(Channel::MutationStream, Advisory::Oversized, bytes, now, window, out);
            return;
        }
        if self.admit(Channel::MutationStream, bytes) {
            out.push(Emitted {
                channel: Channel::MutationStream,
                payload,
            });
            return;
        }
        debug!(sequence_no = envelope.sequence_no, "mutation-stream over budget; coalescing");
        self.coalesce = Some(CoalesceBuffer::new(
            envelope,
            now + self.config.coalesce_window,
        ));
    }

    fn offer_finding(&mut self, finding: Finding, now: Instant, window: u64, out: &mut Vec<Emitted>) {
        let channel = Channel::DerivedFindings;
        if self.findings.is_empty() {
            let payload = to_payload(&finding);
            let bytes = self.cost(channel, &payload);
            if self.oversized(channel, bytes) {
                self.advise(channel, Advisory::Oversized, bytes, now, window, out);
                return;
            }
            if self.admit(channel, bytes) {
                out.push(Emitted { channel, payload });
                return;
            }
        }
        let key = (finding.fid, finding.kind);
        if self.finding_keys.insert(key) {
            self.findings.push(finding);
        } else if let Some(slot) = self
            .findings
            .iter_mut()
            .find(|f| (f.fid, f.kind) == key)
        {
            *slot = finding;
        }
        self.wait_for_next_window(now);
    }

    fn offer_metrics(&mut self, payload: Value, now: Instant, window: u64, out: &mut Vec<Emitted>) {
        let channel = Channel::Metrics;
        let bytes = self.cost(channel, &payload);
        if self.oversized(channel, bytes) {
            self.advise(channel, Advisory::Oversized, bytes, now, window, out);
            return;
        }
        if self.admit(channel, bytes) {
            out.push(Emitted { channel, payload });
            return;
        }
        self.advise(channel, Advisory::Sampling, bytes, now, window, out);
        if self.rng.random::<f64>() < self.config.sample_drop {
            return;
        }
        self.metrics_sample = Some(payload);
        self.wait_for_next_window(now);
    }

    fn offer_held(
        &mut self,
        channel: Channel,
        payload: Value,
        now: Instant,
        window: u64,
        out: &mut Vec<Emitted>,
    ) {
        let bytes = self.cost(channel, &payload);
        if self.oversized(channel, bytes) {
            if channel != Channel::Control {
                self.advise(channel, Advisory::Oversized, bytes, now, window, out);
            }
            return;
        }
        let backlog = self.held.get(&channel).is_some_and(|q| !q.is_empty());
        if !backlog && self.admit(channel, bytes) {
            out.push(Emitted { channel, payload });
            return;
        }
        let queue = self.held.entry(channel).or_default();
        if queue.len() == HELD_PER_CHANNEL {
            queue.pop_front();
            let dropped = self.held_dropped.entry(channel).or_default();
            *dropped += 1;
            warn!(%channel, dropped = *dropped, "held queue full; dropped oldest payload");
        }
        queue.push_back(payload);
        if channel != Channel::Control {
            self.advise(channel, Advisory::Suspended, bytes, now, window, out);
        }
        self.wait_for_next_window(now);
    }

    /// Sends an advisory on `control`, at most once per window per
    /// `(channel, advisory)`.
    fn advise(
        &mut self,
        channel: Channel,
        advisory: Advisory,
        bytes: u64,
        now: Instant,
        window: u64,
        out: &mut Vec<Emitted>,
    ) {
        if self.advised.get(&(channel, advisory)) == Some(&window) {
            return;
        }
        self.advised.insert((channel, advisory), window);
        let budget = self.budget(channel);
        let resume_in_ms = self
            .next_window_start(now)
            .saturating_duration_since(now)
            .as_millis() as u64;
        let payload = json!({
            "type": advisory.as_str(),
            "channel": channel,
            "bytes": bytes,
            "budget": budget.map(|b| json!({
                "bytesPerSec": b.bytes_per_sec,
                "msgPerSec": b.msg_per_sec,
            })),
            "resumeInMs": resume_in_ms,
            "dropped": self.dropped(channel),
        });
        self.offer_held(Channel::Control, payload, now, window, out);
    }

    /// Flushes whatever has become due by `now`.
    pub fn poll(&mut self, now: Instant) -> Vec<Emitted> {
        let window = self.roll(now);
        let mut out = Vec::new();
        if self.backlog_deadline.is_some_and(|d| d <= now) {
            self.backlog_deadline = None;
        }

        self.flush_coalesced(now, window, &mut out);

        while let Some(first) = self.findings.first() {
            let payload = to_payload(first);
            let bytes = self.cost(Channel::DerivedFindings, &payload);
            if !self.admit(Channel::DerivedFindings, bytes) {
                break;
            }
            let finding = self.findings.remove(0);
            self.finding_keys.remove(&(finding.fid, finding.kind));
            out.push(Emitted {
                channel: Channel::DerivedFindings,
                payload,
            });
        }

        if let Some(sample) = self.metrics_sample.take() {
            let bytes = self.cost(Channel::Metrics, &sample);
            if self.admit(Channel::Metrics, bytes) {
                out.push(Emitted {
                    channel: Channel::Metrics,
                    payload: sample,
                });
            } else {
                self.metrics_sample = Some(sample);
            }
        }

        for channel in [Channel::Control, Channel::Snapshot] {
            loop {
                let Some(front) = self.held.get(&channel).and_then(|q| q.front()) else {
                    break;
                };
                let bytes = self.cost(channel, front);
                if !self.admit(channel, bytes) {
                    break;
                }
                if let Some(payload) = self.held.get_mut(&channel).and_then(|q| q.pop_front()) {
                    out.push(Emitted { channel, payload });
                }
            }
        }

        let backlog = !self.findings.is_empty()
            || self.metrics_sample.is_some()
            || self.held.values().any(|q| !q.is_empty());
        if backlog {
            self.wait_for_next_window(now);
        }
        out
    }

    fn flush_coalesced(&mut self, now: Instant, window: u64, out: &mut Vec<Emitted>) {
        let Some(buffer) = &self.coalesce else {
            return;
        };
        if buffer.deadline > now {
            return;
        }
        let merged = buffer.merged();
        let payload = to_payload(&merged);
        let bytes = self.cost(Channel::MutationStream, &payload);
        if self.oversized(Channel::MutationStream, bytes) {
            self.coalesce = None;
            self.advise(Channel::MutationStream, Advisory::Oversized, bytes, now, window, out);
            return;
        }
        if self.admit(Channel::MutationStream, bytes) {
            self.coalesce = None;
            out.push(Emitted {
                channel: Channel::MutationStream,
                payload,
            });
            return;
        }
        let retry = self.next_window_start(now);
        if let Some(buffer) = &mut self.coalesce {
            buffer.deadline = retry;
        }
    }

    /// Earliest instant at which [`Governor::poll`] may emit something.
    pub fn next_deadline(&self) -> Option<Instant> {
        let coalesce = self.coalesce.as_ref().map(|b| b.deadline);
        match (coalesce, self.backlog_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.next_deadline().is_none()
    }
}

fn to_payload<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn payload_len(payload: &Value) -> u64 {
    payload.to_string().len() as u64
}

/// Size of the notification around a `null` payload, less the `null` itself.
/// Compact JSON serializes a nested value exactly as it would alone, so this
/// plus the payload's own length is the full message size.
fn envelope_overhead(subscription_id: Option<SubscriptionId>) -> BTreeMap<Channel, u64> {
    Channel::ALL
        .into_iter()
        .map(|channel| {
            let envelope = WireEnvelope {
                channel,
                payload: Value::Null,
                subscription_id,
            };
            let framed = event_notification(&envelope)
                .and_then(|n| serde_json::to_vec(&n))
                .map_or(0, |bytes| bytes.len() as u64);
            (channel, framed.saturating_sub(Value::Null.to_string().len() as u64))
        })
        .collect()
}
