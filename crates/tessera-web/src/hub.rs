//! Process-wide state shared by every transport: the inspector, the
//! subscription table, and one push sink per connected owner.
//!
//! The hub task is the only place that feeds commits into the subscription
//! manager and the only place that wakes up for governor deadlines.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tessera_runtime::{
    CommitEvent, Delivery, GovernorConfig, Inspector, OwnerId, Selector, SubscriptionManager,
    target_of,
};
use tessera_types::{
    NextEventsParams, NextEventsResult, QueryParams, QueryResult, QueryType,
    ResyncParams, ResyncResult, SubscribeParams, SubscribeResult, SubscribeStatus, SubscriptionId,
    UnsubscribeParams, UnsubscribeResult, WireEnvelope,
};
use tessera_wire::RpcError;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};

/// Envelopes buffered per push sink before falling back to the pull queue.
pub const SINK_CAPACITY: usize = 256;

pub struct Hub {
    inspector: Arc<Inspector>,
    subscriptions: Mutex<SubscriptionManager>,
    sinks: Mutex<HashMap<OwnerId, mpsc::Sender<WireEnvelope>>>,
    next_owner: AtomicU64,
    rearm: Notify,
    deref_timeout: Duration,
}

impl Hub {
    pub fn new(inspector: Arc<Inspector>, governor: GovernorConfig, deref_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            inspector,
            subscriptions: Mutex::new(SubscriptionManager::new(governor)),
            sinks: Mutex::new(HashMap::new()),
            next_owner: AtomicU64::new(1),
            rearm: Notify::new(),
            deref_timeout,
        })
    }

    pub fn inspector(&self) -> &Arc<Inspector> {
        &self.inspector
    }

    /// Governor clock. Follows tokio's clock so paused-time tests drive it.
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    // ── Owners ──────────────────────────────────────────────────

    pub fn register_owner(&self) -> OwnerId {
        OwnerId(self.next_owner.fetch_add(1, Ordering::Relaxed))
    }

    /// Opens a push sink for `owner`. Replaces any previous one.
    pub fn attach(&self, owner: OwnerId) -> mpsc::Receiver<WireEnvelope> {
        let (tx, rx) = mpsc::channel(SINK_CAPACITY);
        self.sinks.lock().insert(owner, tx);
        rx
    }

    /// Closes the push sink only; events fall back to the pull queue.
    pub fn detach_sink(&self, owner: OwnerId) {
        self.sinks.lock().remove(&owner);
    }

    /// The owner's connection is gone: forget its sink and subscriptions.
    pub fn release(&self, owner: OwnerId) {
        self.detach_sink(owner);
        let dropped = self.subscriptions.lock().drop_owner(owner);
        debug!(owner = owner.0, dropped, "owner released");
        self.rearm.notify_one();
    }

    pub fn subscription_count(&self, owner: OwnerId) -> usize {
        self.subscriptions.lock().ids_for(owner).len()
    }

    /// Active subscriptions across every owner.
    pub fn active_subscriptions(&self) -> usize {
        self.subscriptions.lock().active_count()
    }

    /// Whether `owner` has a push sink that someone is still reading.
    pub fn has_live_sink(&self, owner: OwnerId) -> bool {
        self.sinks.lock().get(&owner).is_some_and(|sink| !sink.is_closed())
    }

    // ── Delivery ────────────────────────────────────────────────

    /// Pushes to the owner's sink when it has room, otherwise queues the
    /// envelope for `nextEvents`. Finished subscriptions are forgotten
    /// afterwards.
    fn deliver(&self, deliveries: Vec<Delivery>) {
        let mut unpushed = Vec::new();
        {
            let mut sinks = self.sinks.lock();
            for Delivery { owner, envelope } in deliveries {
                let Some(sink) = sinks.get(&owner) else {
                    unpushed.push(envelope);
                    continue;
                };
                match sink.try_send(envelope) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(envelope)) => {
                        debug!(owner = owner.0, "push sink full, queueing");
                        unpushed.push(envelope);
                    }
                    Err(mpsc::error::TrySendError::Closed(envelope)) => {
                        sinks.remove(&owner);
                        unpushed.push(envelope);
                    }
                }
            }
        }
        let mut subscriptions = self.subscriptions.lock();
        for envelope in unpushed {
            subscriptions.enqueue(envelope);
        }
        subscriptions.sweep();
    }

    /// Fans commits out and services governor deadlines until the inspector
    /// is dropped.
    pub async fn run(self: Arc<Self>, mut commits: mpsc::Receiver<Arc<CommitEvent>>) {
        info!("hub started");
        loop {
            let deadline = self.subscriptions.lock().next_deadline();
            tokio::select! {
                event = commits.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    let deliveries = self.subscriptions.lock().on_commit(&event, self.now());
                    self.deliver(deliveries);
                }
                _ = sleep_until(deadline) => {
                    let deliveries = self.subscriptions.lock().poll(self.now());
                    self.deliver(deliveries);
                }
                _ = self.rearm.notified() => {}
            }
        }
        info!("commit stream closed, hub stopped");
    }

    // ── Tools ───────────────────────────────────────────────────

    pub async fn subscribe(
        &self,
        owner: OwnerId,
        params: SubscribeParams,
    ) -> Result<SubscribeResult, RpcError> {
        if params.channels.is_empty() {
            return Err(RpcError::InvalidParams("`channels` must not be empty".into()));
        }
        let selector = params
            .selector
            .as_ref()
            .map(Selector::compile)
            .transpose()
            .map_err(|e| RpcError::InvalidParams(format!("selector: {e}")))?;

        // Registered before the scan so a commit landing in between is
        // delivered rather than missed.
        let mut channels = params.channels.clone();
        channels.sort();
        channels.dedup();
        let scan_selector = selector.clone();
        let id = self.subscriptions.lock().subscribe(
            owner,
            &channels,
            params.selector.clone(),
            selector,
            params.fields.clone(),
            params.budgets.as_ref(),
            self.now(),
        );
        self.rearm.notify_one();

        let timeout = params.timeout();
        let committed = self.inspector.wait_for_commit(timeout).await;
        let scan = self.inspector.scan(scan_selector.as_ref());
        let targets: Vec<_> = scan
            .iter()
            .flat_map(|scan| scan.matches.iter())
            .map(|node| target_of(node))
            .collect();

        let (status, warning) = match (committed, targets.is_empty()) {
            (false, _) => (
                SubscribeStatus::Empty,
                Some(format!(
                    "no commit observed within {}ms; events will flow once the host commits",
                    timeout.as_millis()
                )),
            ),
            (true, true) => (
                SubscribeStatus::Empty,
                Some("selector matched no named nodes in the latest commit".to_string()),
            ),
            (true, false) => (SubscribeStatus::Ok, None),
        };
        Ok(SubscribeResult {
            subscription_id: id,
            channels,
            selector: params.selector,
            targets,
            status,
            warning,
        })
    }

    fn check_owner(&self, owner: OwnerId, id: SubscriptionId) -> Result<(), RpcError> {
        match self.subscriptions.lock().get(id) {
            Some(subscription) if subscription.owner == owner => Ok(()),
            _ => Err(RpcError::InvalidParams(format!("unknown subscription {id}"))),
        }
    }

    pub fn unsubscribe(
        &self,
        owner: OwnerId,
        params: UnsubscribeParams,
    ) -> Result<UnsubscribeResult, RpcError> {
        let id = params.subscription_id;
        if self.check_owner(owner, id).is_err() {
            return Ok(UnsubscribeResult {
                subscription_id: id,
                removed: false,
                queued: 0,
            });
        }
        let removed = self.subscriptions.lock().unsubscribe(id, self.now());
        let queued = match removed {
            Some((queued, advisory)) => {
                self.deliver(advisory);
                Some(queued)
            }
            None => None,
        };
        self.rearm.notify_one();
        Ok(UnsubscribeResult {
            subscription_id: id,
            removed: queued.is_some(),
            queued: queued.unwrap_or(0),
        })
    }

    pub fn next_events(
        &self,
        owner: OwnerId,
        params: NextEventsParams,
    ) -> Result<NextEventsResult, RpcError> {
        let id = params.subscription_id;
        self.check_owner(owner, id)?;
        let drained = self
            .subscriptions
            .lock()
            .drain(id, params.max())
            .map_err(|e| RpcError::InvalidParams(e.to_string()))?;
        Ok(NextEventsResult {
            subscription_id: id,
            events: drained.events,
            remaining: drained.remaining,
            dropped: drained.dropped,
        })
    }

    pub fn resync(&self, owner: OwnerId, params: ResyncParams) -> Result<ResyncResult, RpcError> {
        if let Some(id) = params.subscription_id {
            self.check_owner(owner, id)?;
        }
        let latest = self.inspector.latest_entry();
        let now = self.now();
        let (resynced, deliveries) = {
            let mut subscriptions = self.subscriptions.lock();
            let target = params.subscription_id;
            let result = match target {
                Some(_) => subscriptions.resync(target, latest.as_deref(), now),
                None => {
                    // Only this owner's subscriptions.
                    let mut resynced = Vec::new();
                    let mut deliveries = Vec::new();
                    for id in subscriptions.ids_for(owner) {
                        let (ids, out) = subscriptions
                            .resync(Some(id), latest.as_deref(), now)
                            .map_err(|e| RpcError::Internal(e.to_string()))?;
                        resynced.extend(ids);
                        deliveries.extend(out);
                    }
                    Ok((resynced, deliveries))
                }
            };
            result.map_err(|e| RpcError::InvalidParams(e.to_string()))?
        };
        self.deliver(deliveries);
        self.rearm.notify_one();
        Ok(ResyncResult {
            resynced,
            sequence_no: latest.map(|entry| entry.sequence_no),
        })
    }

    /// Answers an on-demand query off the async executor, bounded by the
    /// dereference timeout.
    pub async fn query(
        &self,
        query_type: QueryType,
        params: QueryParams,
    ) -> Result<QueryResult, RpcError> {
        let inspector = self.inspector.clone();
        let work = tokio::task::spawn_blocking(move || {
            inspector.query(query_type, &params.fid, params.commit_id, &params.paths)
        });
        match tokio::time::timeout(self.deref_timeout, work).await {
            Ok(Ok(result)) => result.map_err(|e| RpcError::InvalidParams(e.to_string())),
            Ok(Err(e)) => Err(RpcError::Internal(format!("query worker failed: {e}"))),
            Err(_) => {
                warn!(?query_type, timeout_ms = self.deref_timeout.as_millis() as u64, "query timed out");
                Err(RpcError::DerefTimeout(self.deref_timeout))
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}
