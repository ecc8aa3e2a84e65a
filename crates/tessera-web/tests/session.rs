use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tessera_runtime::{
    CommitTiming, GovernorConfig, HostValue, Inspector, InspectorConfig, MemoryTree, NodeKey,
    NodeSpec,
};
use tessera_web::{ConnState, Hub, Session};
use tessera_wire::RpcError;

struct Fixture {
    inspector: Arc<Inspector>,
    hub: Arc<Hub>,
    tree: MemoryTree,
    counter: NodeKey,
}

impl Fixture {
    fn new() -> Self {
        let (inspector, commits) = Inspector::new(InspectorConfig::default());
        let hub = Hub::new(
            inspector.clone(),
            GovernorConfig::default(),
            Duration::from_secs(1),
        );
        tokio::spawn(hub.clone().run(commits));

        let mut tree = MemoryTree::new();
        let root = tree.set_root(NodeSpec::named("App"));
        let counter = tree.append_child(
            root,
            NodeSpec::named("Counter")
                .source("src/Counter.tsx", 8)
                .attrs(HostValue::record([("count", HostValue::Int(0))]))
                .state(HostValue::record([("clicks", HostValue::Int(0))])),
        );
        Self {
            inspector,
            hub,
            tree,
            counter,
        }
    }

    fn commit(&self) -> u64 {
        self.inspector
            .ingest_commit(&self.tree, CommitTiming::now(Duration::from_millis(2)))
    }

    fn bump(&mut self, count: i64) -> u64 {
        self.tree.update(self.counter, |spec| {
            spec.attributes = HostValue::record([("count", HostValue::Int(count))]);
        });
        self.commit()
    }
}

async fn rpc(session: &mut Session, id: i64, method: &str, params: Value) -> Value {
    let frame = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
    let reply = session
        .handle_frame(frame.to_string().as_bytes())
        .await
        .expect("request gets a reply");
    serde_json::from_str(&reply).unwrap()
}

async fn call(session: &mut Session, id: i64, tool: &str, arguments: Value) -> Value {
    rpc(
        session,
        id,
        "tools/call",
        json!({"name": tool, "arguments": arguments}),
    )
    .await
}

async fn ready_session(hub: &Arc<Hub>) -> Session {
    let mut session = Session::new(hub.clone());
    let reply = rpc(&mut session, 0, "initialize", json!({})).await;
    assert_eq!(reply["result"]["serverInfo"]["name"], "tessera");
    session
}

#[tokio::test]
async fn tools_require_initialize() {
    let fixture = Fixture::new();
    let mut session = Session::new(fixture.hub.clone());
    assert_eq!(session.state(), ConnState::Uninitialized);

    let reply = rpc(&mut session, 1, "tools/list", json!({})).await;
    assert_eq!(reply["error"]["code"], RpcError::NOT_INITIALIZED);

    // ping is allowed before initialize
    let reply = rpc(&mut session, 2, "ping", json!({})).await;
    assert_eq!(reply["result"], json!({}));

    rpc(&mut session, 3, "initialize", json!({})).await;
    assert_eq!(session.state(), ConnState::Ready);

    let reply = rpc(&mut session, 4, "tools/list", json!({})).await;
    let names: Vec<&str> = reply["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|tool| tool["name"].as_str())
        .collect();
    for expected in ["subscribe", "unsubscribe", "nextEvents", "getProps", "resync"] {
        assert!(names.contains(&expected), "missing {expected} in {names:?}");
    }
}

#[tokio::test]
async fn notifications_and_unknown_methods() {
    let fixture = Fixture::new();
    let mut session = ready_session(&fixture.hub).await;

    let note = json!({"jsonrpc": "2.0", "method": "notifications/initialized"});
    assert!(session.handle_frame(note.to_string().as_bytes()).await.is_none());

    let reply = rpc(&mut session, 1, "tools/frobnicate", json!({})).await;
    assert_eq!(reply["error"]["code"], RpcError::METHOD_NOT_FOUND);

    let reply = call(&mut session, 2, "frobnicate", json!({})).await;
    assert_eq!(reply["error"]["code"], RpcError::INVALID_PARAMS);

    let reply = session.handle_frame(b"{not json").await.unwrap();
    let reply: Value = serde_json::from_str(&reply).unwrap();
    assert_eq!(reply["error"]["code"], RpcError::PARSE);
}

#[tokio::test]
async fn subscribe_reports_targets_or_empty() {
    let fixture = Fixture::new();
    let mut session = ready_session(&fixture.hub).await;

    // No commit yet: empty with a warning after the timeout.
    let reply = call(
        &mut session,
        1,
        "subscribe",
        json!({"channels": ["mutation-stream"], "timeoutMs": 50}),
    )
    .await;
    let result = &reply["result"]["structuredContent"];
    assert_eq!(result["status"], "empty");
    assert!(result["warning"].is_string());
    assert_eq!(session.state(), ConnState::Subscribed);

    fixture.commit();
    let reply = call(
        &mut session,
        2,
        "subscribe",
        json!({"channels": ["mutation-stream"], "selector": {"nameMatch": "Counter"}}),
    )
    .await;
    let result = &reply["result"]["structuredContent"];
    assert_eq!(result["status"], "ok");
    let targets = result["targets"].as_array().unwrap();
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0]["displayName"], "Counter");
    assert!(targets[0]["fid"].as_str().unwrap().starts_with("fid-"));
    assert_eq!(fixture.hub.subscription_count(session.owner()), 2);

    let reply = call(&mut session, 3, "subscribe", json!({"channels": []})).await;
    assert_eq!(reply["error"]["code"], RpcError::INVALID_PARAMS);

    let reply = call(
        &mut session,
        4,
        "subscribe",
        json!({"channels": ["mutation-stream"], "selector": {"nameMatch": "/[/"}}),
    )
    .await;
    assert_eq!(reply["error"]["code"], RpcError::INVALID_PARAMS);
}

#[tokio::test]
async fn commit_during_subscribe_wait_is_delivered() {
    let fixture = Fixture::new();
    let mut session = ready_session(&fixture.hub).await;

    let inspector = fixture.inspector.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut tree = MemoryTree::new();
        let root = tree.set_root(NodeSpec::named("App"));
        tree.append_child(root, NodeSpec::named("Counter"));
        inspector.ingest_commit(&tree, CommitTiming::now(Duration::from_millis(2)));
    });

    let reply = call(
        &mut session,
        1,
        "subscribe",
        json!({
            "channels": ["mutation-stream"],
            "selector": {"nameMatch": "Counter"},
            "timeoutMs": 1500,
        }),
    )
    .await;
    let result = &reply["result"]["structuredContent"];
    assert_eq!(result["status"], "ok");
    let id = result["subscriptionId"].clone();

    let mounts_counter = |event: &Value| {
        event["payload"]["changes"]
            .as_array()
            .is_some_and(|changes| changes.iter().any(|change| change["name"] == "Counter"))
    };
    let mut events: Vec<Value> = Vec::new();
    for attempt in 0..100 {
        let reply = call(&mut session, 10 + attempt, "nextEvents", json!({"subscriptionId": id})).await;
        events.extend(
            reply["result"]["structuredContent"]["events"]
                .as_array()
                .cloned()
                .unwrap_or_default(),
        );
        if events.iter().any(mounts_counter) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(events.iter().any(mounts_counter), "commit missed: {events:?}");
}

#[tokio::test]
async fn queries_answer_from_history() {
    let fixture = Fixture::new();
    let sequence_no = fixture.commit();
    let mut session = ready_session(&fixture.hub).await;

    let reply = call(
        &mut session,
        1,
        "subscribe",
        json!({"channels": ["snapshot"], "selector": {"nameMatch": "Counter"}}),
    )
    .await;
    let fid = reply["result"]["structuredContent"]["targets"][0]["fid"]
        .as_str()
        .unwrap()
        .to_string();
    let subscription_id = reply["result"]["structuredContent"]["subscriptionId"]
        .as_str()
        .unwrap()
        .to_string();

    let reply = call(&mut session, 2, "getProps", json!({"fid": fid})).await;
    let result = &reply["result"]["structuredContent"];
    assert_eq!(result["kind"], "exact");
    assert_eq!(result["commitId"], sequence_no);
    assert_eq!(result["data"]["count"], 0);

    let reply = call(
        &mut session,
        3,
        "getHooksState",
        json!({"fid": fid, "paths": ["clicks", "nope"]}),
    )
    .await;
    assert_eq!(
        reply["result"]["structuredContent"]["data"],
        json!({"clicks": 0, "nope": null})
    );

    let reply = call(&mut session, 4, "getHooksState", json!({"fid": "missing"})).await;
    let result = &reply["result"]["structuredContent"];
    assert_eq!(result["kind"], "notReady");
    assert_eq!(result["data"]["reason"], "noSource");

    // A subscription id where a fid belongs is a caller bug.
    let reply = call(&mut session, 5, "getContext", json!({"fid": subscription_id})).await;
    assert_eq!(reply["error"]["code"], RpcError::INVALID_PARAMS);
}

fn has_update(event: &Value) -> bool {
    event["payload"]["changes"]
        .as_array()
        .is_some_and(|changes| changes.iter().any(|change| change["kind"] == "update"))
}

#[tokio::test]
async fn next_events_drains_without_a_push_sink() {
    let mut fixture = Fixture::new();
    fixture.commit();
    let mut session = ready_session(&fixture.hub).await;

    let reply = call(
        &mut session,
        1,
        "subscribe",
        json!({"channels": ["mutation-stream"], "selector": {"nameMatch": "Counter"}}),
    )
    .await;
    let id = reply["result"]["structuredContent"]["subscriptionId"].clone();

    fixture.bump(1);

    // The mount commit may still be in flight to the hub; wait for the update.
    let mut events: Vec<Value> = Vec::new();
    for attempt in 0..100 {
        let reply = call(
            &mut session,
            10 + attempt,
            "nextEvents",
            json!({"subscriptionId": id}),
        )
        .await;
        let result = &reply["result"]["structuredContent"];
        events.extend(result["events"].as_array().cloned().unwrap_or_default());
        if events.iter().any(has_update) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(events.iter().any(has_update), "no update in {events:?}");
    for event in &events {
        assert_eq!(event["channel"], "mutation-stream");
        let changes = event["payload"]["changes"].as_array().unwrap();
        assert!(changes.iter().all(|change| change["name"] == "Counter"));
    }

    let reply = call(&mut session, 200, "unsubscribe", json!({"subscriptionId": id})).await;
    assert_eq!(reply["result"]["structuredContent"]["removed"], true);
    assert_eq!(session.state(), ConnState::Ready);

    let reply = call(&mut session, 201, "unsubscribe", json!({"subscriptionId": id})).await;
    assert_eq!(reply["result"]["structuredContent"]["removed"], false);
}

#[tokio::test]
async fn subscriptions_belong_to_their_connection() {
    let fixture = Fixture::new();
    fixture.commit();
    let mut alice = ready_session(&fixture.hub).await;
    let mut bob = ready_session(&fixture.hub).await;

    let reply = call(&mut alice, 1, "subscribe", json!({"channels": ["control"]})).await;
    let id = reply["result"]["structuredContent"]["subscriptionId"].clone();

    let reply = call(&mut bob, 1, "nextEvents", json!({"subscriptionId": id})).await;
    assert_eq!(reply["error"]["code"], RpcError::INVALID_PARAMS);
    let reply = call(&mut bob, 2, "unsubscribe", json!({"subscriptionId": id})).await;
    assert_eq!(reply["result"]["structuredContent"]["removed"], false);

    let reply = call(&mut bob, 3, "resync", json!({})).await;
    assert_eq!(reply["result"]["structuredContent"]["resynced"], json!([]));

    let owner = alice.owner();
    alice.close();
    assert_eq!(alice.state(), ConnState::Closed);
    assert_eq!(fixture.hub.subscription_count(owner), 0);
}

#[tokio::test]
async fn batches_reply_in_one_array() {
    let fixture = Fixture::new();
    let mut session = ready_session(&fixture.hub).await;
    let batch = json!([
        {"jsonrpc": "2.0", "id": 1, "method": "ping"},
        {"jsonrpc": "2.0", "method": "notifications/initialized"},
        {"jsonrpc": "2.0", "id": 2, "method": "tools/call", "params": {"name": "ping"}},
    ]);
    let reply = session
        .handle_frame(batch.to_string().as_bytes())
        .await
        .unwrap();
    let reply: Value = serde_json::from_str(&reply).unwrap();
    let replies = reply.as_array().unwrap();
    assert_eq!(replies.len(), 2);
    assert_eq!(replies[1]["result"]["structuredContent"], json!({"ok": true}));
}
