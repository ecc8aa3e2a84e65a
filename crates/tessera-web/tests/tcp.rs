use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tessera_runtime::{
    CommitTiming, GovernorConfig, HostValue, Inspector, InspectorConfig, MemoryTree, NodeKey,
    NodeSpec,
};
use tessera_web::client::RpcClient;
use tessera_web::transport::tcp::run_tcp_acceptor;
use tessera_web::{Hub, StreamOptions};
use tessera_wire::{DEFAULT_MAX_FRAME_BYTES, EVENT_NOTIFICATION, RpcError};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

async fn start() -> (Arc<Inspector>, String) {
    let (inspector, commits) = Inspector::new(InspectorConfig::default());
    let hub = Hub::new(
        inspector.clone(),
        GovernorConfig::default(),
        Duration::from_secs(1),
    );
    tokio::spawn(hub.clone().run(commits));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let options = StreamOptions {
        max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        protocol_trace: false,
    };
    tokio::spawn(run_tcp_acceptor(listener, hub, options));
    (inspector, addr)
}

fn counter_tree() -> (MemoryTree, NodeKey) {
    let mut tree = MemoryTree::new();
    let root = tree.set_root(NodeSpec::named("App"));
    let counter = tree.append_child(
        root,
        NodeSpec::named("Counter").attrs(HostValue::record([("count", HostValue::Int(0))])),
    );
    (tree, counter)
}

#[tokio::test]
async fn ndjson_client_receives_pushed_events() {
    let (inspector, addr) = start().await;
    let (mut tree, counter) = counter_tree();
    inspector.ingest_commit(&tree, CommitTiming::now(Duration::ZERO));

    let mut client = RpcClient::connect(&addr).await.unwrap();
    let init = client.initialize().await.unwrap();
    assert_eq!(init["serverInfo"]["name"], "tessera");

    let subscribed = client
        .call_tool(
            "subscribe",
            json!({"channels": ["mutation-stream", "control"], "selector": {"nameMatch": "Counter"}}),
        )
        .await
        .unwrap();
    assert_eq!(subscribed["status"], "ok");
    let id = subscribed["subscriptionId"].clone();

    tree.update(counter, |spec| {
        spec.attributes = HostValue::record([("count", HostValue::Int(1))]);
    });
    inspector.ingest_commit(&tree, CommitTiming::now(Duration::ZERO));

    let update = timeout(WAIT, async {
        loop {
            let note = client.next_notification().await.unwrap();
            assert_eq!(note.method, EVENT_NOTIFICATION);
            let params = note.params.unwrap_or(Value::Null);
            let is_update = params["payload"]["changes"]
                .as_array()
                .is_some_and(|changes| changes.iter().any(|c| c["kind"] == "update"));
            if is_update {
                break params;
            }
        }
    })
    .await
    .expect("update pushed");
    assert_eq!(update["channel"], "mutation-stream");
    assert_eq!(update["subscriptionId"], id);
    assert_eq!(update["payload"]["changes"][0]["name"], "Counter");

    let removed = client
        .call_tool("unsubscribe", json!({"subscriptionId": id}))
        .await
        .unwrap();
    assert_eq!(removed["removed"], true);

    let advisory = timeout(WAIT, async {
        loop {
            let params = client.next_notification().await.unwrap().params.unwrap();
            if params["channel"] == "control" && params["payload"]["type"] == "unsubscribed" {
                break params;
            }
        }
    })
    .await
    .expect("unsubscribe advisory pushed");
    assert_eq!(advisory["subscriptionId"], id);
}

async fn write_framed(stream: &mut TcpStream, body: &Value) {
    let body = body.to_string();
    let frame = format!("Content-Length: {}\r\n\r\n{body}", body.len());
    stream.write_all(frame.as_bytes()).await.unwrap();
}

async fn read_framed(reader: &mut BufReader<TcpStream>) -> Value {
    let mut len = None;
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some(value) = line.strip_prefix("Content-Length:") {
            len = Some(value.trim().parse::<usize>().unwrap());
        }
    }
    let mut body = vec![0u8; len.expect("Content-Length header")];
    reader.read_exact(&mut body).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn content_length_framing_is_echoed() {
    let (_inspector, addr) = start().await;
    let stream = TcpStream::connect(&addr).await.unwrap();
    let mut reader = BufReader::new(stream);

    write_framed(
        reader.get_mut(),
        &json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}),
    )
    .await;
    let reply = timeout(WAIT, read_framed(&mut reader)).await.unwrap();
    assert_eq!(reply["id"], 1);
    assert!(reply["result"]["protocolVersion"].is_string());

    write_framed(
        reader.get_mut(),
        &json!({"jsonrpc": "2.0", "id": 2, "method": "tools/call", "params": {"name": "ping"}}),
    )
    .await;
    let reply = timeout(WAIT, read_framed(&mut reader)).await.unwrap();
    assert_eq!(reply["result"]["structuredContent"], json!({"ok": true}));
}

#[tokio::test]
async fn bad_header_is_answered_then_closed() {
    let (_inspector, addr) = start().await;
    let mut stream = TcpStream::connect(&addr).await.unwrap();
    stream
        .write_all(b"Content-Length: lots\r\n\r\n")
        .await
        .unwrap();

    let mut reader = BufReader::new(stream);
    let reply = timeout(WAIT, read_framed(&mut reader)).await.unwrap();
    assert_eq!(reply["error"]["code"], RpcError::INVALID_REQUEST);

    let mut rest = Vec::new();
    let closed = timeout(WAIT, reader.read_to_end(&mut rest)).await.unwrap();
    assert!(matches!(closed, Ok(0) | Err(_)), "connection still open: {closed:?}");
}
