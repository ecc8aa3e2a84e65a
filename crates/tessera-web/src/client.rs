//! Raw-socket client used by `tessera watch` and `tessera call`.

use std::collections::VecDeque;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use serde_json::{Value, json};
use tessera_wire::{EVENT_NOTIFICATION, ErrorObject, Notification, Request, RequestId, Response};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{info, warn};

use crate::session::PROTOCOL_VERSION;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connect {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("server closed the connection")]
    Closed,
    #[error("undecodable message from server: {0}")]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    Rpc(#[from] ErrorObject),
}

/// NDJSON JSON-RPC connection. Notifications that arrive while waiting for a
/// response are kept for [`RpcClient::next_notification`].
pub struct RpcClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    next_id: i64,
    pending: VecDeque<Notification>,
}

impl RpcClient {
    pub async fn connect(addr: &str) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| ClientError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(reader).lines(),
            writer,
            next_id: 0,
            pending: VecDeque::new(),
        })
    }

    async fn send(&mut self, request: &Request) -> Result<(), ClientError> {
        let mut line = serde_json::to_vec(request)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Reads one message, stashing notifications.
    async fn read_message(&mut self) -> Result<Option<Response>, ClientError> {
        loop {
            let Some(line) = self.lines.next_line().await? else {
                return Err(ClientError::Closed);
            };
            if line.trim().is_empty() {
                continue;
            }
            let value: Value = serde_json::from_str(&line)?;
            if value.get("method").is_some() {
                self.pending.push_back(serde_json::from_value(value)?);
                return Ok(None);
            }
            return Ok(Some(serde_json::from_value(value)?));
        }
    }

    pub async fn request(&mut self, method: &str, params: Value) -> Result<Value, ClientError> {
        self.next_id += 1;
        let id = RequestId::Number(self.next_id);
        self.send(&Request::new(Some(id.clone()), method, Some(params)))
            .await?;
        loop {
            if let Some(response) = self.read_message().await?
                && response.id.as_ref() == Some(&id)
            {
                return Ok(response.into_result()?);
            }
        }
    }

    pub async fn notify(&mut self, method: &str, params: Option<Value>) -> Result<(), ClientError> {
        self.send(&Request::new(None, method, params)).await
    }

    pub async fn initialize(&mut self) -> Result<Value, ClientError> {
        let result = self
            .request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {"name": "tessera-cli", "version": env!("CARGO_PKG_VERSION")},
                }),
            )
            .await?;
        self.notify("notifications/initialized", None).await?;
        Ok(result)
    }

    /// Calls a tool and returns its structured result.
    pub async fn call_tool(&mut self, name: &str, arguments: Value) -> Result<Value, ClientError> {
        let result = self
            .request("tools/call", json!({"name": name, "arguments": arguments}))
            .await?;
        Ok(match result {
            Value::Object(mut map) => map
                .remove("structuredContent")
                .unwrap_or(Value::Object(map)),
            other => other,
        })
    }

    pub async fn next_notification(&mut self) -> Result<Notification, ClientError> {
        loop {
            if let Some(notification) = self.pending.pop_front() {
                return Ok(notification);
            }
            // Stray responses are ignored.
            self.read_message().await?;
        }
    }
}

/// Connects once, calls `tool`, and returns its structured result.
pub async fn call(addr: &str, tool: &str, arguments: Value) -> Result<Value, ClientError> {
    let mut client = RpcClient::connect(addr).await?;
    client.initialize().await?;
    client.call_tool(tool, arguments).await
}

/// Reconnect schedule for [`watch`]: 1s doubling to 30s, jittered, forever.
pub fn reconnect_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_secs(1))
        .with_max_delay(Duration::from_secs(30))
        .with_jitter()
        .without_max_times()
}

/// Subscribes and streams event envelopes to `on_event` forever. Lost
/// connections are retried with backoff, and the subscription is made again
/// after every reconnect. Only a rejected `subscribe` ends the watch.
pub async fn watch(addr: &str, subscribe: Value, on_event: impl FnMut(Value)) -> Result<(), ClientError> {
    watch_with(addr, subscribe, reconnect_backoff(), on_event).await
}

/// [`watch`] with an explicit reconnect schedule. The schedule restarts from
/// its first delay after every successful subscribe.
pub async fn watch_with(
    addr: &str,
    subscribe: Value,
    backoff: ExponentialBuilder,
    mut on_event: impl FnMut(Value),
) -> Result<(), ClientError> {
    let subscribe = &subscribe;
    loop {
        let mut client = (move || connect_and_subscribe(addr, subscribe))
            .retry(backoff)
            .when(|error: &ClientError| !matches!(error, ClientError::Rpc(_)))
            .notify(|error: &ClientError, delay: Duration| {
                warn!(
                    %addr,
                    %error,
                    delay_ms = delay.as_millis() as u64,
                    "watch connection failed, retrying"
                );
            })
            .await?;
        let error = stream_events(&mut client, &mut on_event).await;
        warn!(%addr, %error, "watch connection lost, reconnecting");
    }
}

async fn connect_and_subscribe(addr: &str, subscribe: &Value) -> Result<RpcClient, ClientError> {
    let mut client = RpcClient::connect(addr).await?;
    client.initialize().await?;
    let result = client.call_tool("subscribe", subscribe.clone()).await?;
    info!(
        %addr,
        subscription = %result["subscriptionId"],
        targets = result["targets"].as_array().map_or(0, Vec::len),
        "subscribed"
    );
    Ok(client)
}

/// Forwards event notifications until the connection fails.
async fn stream_events(client: &mut RpcClient, on_event: &mut impl FnMut(Value)) -> ClientError {
    loop {
        match client.next_notification().await {
            Ok(notification) => {
                if notification.method == EVENT_NOTIFICATION
                    && let Some(params) = notification.params
                {
                    on_event(params);
                }
            }
            Err(error) => return error,
        }
    }
}

/// `subscribe` arguments for `tessera watch`. Without explicit channels it
/// follows everything except metrics.
pub fn watch_subscription(name_match: Option<String>, channels: Option<Vec<String>>) -> Value {
    let channels = channels.unwrap_or_else(|| {
        ["mutation-stream", "derived-findings", "control", "snapshot"]
            .map(str::to_string)
            .to_vec()
    });
    let mut params = json!({
        "channels": channels,
        "timeoutMs": 1500,
    });
    if let Some(name_match) = name_match {
        params["selector"] = json!({ "nameMatch": name_match });
    }
    params
}
