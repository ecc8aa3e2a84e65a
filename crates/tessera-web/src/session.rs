use std::sync::Arc;

use serde_json::{Value, json};
use tessera_runtime::OwnerId;
use tessera_types::{NextEventsParams, QueryParams, ResyncParams, SubscribeParams, UnsubscribeParams};
use tessera_wire::{Incoming, Request, Response, RpcError, parse_incoming};
use tracing::{debug, info};

use crate::hub::Hub;
use crate::tools::{self, ParamError, Tool};

pub const PROTOCOL_VERSION: &str = "2025-06-18";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Uninitialized,
    Ready,
    Subscribed,
    Closed,
}

/// Protocol state of one connection (or one HTTP session).
pub struct Session {
    hub: Arc<Hub>,
    owner: OwnerId,
    state: ConnState,
}

impl Session {
    pub fn new(hub: Arc<Hub>) -> Self {
        let owner = hub.register_owner();
        Self {
            hub,
            owner,
            state: ConnState::Uninitialized,
        }
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Moves to `closed` and drops every subscription of this connection.
    pub fn close(&mut self) {
        if self.state == ConnState::Closed {
            return;
        }
        self.state = ConnState::Closed;
        self.hub.release(self.owner);
        info!(owner = self.owner.0, "session closed");
    }

    /// Handles one decoded frame. Returns the serialized reply, or `None`
    /// when the frame held only notifications.
    pub async fn handle_frame(&mut self, frame: &[u8]) -> Option<String> {
        let reply = match parse_incoming(frame) {
            Incoming::Single(message) => self
                .handle_parsed(message)
                .await
                .and_then(|r| serde_json::to_value(r).ok()),
            Incoming::Batch(messages) => {
                let mut replies = Vec::new();
                for message in messages {
                    if let Some(response) = self.handle_parsed(message).await {
                        replies.extend(serde_json::to_value(response).ok());
                    }
                }
                (!replies.is_empty()).then_some(Value::Array(replies))
            }
        }?;
        Some(reply.to_string())
    }

    async fn handle_parsed(
        &mut self,
        message: Result<Request, tessera_wire::Rejected>,
    ) -> Option<Response> {
        match message {
            Ok(request) => self.handle_request(request).await,
            Err(rejected) => Some(rejected.into_response()),
        }
    }

    pub async fn handle_request(&mut self, request: Request) -> Option<Response> {
        let Request { id, method, params, .. } = request;
        let notification = id.is_none();
        let outcome = self.dispatch(&method, params).await;
        if notification {
            if let Err(e) = outcome {
                debug!(%method, %e, "notification failed");
            }
            return None;
        }
        Some(match outcome {
            Ok(result) => Response::success(id, result),
            Err(e) => Response::failure(id, &e),
        })
    }

    async fn dispatch(&mut self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        if self.state == ConnState::Closed {
            return Err(RpcError::InvalidRequest("connection is closed".into()));
        }
        match method {
            "initialize" => {
                if self.state == ConnState::Uninitialized {
                    self.state = ConnState::Ready;
                }
                Ok(json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {"tools": {"listChanged": false}},
                    "serverInfo": {
                        "name": "tessera",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                    "instructions": "Subscribe to channels with `subscribe`; events arrive as notifications/event or via nextEvents.",
                }))
            }
            "notifications/initialized" => Ok(Value::Null),
            "ping" => Ok(json!({})),
            _ if self.state == ConnState::Uninitialized => Err(RpcError::NotInitialized),
            "tools/list" => Ok(tools::list()),
            "tools/call" => {
                let params = params.unwrap_or(Value::Null);
                let name = params
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or(ParamError::MissingName)?;
                let tool = Tool::parse(name)?;
                let arguments = params.get("arguments").cloned();
                let structured = self.call_tool(tool, arguments).await?;
                Ok(tools::call_result(structured))
            }
            other => Err(RpcError::MethodNotFound(other.to_string())),
        }
    }

    async fn call_tool(&mut self, tool: Tool, arguments: Option<Value>) -> Result<Value, RpcError> {
        let hub = self.hub.clone();
        let owner = self.owner;
        let value = match tool {
            Tool::Subscribe => {
                let params: SubscribeParams = tool.args(arguments)?;
                to_value(hub.subscribe(owner, params).await?)
            }
            Tool::Unsubscribe => {
                let params: UnsubscribeParams = tool.args(arguments)?;
                to_value(hub.unsubscribe(owner, params)?)
            }
            Tool::NextEvents => {
                let params: NextEventsParams = tool.args(arguments)?;
                to_value(hub.next_events(owner, params)?)
            }
            Tool::GetProps | Tool::GetHooksState | Tool::GetContext => {
                let params: QueryParams = tool.args(arguments)?;
                let query_type = tool
                    .query_type()
                    .ok_or_else(|| RpcError::Internal("query tool without query type".into()))?;
                to_value(hub.query(query_type, params).await?)
            }
            Tool::Resync => {
                let params: ResyncParams = tool.args(arguments)?;
                to_value(hub.resync(owner, params)?)
            }
            Tool::Ping => Ok(json!({ "ok": true })),
        }?;

        self.state = if hub.subscription_count(owner) > 0 {
            ConnState::Subscribed
        } else {
            ConnState::Ready
        };
        Ok(value)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError::Internal(format!("encode result: {e}")))
}
