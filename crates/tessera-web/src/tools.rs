use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tessera_types::QueryType;
use tessera_wire::RpcError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParamError {
    #[error("unknown tool `{0}`")]
    UnknownTool(String),
    #[error("`{tool}` arguments: {reason}")]
    Invalid { tool: &'static str, reason: String },
    #[error("tools/call needs a string `name`")]
    MissingName,
}

impl From<ParamError> for RpcError {
    fn from(e: ParamError) -> Self {
        RpcError::InvalidParams(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    Subscribe,
    Unsubscribe,
    NextEvents,
    GetProps,
    GetHooksState,
    GetContext,
    Resync,
    Ping,
}

impl Tool {
    pub const ALL: [Tool; 8] = [
        Tool::Subscribe,
        Tool::Unsubscribe,
        Tool::NextEvents,
        Tool::GetProps,
        Tool::GetHooksState,
        Tool::GetContext,
        Tool::Resync,
        Tool::Ping,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Tool::Subscribe => "subscribe",
            Tool::Unsubscribe => "unsubscribe",
            Tool::NextEvents => "nextEvents",
            Tool::GetProps => "getProps",
            Tool::GetHooksState => "getHooksState",
            Tool::GetContext => "getContext",
            Tool::Resync => "resync",
            Tool::Ping => "ping",
        }
    }

    pub fn parse(name: &str) -> Result<Tool, ParamError> {
        Tool::ALL
            .into_iter()
            .find(|tool| tool.name() == name)
            .ok_or_else(|| ParamError::UnknownTool(name.to_string()))
    }

    pub fn query_type(self) -> Option<QueryType> {
        match self {
            Tool::GetProps => Some(QueryType::Props),
            Tool::GetHooksState => Some(QueryType::HooksState),
            Tool::GetContext => Some(QueryType::Context),
            _ => None,
        }
    }

    /// Decodes this tool's arguments. A missing object counts as `{}`.
    pub fn args<T: DeserializeOwned>(self, arguments: Option<Value>) -> Result<T, ParamError> {
        let arguments = match arguments {
            None | Some(Value::Null) => json!({}),
            Some(value) => value,
        };
        serde_json::from_value(arguments).map_err(|e| ParamError::Invalid {
            tool: self.name(),
            reason: e.to_string(),
        })
    }

    fn description(self) -> &'static str {
        match self {
            Tool::Subscribe => {
                "Subscribe to live channels for nodes matching a selector. Waits up to timeoutMs for the first commit and returns the current matches."
            }
            Tool::Unsubscribe => {
                "Stop a subscription. Already queued events stay drainable via nextEvents."
            }
            Tool::NextEvents => "Drain up to `max` queued events of a subscription.",
            Tool::GetProps => "Read a node's attributes from history (latest or a given commitId).",
            Tool::GetHooksState => "Read a node's derived state from history.",
            Tool::GetContext => "Read a node's ambient context from history.",
            Tool::Resync => {
                "Rebuild the matching node set of one (or every) subscription and push it on the snapshot channel."
            }
            Tool::Ping => "Liveness check.",
        }
    }

    fn input_schema(self) -> Value {
        let subscription_id = json!({"type": "string", "description": "sub-<n>"});
        match self {
            Tool::Subscribe => json!({
                "type": "object",
                "required": ["channels"],
                "properties": {
                    "channels": {
                        "type": "array",
                        "items": {"enum": ["mutation-stream", "derived-findings", "metrics", "control", "snapshot"]},
                    },
                    "selector": {
                        "type": "object",
                        "additionalProperties": false,
                        "properties": {
                            "nameMatch": {"type": "string", "description": "substring, or /regex/flags"},
                            "fileMatch": {"type": "string", "description": "substring, or /regex/flags"},
                            "pathContains": {"type": "string"},
                            "keyEquals": {"type": "string"},
                            "costGte": {"type": "number"},
                            "attrsMatch": {"type": "object"},
                        },
                    },
                    "fields": {"type": "array", "items": {"type": "string"}},
                    "budgets": {"type": "object"},
                    "timeoutMs": {"type": "integer", "minimum": 50, "maximum": 1500},
                },
            }),
            Tool::Unsubscribe => json!({
                "type": "object",
                "required": ["subscriptionId"],
                "properties": {"subscriptionId": subscription_id},
            }),
            Tool::NextEvents => json!({
                "type": "object",
                "required": ["subscriptionId"],
                "properties": {
                    "subscriptionId": subscription_id,
                    "max": {"type": "integer", "minimum": 1, "maximum": 500},
                },
            }),
            Tool::GetProps | Tool::GetHooksState | Tool::GetContext => json!({
                "type": "object",
                "required": ["fid"],
                "properties": {
                    "fid": {"type": "string", "description": "fid-<slot>-<generation>"},
                    "commitId": {"type": "integer"},
                    "paths": {"type": "array", "items": {"type": "string"}},
                },
            }),
            Tool::Resync => json!({
                "type": "object",
                "properties": {"subscriptionId": subscription_id},
            }),
            Tool::Ping => json!({"type": "object", "properties": {}}),
        }
    }
}

/// `tools/list` result.
pub fn list() -> Value {
    let tools: Vec<Value> = Tool::ALL
        .into_iter()
        .map(|tool| {
            json!({
                "name": tool.name(),
                "description": tool.description(),
                "inputSchema": tool.input_schema(),
            })
        })
        .collect();
    json!({ "tools": tools })
}

/// Wraps a tool's structured output the way `tools/call` returns it.
pub fn call_result(structured: Value) -> Value {
    let text = serde_json::to_string_pretty(&structured).unwrap_or_else(|_| structured.to_string());
    json!({
        "content": [{"type": "text", "text": text}],
        "structuredContent": structured,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_types::{QueryParams, UnsubscribeParams};

    #[test]
    fn names_round_trip_and_unknown_is_rejected() {
        for tool in Tool::ALL {
            assert_eq!(Tool::parse(tool.name()), Ok(tool));
        }
        assert_eq!(
            Tool::parse("getState"),
            Err(ParamError::UnknownTool("getState".into()))
        );
    }

    #[test]
    fn argument_errors_name_the_tool() {
        let err = Tool::Unsubscribe
            .args::<UnsubscribeParams>(Some(json!({"subscriptionId": "fid-1-0"})))
            .unwrap_err();
        assert!(err.to_string().starts_with("`unsubscribe` arguments:"), "{err}");

        let params: QueryParams = Tool::GetProps
            .args(Some(json!({"fid": "fid-1-0"})))
            .unwrap();
        assert!(params.paths.is_empty());
    }

    #[test]
    fn listing_covers_every_tool() {
        let listed = list();
        let names: Vec<_> = listed["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names.len(), Tool::ALL.len());
        assert!(names.contains(&"getContext".to_string()));
    }
}
