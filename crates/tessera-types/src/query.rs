use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Which bag of a node an on-demand query reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueryType {
    Props,
    HooksState,
    Context,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueryKind {
    /// Answered from the requested commit (or the latest one if none was asked for).
    Exact,
    /// The requested commit is gone; answered from the latest commit that has the node.
    Latest,
    /// Nothing in the retained history can answer.
    NotReady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NotReadyReason {
    CommitEvicted,
    NoSource,
}

impl NotReadyReason {
    fn hint(self) -> &'static str {
        match self {
            NotReadyReason::CommitEvicted => {
                "the requested commit left the history window; retry without commitId"
            }
            NotReadyReason::NoSource => {
                "no retained commit contains this fid; it may not have mounted yet"
            }
        }
    }
}

/// `getProps` / `getHooksState` / `getContext` parameters.
///
/// `fid` stays a raw string: a malformed value is answered with `notReady`,
/// while a subscription id is rejected outright.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryParams {
    pub fid: String,
    #[serde(default)]
    pub commit_id: Option<u64>,
    #[serde(default)]
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    #[serde(rename = "type")]
    pub query_type: QueryType,
    pub kind: QueryKind,
    pub fid: String,
    pub commit_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_commit_id: Option<u64>,
    pub data: Value,
}

impl QueryResult {
    pub fn not_ready(
        query_type: QueryType,
        fid: impl Into<String>,
        requested_commit_id: Option<u64>,
        reason: NotReadyReason,
    ) -> Self {
        Self {
            query_type,
            kind: QueryKind::NotReady,
            fid: fid.into(),
            commit_id: None,
            requested_commit_id,
            data: json!({ "reason": reason, "hint": reason.hint() }),
        }
    }

    pub fn not_ready_reason(&self) -> Option<NotReadyReason> {
        if self.kind != QueryKind::NotReady {
            return None;
        }
        self.data
            .get("reason")
            .cloned()
            .and_then(|reason| serde_json::from_value(reason).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_ready_shape() {
        let result = QueryResult::not_ready(
            QueryType::HooksState,
            "missing",
            None,
            NotReadyReason::NoSource,
        );
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["type"], "hooksState");
        assert_eq!(value["kind"], "notReady");
        assert_eq!(value["data"]["reason"], "noSource");
        assert_eq!(result.not_ready_reason(), Some(NotReadyReason::NoSource));
    }
}
