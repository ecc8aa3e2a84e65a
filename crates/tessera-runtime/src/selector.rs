use regex_lite::Regex;
use serde_json::Value;
use tessera_types::SelectorSpec;

use crate::detect::NodeSnapshot;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectorError {
    #[error("invalid pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("unsupported regex flag `{0}` (expected some of i, m, s, g, u)")]
    UnknownFlag(char),
}

/// A literal substring, or a regex when written as `/pattern/flags`.
#[derive(Debug, Clone)]
pub enum TextMatch {
    Substring(String),
    Pattern(Regex),
}

impl TextMatch {
    pub fn parse(raw: &str) -> Result<Self, SelectorError> {
        let Some(body) = raw.strip_prefix('/') else {
            return Ok(TextMatch::Substring(raw.to_string()));
        };
        let Some(close) = body.rfind('/') else {
            return Ok(TextMatch::Substring(raw.to_string()));
        };
        let (pattern, flags) = (&body[..close], &body[close + 1..]);

        let mut inline = String::new();
        for flag in flags.chars() {
            match flag {
                'i' | 'm' | 's' => inline.push(flag),
                // Global and unicode matching have no effect on a yes/no test.
                'g' | 'u' => {}
                other => return Err(SelectorError::UnknownFlag(other)),
            }
        }
        let source = if inline.is_empty() {
            pattern.to_string()
        } else {
            format!("(?{inline}){pattern}")
        };
        Regex::new(&source)
            .map(TextMatch::Pattern)
            .map_err(|e| SelectorError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })
    }

    pub fn is_match(&self, haystack: &str) -> bool {
        match self {
            TextMatch::Substring(needle) => haystack.contains(needle.as_str()),
            TextMatch::Pattern(regex) => regex.is_match(haystack),
        }
    }
}

/// A compiled [`SelectorSpec`]. All present criteria must hold.
#[derive(Debug, Clone)]
pub struct Selector {
    name: Option<TextMatch>,
    file: Option<TextMatch>,
    path_contains: Option<String>,
    key_equals: Option<String>,
    cost_gte: Option<f64>,
    attrs_match: Vec<(String, Value)>,
}

impl Selector {
    pub fn compile(spec: &SelectorSpec) -> Result<Self, SelectorError> {
        Ok(Self {
            name: spec.name_match.as_deref().map(TextMatch::parse).transpose()?,
            file: spec.file_match.as_deref().map(TextMatch::parse).transpose()?,
            path_contains: spec.path_contains.clone(),
            key_equals: spec.key_equals.clone(),
            cost_gte: spec.cost_gte,
            attrs_match: spec
                .attrs_match
                .iter()
                .flatten()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        })
    }

    pub fn matches(&self, node: &NodeSnapshot) -> bool {
        if !node.has_meaningful_name() {
            return false;
        }
        if let Some(name) = &self.name
            && !name.is_match(node.display_name())
        {
            return false;
        }
        if let Some(file) = &self.file
            && !node.source.as_ref().is_some_and(|s| file.is_match(&s.file))
        {
            return false;
        }
        if let Some(fragment) = &self.path_contains
            && !node.path.contains(fragment.as_str())
        {
            return false;
        }
        if let Some(key) = &self.key_equals
            && node.key.as_deref() != Some(key.as_str())
        {
            return false;
        }
        if let Some(min) = self.cost_gte
            && !node.cost.is_some_and(|cost| cost >= min)
        {
            return false;
        }
        self.attrs_match
            .iter()
            .all(|(key, expected)| node.attrs.get(key).is_some_and(|f| f.preview == *expected))
    }
}

/// Matching with an optional selector; unnamed nodes never match.
pub fn selects(selector: Option<&Selector>, node: &NodeSnapshot) -> bool {
    match selector {
        Some(selector) => selector.matches(node),
        None => node.has_meaningful_name(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preview::{Bag, HostValue, PreviewLimits};
    use serde_json::json;
    use tessera_types::{Fid, SourcePos};

    fn node(name: Option<&str>) -> NodeSnapshot {
        NodeSnapshot {
            fid: Fid::new(1, 0),
            name: name.map(str::to_string),
            key: Some("row-1".into()),
            parent: None,
            owner: None,
            path: "App/List/Row".into(),
            source: Some(SourcePos {
                file: "src/components/Row.tsx".into(),
                line: 12,
                column: None,
            }),
            cost: Some(4.5),
            attrs: Bag::capture(
                &HostValue::record([("selected", HostValue::Bool(true))]),
                &PreviewLimits::default(),
            ),
            state: Bag::Absent,
            context: Bag::Absent,
            captured_at: 1,
        }
    }

    fn compile(spec: serde_json::Value) -> Selector {
        Selector::compile(&serde_json::from_value(spec).unwrap()).unwrap()
    }

    #[test]
    fn literal_and_regex_names() {
        let row = node(Some("Row"));
        assert!(compile(json!({"nameMatch": "Ro"})).matches(&row));
        assert!(compile(json!({"nameMatch": "/^row$/i"})).matches(&row));
        assert!(!compile(json!({"nameMatch": "/^row$/"})).matches(&row));
    }

    #[test]
    fn every_criterion_must_hold() {
        let row = node(Some("Row"));
        let spec = json!({
            "fileMatch": "/Row\\.tsx$/",
            "pathContains": "List/",
            "keyEquals": "row-1",
            "costGte": 4.0,
            "attrsMatch": {"selected": true},
        });
        assert!(compile(spec).matches(&row));
        assert!(!compile(json!({"costGte": 5.0})).matches(&row));
        assert!(!compile(json!({"attrsMatch": {"selected": false}})).matches(&row));
        assert!(!compile(json!({"keyEquals": "row-2"})).matches(&row));
    }

    #[test]
    fn anonymous_nodes_never_match() {
        assert!(!selects(None, &node(None)));
        assert!(!selects(None, &node(Some("Anonymous"))));
        assert!(!compile(json!({})).matches(&node(Some(""))));
        assert!(selects(None, &node(Some("Row"))));
    }

    #[test]
    fn bad_patterns_are_reported() {
        assert!(matches!(
            TextMatch::parse("/(/"),
            Err(SelectorError::InvalidPattern { .. })
        ));
        assert_eq!(
            TextMatch::parse("/x/q").unwrap_err(),
            SelectorError::UnknownFlag('q')
        );
    }
}
