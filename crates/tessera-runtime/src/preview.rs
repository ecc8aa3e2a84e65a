//! Bounded, cycle-safe summaries of host values.
//!
//! The host hands us [`HostValue`]s; we never hold on to its storage beyond
//! the `Arc`s it gives us, and we never let one bad field poison a whole
//! preview.

use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde_json::{Map, Number, Value};
use tessera_types::FieldDiff;

pub const ELLIPSIS: &str = "…";
pub const DEPTH_MARKER: &str = "[…]";
pub const CIRCULAR_MARKER: &str = "[Circular]";
pub const UNAVAILABLE_MARKER: &str = "[Unavailable]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreviewLimits {
    pub max_depth: usize,
    pub max_items: usize,
    pub max_string_len: usize,
    pub max_keys: usize,
}

impl Default for PreviewLimits {
    fn default() -> Self {
        Self {
            max_depth: 3,
            max_items: 3,
            max_string_len: 200,
            max_keys: 10,
        }
    }
}

// ── Host values ─────────────────────────────────────────────────

/// A value as exposed by the host tree.
///
/// Containers are shared and interior-mutable, so they can form cycles just
/// like the host's own object graph.
#[derive(Debug, Clone, Default)]
pub enum HostValue {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    /// A callable; the payload carries its name, if any.
    Function(Arc<HostRef>),
    /// An opaque host object such as a DOM element; the payload is its type tag.
    Handle(Arc<HostRef>),
    /// An object whose contents must not be enumerated (proxies and the like).
    Exotic(Arc<HostRef>),
    List(Arc<HostList>),
    Record(Arc<HostRecord>),
}

impl HostValue {
    pub fn str(value: impl Into<Arc<str>>) -> Self {
        HostValue::Str(value.into())
    }

    pub fn function(name: impl Into<Arc<str>>) -> Self {
        HostValue::Function(Arc::new(HostRef::new(name)))
    }

    pub fn handle(tag: impl Into<Arc<str>>) -> Self {
        HostValue::Handle(Arc::new(HostRef::new(tag)))
    }

    pub fn exotic(tag: impl Into<Arc<str>>) -> Self {
        HostValue::Exotic(Arc::new(HostRef::new(tag)))
    }

    pub fn list(items: impl IntoIterator<Item = HostValue>) -> Self {
        HostValue::List(Arc::new(HostList::new(items)))
    }

    pub fn record<K: Into<String>>(fields: impl IntoIterator<Item = (K, HostValue)>) -> Self {
        HostValue::Record(Arc::new(HostRecord::new(fields)))
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, HostValue::Undefined)
    }

    /// Primitives hash by content; everything else by [`ObjectId`], the way
    /// the host compares references.
    pub fn identity_token(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        match self {
            HostValue::Undefined => 0u8.hash(&mut hasher),
            HostValue::Null => 1u8.hash(&mut hasher),
            HostValue::Bool(b) => (2u8, b).hash(&mut hasher),
            HostValue::Int(i) => (3u8, i).hash(&mut hasher),
            HostValue::Float(f) => (4u8, f.to_bits()).hash(&mut hasher),
            HostValue::Str(s) => (5u8, s).hash(&mut hasher),
            HostValue::Function(f) => (6u8, f.id).hash(&mut hasher),
            HostValue::Handle(h) => (7u8, h.id).hash(&mut hasher),
            HostValue::Exotic(e) => (8u8, e.id).hash(&mut hasher),
            HostValue::List(l) => (9u8, l.id).hash(&mut hasher),
            HostValue::Record(r) => (10u8, r.id).hash(&mut hasher),
        }
        hasher.finish()
    }
}

impl From<bool> for HostValue {
    fn from(value: bool) -> Self {
        HostValue::Bool(value)
    }
}

impl From<i64> for HostValue {
    fn from(value: i64) -> Self {
        HostValue::Int(value)
    }
}

impl From<f64> for HostValue {
    fn from(value: f64) -> Self {
        HostValue::Float(value)
    }
}

impl From<&str> for HostValue {
    fn from(value: &str) -> Self {
        HostValue::Str(value.into())
    }
}

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one host object. Unlike the address of its allocation, an id
/// is never handed out twice, so a freed object cannot alias its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

impl ObjectId {
    fn next() -> Self {
        ObjectId(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// An object we never look inside: a function, a native handle, an exotic.
#[derive(Debug)]
pub struct HostRef {
    id: ObjectId,
    tag: Arc<str>,
}

impl HostRef {
    pub fn new(tag: impl Into<Arc<str>>) -> Self {
        Self {
            id: ObjectId::next(),
            tag: tag.into(),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }
}

/// A record field: either a value or a getter that faulted.
#[derive(Debug, Clone)]
pub enum HostField {
    Value(HostValue),
    Throws(String),
}

pub struct HostRecord {
    id: ObjectId,
    fields: RwLock<Vec<(String, HostField)>>,
}

impl Default for HostRecord {
    fn default() -> Self {
        Self::new(std::iter::empty::<(String, HostValue)>())
    }
}

impl HostRecord {
    pub fn new<K: Into<String>>(fields: impl IntoIterator<Item = (K, HostValue)>) -> Self {
        Self {
            id: ObjectId::next(),
            fields: RwLock::new(
                fields
                    .into_iter()
                    .map(|(k, v)| (k.into(), HostField::Value(v)))
                    .collect(),
            ),
        }
    }

    /// Inserts or replaces `key`, keeping insertion order for new keys.
    pub fn insert(&self, key: impl Into<String>, field: HostField) {
        let key = key.into();
        let mut fields = self.fields.write();
        match fields.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = field,
            None => fields.push((key, field)),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn set(&self, key: impl Into<String>, value: HostValue) {
        self.insert(key, HostField::Value(value));
    }

    pub fn remove(&self, key: &str) {
        self.fields.write().retain(|(k, _)| k != key);
    }

    pub fn get(&self, key: &str) -> Option<HostField> {
        self.fields
            .read()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, f)| f.clone())
    }
}

impl fmt::Debug for HostRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.fields.try_read() {
            Some(fields) => f
                .debug_struct("HostRecord")
                .field("keys", &fields.iter().map(|(k, _)| k).collect::<Vec<_>>())
                .finish(),
            None => f.write_str("HostRecord(<locked>)"),
        }
    }
}

pub struct HostList {
    id: ObjectId,
    items: RwLock<Vec<HostValue>>,
}

impl Default for HostList {
    fn default() -> Self {
        Self::new([])
    }
}

impl HostList {
    pub fn new(items: impl IntoIterator<Item = HostValue>) -> Self {
        Self {
            id: ObjectId::next(),
            items: RwLock::new(items.into_iter().collect()),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn push(&self, item: HostValue) {
        self.items.write().push(item);
    }
}

impl fmt::Debug for HostList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.items.try_read() {
            Some(items) => write!(f, "HostList(len={})", items.len()),
            None => f.write_str("HostList(<locked>)"),
        }
    }
}

// ── Preview ─────────────────────────────────────────────────────

enum Shape<'a> {
    Primitive(Value),
    Record(&'a Arc<HostRecord>),
    Sequence(&'a Arc<HostList>),
    Opaque(&'a str),
}

fn shape<'a>(value: &'a HostValue, limits: &PreviewLimits) -> Shape<'a> {
    match value {
        HostValue::Undefined | HostValue::Null => Shape::Primitive(Value::Null),
        HostValue::Bool(b) => Shape::Primitive(Value::Bool(*b)),
        HostValue::Int(i) => Shape::Primitive(Value::Number((*i).into())),
        HostValue::Float(f) => Shape::Primitive(float_preview(*f)),
        HostValue::Str(s) => Shape::Primitive(Value::String(truncate(s, limits.max_string_len))),
        HostValue::Function(_) => Shape::Opaque("Function"),
        HostValue::Handle(object) | HostValue::Exotic(object) => Shape::Opaque(object.tag()),
        HostValue::List(list) => Shape::Sequence(list),
        HostValue::Record(record) => Shape::Record(record),
    }
}

fn float_preview(f: f64) -> Value {
    match Number::from_f64(f) {
        Some(n) => Value::Number(n),
        None if f.is_nan() => Value::String("NaN".into()),
        None if f > 0.0 => Value::String("Infinity".into()),
        None => Value::String("-Infinity".into()),
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}{ELLIPSIS}", &s[..cut]),
        None => s.to_string(),
    }
}

pub fn thrown_marker(reason: &str) -> String {
    format!("[Thrown: {reason}]")
}

/// Renders `value` as a bounded JSON summary.
pub fn preview(value: &HostValue, limits: &PreviewLimits) -> Value {
    Previewer::new(limits).value(value, 0)
}

struct Previewer<'a> {
    limits: &'a PreviewLimits,
    /// Containers on the path from the root to the value being rendered.
    ancestors: Vec<ObjectId>,
}

impl<'a> Previewer<'a> {
    fn new(limits: &'a PreviewLimits) -> Self {
        Self {
            limits,
            ancestors: Vec::new(),
        }
    }

    fn value(&mut self, value: &HostValue, depth: usize) -> Value {
        match shape(value, self.limits) {
            Shape::Primitive(v) => v,
            Shape::Opaque(tag) => Value::String(format!("[{tag}]")),
            Shape::Record(record) => {
                self.nested(record.id(), depth, |this| this.record(record, depth))
            }
            Shape::Sequence(list) => {
                self.nested(list.id(), depth, |this| this.sequence(list, depth))
            }
        }
    }

    fn nested(
        &mut self,
        id: ObjectId,
        depth: usize,
        render: impl FnOnce(&mut Self) -> Value,
    ) -> Value {
        if self.ancestors.contains(&id) {
            return Value::String(CIRCULAR_MARKER.into());
        }
        if depth >= self.limits.max_depth {
            return Value::String(DEPTH_MARKER.into());
        }
        self.ancestors.push(id);
        let rendered = render(self);
        self.ancestors.pop();
        rendered
    }

    fn field(&mut self, field: &HostField, depth: usize) -> Value {
        match field {
            HostField::Value(value) => self.value(value, depth),
            HostField::Throws(reason) => Value::String(thrown_marker(reason)),
        }
    }

    fn record(&mut self, record: &HostRecord, depth: usize) -> Value {
        let Some(fields) = record.fields.try_read() else {
            return Value::String(UNAVAILABLE_MARKER.into());
        };
        let mut out = Map::new();
        for (key, field) in fields.iter().take(self.limits.max_keys) {
            let rendered = self.field(field, depth + 1);
            out.insert(key.clone(), rendered);
        }
        if fields.len() > self.limits.max_keys {
            out.insert(
                ELLIPSIS.into(),
                Value::String(format!("{} more keys", fields.len() - self.limits.max_keys)),
            );
        }
        Value::Object(out)
    }

    fn sequence(&mut self, list: &HostList, depth: usize) -> Value {
        let Some(items) = list.items.try_read() else {
            return Value::String(UNAVAILABLE_MARKER.into());
        };
        let mut out: Vec<Value> = items
            .iter()
            .take(self.limits.max_items)
            .map(|item| self.value(item, depth + 1))
            .collect();
        if items.len() > self.limits.max_items {
            out.push(Value::String(format!(
                "{ELLIPSIS} {} more",
                items.len() - self.limits.max_items
            )));
        }
        Value::Array(out)
    }
}

// ── Bags ────────────────────────────────────────────────────────

/// Preview plus identity token of one field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSnap {
    pub preview: Value,
    pub token: u64,
}

/// Captured state of one attribute, derived-state, or context bag.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Bag {
    /// The host reported nothing for this bag.
    #[default]
    Absent,
    /// A plain record, captured key by key.
    Fields(BTreeMap<String, FieldSnap>),
    /// Anything else, captured as a whole.
    Scalar(FieldSnap),
}

impl Bag {
    pub fn capture(value: &HostValue, limits: &PreviewLimits) -> Bag {
        let HostValue::Record(record) = value else {
            if value.is_undefined() {
                return Bag::Absent;
            }
            return Bag::Scalar(FieldSnap {
                preview: preview(value, limits),
                token: value.identity_token(),
            });
        };
        let Some(fields) = record.fields.try_read() else {
            return Bag::Scalar(FieldSnap {
                preview: Value::String(UNAVAILABLE_MARKER.into()),
                token: value.identity_token(),
            });
        };

        let mut previewer = Previewer::new(limits);
        previewer.ancestors.push(record.id());
        let mut out = BTreeMap::new();
        for (key, field) in fields.iter() {
            let snap = match field {
                HostField::Value(v) => FieldSnap {
                    preview: previewer.value(v, 1),
                    token: v.identity_token(),
                },
                HostField::Throws(reason) => {
                    let marker = thrown_marker(reason);
                    let mut hasher = DefaultHasher::new();
                    marker.hash(&mut hasher);
                    FieldSnap {
                        preview: Value::String(marker),
                        token: hasher.finish(),
                    }
                }
            };
            out.insert(key.clone(), snap);
        }
        Bag::Fields(out)
    }

    /// Full preview of the bag, as served by on-demand queries.
    pub fn to_value(&self) -> Value {
        match self {
            Bag::Absent => Value::Null,
            Bag::Fields(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, snap)| (k.clone(), snap.preview.clone()))
                    .collect(),
            ),
            Bag::Scalar(snap) => snap.preview.clone(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&FieldSnap> {
        match self {
            Bag::Fields(fields) => fields.get(key),
            _ => None,
        }
    }
}

/// Shallow diff of two captured bags. `prev == None` means the node is new.
pub fn diff_bags(prev: Option<&Bag>, next: &Bag) -> FieldDiff {
    let root = FieldDiff::ROOT_FIELD;
    let mut diff = FieldDiff::default();
    match (prev, next) {
        (None, Bag::Absent) | (Some(Bag::Absent), Bag::Absent) => {}
        (None, Bag::Fields(fields)) => {
            for (key, snap) in fields {
                diff.added.push(key.clone());
                diff.preview.insert(key.clone(), snap.preview.clone());
            }
        }
        (None, Bag::Scalar(snap)) | (Some(Bag::Absent), Bag::Scalar(snap)) => {
            diff.added.push(root.into());
            diff.preview.insert(root.into(), snap.preview.clone());
        }
        (Some(Bag::Fields(before)), Bag::Fields(after)) => {
            for (key, snap) in after {
                match before.get(key) {
                    Some(old) if old == snap => {}
                    Some(_) => {
                        diff.changed.push(key.clone());
                        diff.preview.insert(key.clone(), snap.preview.clone());
                    }
                    None => {
                        diff.added.push(key.clone());
                        diff.preview.insert(key.clone(), snap.preview.clone());
                    }
                }
            }
            diff.removed = before
                .keys()
                .filter(|key| !after.contains_key(*key))
                .cloned()
                .collect();
        }
        (Some(Bag::Scalar(a)), Bag::Scalar(b)) if a == b => {}
        (Some(_), Bag::Absent) => diff.removed.push(root.into()),
        (Some(_), next) => {
            diff.changed.push(root.into());
            diff.preview.insert(root.into(), next.to_value());
        }
    }
    diff
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn limits() -> PreviewLimits {
        PreviewLimits::default()
    }

    #[test]
    fn primitives_pass_through() {
        assert_eq!(preview(&HostValue::Int(3), &limits()), json!(3));
        assert_eq!(preview(&HostValue::Bool(true), &limits()), json!(true));
        assert_eq!(preview(&HostValue::Null, &limits()), json!(null));
        assert_eq!(preview(&HostValue::Float(f64::NAN), &limits()), json!("NaN"));
    }

    #[test]
    fn long_strings_are_truncated() {
        let long = "x".repeat(250);
        let rendered = preview(&HostValue::str(long.as_str()), &limits());
        let rendered = rendered.as_str().unwrap();
        assert_eq!(rendered.chars().count(), 201);
        assert!(rendered.ends_with(ELLIPSIS));
    }

    #[test]
    fn opaque_values_become_tags() {
        assert_eq!(
            preview(&HostValue::function("onClick"), &limits()),
            json!("[Function]")
        );
        assert_eq!(
            preview(&HostValue::handle("HTMLElement"), &limits()),
            json!("[HTMLElement]")
        );
        assert_eq!(preview(&HostValue::exotic("Proxy"), &limits()), json!("[Proxy]"));
    }

    #[test]
    fn lists_keep_three_items_and_a_marker() {
        let list = HostValue::list((1..=5).map(HostValue::Int));
        assert_eq!(preview(&list, &limits()), json!([1, 2, 3, "… 2 more"]));
    }

    #[test]
    fn records_cap_keys() {
        let record = HostValue::record((0..12).map(|i| (format!("k{i:02}"), HostValue::Int(i))));
        let rendered = preview(&record, &limits());
        let object = rendered.as_object().unwrap();
        assert_eq!(object.len(), 11);
        assert_eq!(object["…"], json!("2 more keys"));
    }

    #[test]
    fn depth_is_capped() {
        let deep = HostValue::record([(
            "a",
            HostValue::record([("b", HostValue::record([("c", HostValue::record([("d", HostValue::Int(1))]))]))]),
        )]);
        assert_eq!(
            preview(&deep, &limits()),
            json!({"a": {"b": {"c": "[…]"}}})
        );
    }

    #[test]
    fn cycles_are_marked() {
        let record = Arc::new(HostRecord::default());
        record.set("name", HostValue::str("loop"));
        record.set("me", HostValue::Record(record.clone()));
        let rendered = preview(&HostValue::Record(record.clone()), &limits());
        assert_eq!(rendered, json!({"name": "loop", "me": "[Circular]"}));
        record.remove("me");
    }

    #[test]
    fn throwing_getter_only_degrades_its_field() {
        let record = Arc::new(HostRecord::new([("ok", HostValue::Int(1))]));
        record.insert("bad", HostField::Throws("boom".into()));
        let bag = Bag::capture(&HostValue::Record(record), &limits());
        assert_eq!(bag.to_value(), json!({"ok": 1, "bad": "[Thrown: boom]"}));
    }

    #[test]
    fn counter_diff() {
        let before = Bag::capture(&HostValue::record([("count", HostValue::Int(0))]), &limits());
        let after = Bag::capture(&HostValue::record([("count", HostValue::Int(1))]), &limits());
        let diff = diff_bags(Some(&before), &after);
        assert_eq!(diff.changed, vec!["count"]);
        assert!(diff.added.is_empty() && diff.removed.is_empty());
        assert_eq!(Value::Object(diff.preview), json!({"count": 1}));
    }

    #[test]
    fn identical_bags_do_not_diff() {
        let shared = HostValue::list([HostValue::Int(1)]);
        let make = || HostValue::record([("items", shared.clone()), ("n", HostValue::Int(2))]);
        let a = Bag::capture(&make(), &limits());
        let b = Bag::capture(&make(), &limits());
        assert!(diff_bags(Some(&a), &b).is_empty());
    }

    #[test]
    fn new_reference_with_same_preview_still_differs() {
        let a = Bag::capture(
            &HostValue::record([("onClick", HostValue::function("f"))]),
            &limits(),
        );
        let b = Bag::capture(
            &HostValue::record([("onClick", HostValue::function("f"))]),
            &limits(),
        );
        assert_eq!(diff_bags(Some(&a), &b).changed, vec!["onClick"]);
    }

    #[test]
    fn a_freed_object_never_lends_its_identity_to_the_next() {
        let first = HostValue::record([("n", HostValue::Int(1))]);
        let token = first.identity_token();
        assert_eq!(first.clone().identity_token(), token);
        drop(first);

        let second = HostValue::record([("n", HostValue::Int(1))]);
        assert_ne!(second.identity_token(), token);

        let old_fn = HostValue::function("onClick");
        let old_token = old_fn.identity_token();
        drop(old_fn);
        assert_ne!(HostValue::function("onClick").identity_token(), old_token);
    }

    #[test]
    fn non_record_bags_collapse_to_root() {
        let a = Bag::capture(&HostValue::Int(1), &limits());
        let b = Bag::capture(&HostValue::record([("x", HostValue::Int(1))]), &limits());
        let diff = diff_bags(Some(&a), &b);
        assert_eq!(diff.changed, vec![FieldDiff::ROOT_FIELD]);
        assert_eq!(diff.preview[FieldDiff::ROOT_FIELD], json!({"x": 1}));

        let mount = diff_bags(None, &a);
        assert_eq!(mount.added, vec![FieldDiff::ROOT_FIELD]);
        assert!(diff_bags(None, &Bag::Absent).is_empty());
    }
}
