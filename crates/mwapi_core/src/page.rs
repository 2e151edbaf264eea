use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Alias for a namespace (could be -1 for Special pages etc.)
pub type NamespaceId = i32;

/// A page passed as a request parameter. Only the normalized title is sent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageRef {
    namespace: NamespaceId,
    title: String,
}

impl PageRef {
    pub fn new(namespace: NamespaceId, title: &str) -> Self {
        Self {
            namespace,
            title: normalize_title(title),
        }
    }

    pub fn namespace(&self) -> NamespaceId {
        self.namespace
    }

    pub fn title(&self) -> &str {
        &self.title
    }
}

impl fmt::Display for PageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.title)
    }
}

/// Underscores become spaces and whitespace runs collapse, the way titles appear in API output.
pub fn normalize_title(title: &str) -> String {
    title
        .replace('_', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// One page of a `query.pages` result, with every property module's output kept as JSON.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PageResult {
    #[serde(default)]
    pub pageid: Option<i64>,
    #[serde(default)]
    pub ns: NamespaceId,
    #[serde(default)]
    pub title: String,
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub missing: bool,
    #[serde(flatten)]
    pub props: Map<String, Value>,
}

/// Identity used to merge the same page across continuation responses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PageKey {
    Id(i64),
    Title(String),
}

impl PageResult {
    pub fn from_value(value: Value) -> serde_json::Result<Self> {
        serde_json::from_value(value)
    }

    pub fn key(&self) -> PageKey {
        match self.pageid {
            Some(id) => PageKey::Id(id),
            None => PageKey::Title(self.title.clone()),
        }
    }

    pub fn revisions(&self) -> &[Value] {
        self.props
            .get("revisions")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn prop(&self, name: &str) -> Option<&Value> {
        self.props.get(name)
    }

    /// Folds a later response for the same page into this one.
    /// Arrays are appended, objects are merged key by key and scalars are replaced.
    pub fn merge(&mut self, other: PageResult) {
        if self.pageid.is_none() {
            self.pageid = other.pageid;
        }
        if !other.title.is_empty() {
            self.title = other.title;
        }
        self.ns = other.ns;
        self.missing = other.missing;
        for (key, value) in other.props {
            json_merge(self.props.entry(key).or_insert(Value::Null), value);
        }
    }
}

pub(crate) fn json_merge(a: &mut Value, b: Value) {
    match (a, b) {
        (Value::Object(a), Value::Object(b)) => {
            for (k, v) in b {
                json_merge(a.entry(k).or_insert(Value::Null), v);
            }
        }
        (Value::Array(a), Value::Array(b)) => a.extend(b),
        (a, b) => *a = b,
    }
}

fn deserialize_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    // formatversion=1 marks flags with an empty string
    Ok(match Value::deserialize(deserializer)? {
        Value::Bool(flag) => flag,
        Value::Null => false,
        _ => true,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{PageKey, PageRef, PageResult, normalize_title};

    #[test]
    fn page_ref_normalizes_title() {
        let page = PageRef::new(0, "Ümlä  üt");
        assert_eq!(page.title(), "Ümlä üt");
        assert_eq!(PageRef::new(2, "User_talk_page ").title(), "User talk page");
        assert_eq!(normalize_title("  A__B "), "A B");
    }

    #[test]
    fn page_result_keeps_unknown_props() {
        let page = PageResult::from_value(json!({
            "pageid": 47757,
            "ns": 4,
            "title": "Wikipedia:Disambiguation",
            "lastrevid": 12,
        }))
        .expect("page");
        assert_eq!(page.key(), PageKey::Id(47757));
        assert_eq!(page.prop("lastrevid"), Some(&json!(12)));
        assert!(!page.missing);
    }

    #[test]
    fn missing_flag_accepts_both_format_versions() {
        let v1 = PageResult::from_value(json!({"ns": 0, "title": "Nope", "missing": ""})).expect("v1");
        let v2 = PageResult::from_value(json!({"ns": 0, "title": "Nope", "missing": true})).expect("v2");
        assert!(v1.missing);
        assert!(v2.missing);
        assert_eq!(v1.key(), PageKey::Title("Nope".to_string()));
    }

    #[test]
    fn merge_accumulates_revisions_and_replaces_scalars() {
        let mut page = PageResult::from_value(json!({
            "pageid": 1, "ns": 0, "title": "A",
            "revisions": [{"revid": 10}],
            "touched": "old"
        }))
        .expect("page");
        page.merge(
            PageResult::from_value(json!({
                "pageid": 1, "ns": 0, "title": "A",
                "revisions": [{"revid": 11}],
                "coordinates": [{"lat": 1.0}],
                "touched": "new"
            }))
            .expect("page"),
        );
        assert_eq!(page.revisions().len(), 2);
        assert_eq!(page.revisions()[1]["revid"], 11);
        assert_eq!(page.prop("coordinates"), Some(&json!([{"lat": 1.0}])));
        assert_eq!(page.prop("touched"), Some(&json!("new")));
    }
}
