use std::collections::BTreeMap;
use std::collections::btree_map;

use url::form_urlencoded;

use crate::options::OptionSet;
use crate::page::PageRef;

/// Joins multi-values when one of them contains `|`; the API expects it as a leading marker too.
const UNIT_SEPARATOR: char = '\u{1f}';

/// To quickly create a parameter set.
/// Example: `params!["action" => "query", "meta" => "siteinfo", "siprop" => "general|namespaces"]`
#[macro_export]
macro_rules! params {
    ($( $key: expr => $val: expr ),* $(,)?) => {{
        let mut params = $crate::params::Params::new();
        $( params.insert($key, $val); )*
        params
    }}
}

/// Request parameters: each name maps to an ordered list of values.
///
/// Names iterate in sorted order, so two sets built in a different order
/// encode identically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    values: BTreeMap<String, Vec<String>>,
}

/// A typed parameter value before it is flattened into strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    /// `true` is sent as the parameter with an empty value, `false` omits it.
    Flag(bool),
    Values(Vec<String>),
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `key`, replacing previous values. A `false` flag removes the key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ParamValue>) {
        let key = key.into();
        match value.into() {
            ParamValue::Flag(true) => {
                self.values.insert(key, vec![String::new()]);
            }
            ParamValue::Flag(false) => {
                self.values.remove(&key);
            }
            ParamValue::Values(values) => {
                self.values.insert(key, values);
            }
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.values.get(key).map(Vec::as_slice)
    }

    /// The values of `key` joined the way they are sent.
    pub fn get_joined(&self, key: &str) -> Option<String> {
        self.values.get(key).map(|values| join_values(values))
    }

    /// The first value of `key`; convenient for single-valued parameters like `action`.
    pub fn first(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn remove(&mut self, key: &str) -> Option<Vec<String>> {
        self.values.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Vec<String>> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Copies every parameter of `other` over this set.
    pub fn extend(&mut self, other: &Params) {
        for (key, values) in other.iter() {
            self.values.insert(key.clone(), values.clone());
        }
    }

    /// Name to wire value, with multi-values joined.
    pub fn encoded_items(&self) -> BTreeMap<String, String> {
        self.values
            .iter()
            .map(|(key, values)| (key.clone(), join_values(values)))
            .collect()
    }

    /// Pairs suitable for `RequestBuilder::query` and `RequestBuilder::form`.
    pub fn pairs(&self) -> Vec<(String, String)> {
        self.encoded_items().into_iter().collect()
    }

    /// `application/x-www-form-urlencoded` form of the set.
    pub fn encode(&self) -> String {
        form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.encoded_items())
            .finish()
    }

    /// Parses a query string or form body back into a set.
    pub fn decode(encoded: &str) -> Self {
        let mut params = Self::new();
        for (key, value) in form_urlencoded::parse(encoded.as_bytes()) {
            params
                .values
                .insert(key.into_owned(), split_values(&value));
        }
        params
    }
}

impl<'a> IntoIterator for &'a Params {
    type Item = (&'a String, &'a Vec<String>);
    type IntoIter = btree_map::Iter<'a, String, Vec<String>>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.iter()
    }
}

fn join_values(values: &[String]) -> String {
    if values.iter().any(|value| value.contains('|')) {
        let mut joined = String::new();
        for value in values {
            joined.push(UNIT_SEPARATOR);
            joined.push_str(value);
        }
        joined
    } else {
        values.join("|")
    }
}

fn split_values(value: &str) -> Vec<String> {
    match value.strip_prefix(UNIT_SEPARATOR) {
        Some(rest) => rest.split(UNIT_SEPARATOR).map(ToString::to_string).collect(),
        None => value.split('|').map(ToString::to_string).collect(),
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        Self::Flag(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::Values(value.split('|').map(ToString::to_string).collect())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

impl From<&String> for ParamValue {
    fn from(value: &String) -> Self {
        Self::from(value.as_str())
    }
}

macro_rules! impl_from_number {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for ParamValue {
                fn from(value: $ty) -> Self {
                    Self::Values(vec![value.to_string()])
                }
            }
        )*
    };
}

impl_from_number!(i32, i64, u32, u64, usize);

impl From<Vec<String>> for ParamValue {
    fn from(values: Vec<String>) -> Self {
        Self::Values(values)
    }
}

impl From<&[&str]> for ParamValue {
    fn from(values: &[&str]) -> Self {
        Self::Values(values.iter().map(ToString::to_string).collect())
    }
}

impl<const N: usize> From<[&str; N]> for ParamValue {
    fn from(values: [&str; N]) -> Self {
        Self::from(&values[..])
    }
}

impl From<&PageRef> for ParamValue {
    fn from(page: &PageRef) -> Self {
        Self::Values(vec![page.title().to_string()])
    }
}

impl From<PageRef> for ParamValue {
    fn from(page: PageRef) -> Self {
        Self::from(&page)
    }
}

impl From<&[PageRef]> for ParamValue {
    fn from(pages: &[PageRef]) -> Self {
        Self::Values(pages.iter().map(|page| page.title().to_string()).collect())
    }
}

impl From<&[i32]> for ParamValue {
    fn from(values: &[i32]) -> Self {
        Self::Values(values.iter().map(ToString::to_string).collect())
    }
}

impl From<&OptionSet> for ParamValue {
    fn from(options: &OptionSet) -> Self {
        Self::Values(options.api_values())
    }
}

#[cfg(test)]
mod tests {
    use super::{ParamValue, Params};
    use crate::options::OptionSet;
    use crate::page::PageRef;

    #[test]
    fn dictionary_interface() {
        let mut params = params!["action" => "test", "foo" => "", "bar" => "test"];
        assert!(params.contains_key("foo"));
        assert_eq!(params.get("bar"), Some(&["test".to_string()][..]));
        params.insert("one", "1");
        assert_eq!(params.get("one"), Some(&["1".to_string()][..]));
        assert_eq!(params.keys().collect::<Vec<_>>(), vec!["action", "bar", "foo", "one"]);
        assert!(params.encoded_items().values().any(|value| value == "test"));
        for (_key, values) in &params {
            assert!(!values.is_empty());
        }
    }

    #[test]
    fn parameter_named_parameters_is_plain() {
        let params = params!["action" => "test", "parameters" => "foo"];
        assert_eq!(params.first("parameters"), Some("foo"));
    }

    #[test]
    fn booleans_use_presence_sentinel() {
        let params = params!["action" => "query", "fake" => true, "redirects" => false];
        assert_eq!(params.get_joined("fake"), Some(String::new()));
        assert!(!params.contains_key("redirects"));
        assert_eq!(params.encode(), "action=query&fake=");
    }

    #[test]
    fn multi_values_join_with_pipe() {
        let params = params!["titles" => ["A", "B"], "prop" => "info|revisions"];
        assert_eq!(params.get("prop").map(<[String]>::len), Some(2));
        assert_eq!(params.get_joined("titles").as_deref(), Some("A|B"));
        assert_eq!(params.encode(), "prop=info%7Crevisions&titles=A%7CB");
    }

    #[test]
    fn values_containing_pipe_use_unit_separator() {
        let params = Params::new().with("text", vec!["{{a|b}}".to_string(), "c".to_string()]);
        assert_eq!(
            params.get_joined("text").as_deref(),
            Some("\u{1f}{{a|b}}\u{1f}c")
        );
        let decoded = Params::decode(&params.encode());
        assert_eq!(decoded, params);
    }

    #[test]
    fn page_refs_encode_as_titles() {
        let page = PageRef::new(0, "Ümlä  üt");
        let params = params!["action" => "query", "titles" => &page];
        assert_eq!(params.first("titles"), Some("Ümlä üt"));
        let decoded = Params::decode(&params.encode());
        assert_eq!(decoded.first("titles"), Some("Ümlä üt"));
    }

    #[test]
    fn insertion_order_does_not_matter() {
        let a = params!["b" => "2", "a" => "1"];
        let b = params!["a" => "1", "b" => "2"];
        assert_eq!(a, b);
        assert_eq!(a.encode(), b.encode());
    }

    #[test]
    fn option_sets_and_numbers_convert() {
        let mut options = OptionSet::new();
        options.set("anon", Some(true)).expect("anon");
        options.set("bot", Some(false)).expect("bot");
        let params = params!["rcshow" => &options, "rclimit" => 50usize, "rcnamespace" => &[0, 4][..]];
        assert_eq!(params.get_joined("rcshow").as_deref(), Some("anon|!bot"));
        assert_eq!(params.first("rclimit"), Some("50"));
        assert_eq!(params.get_joined("rcnamespace").as_deref(), Some("0|4"));
        assert_eq!(ParamValue::from(false), ParamValue::Flag(false));
    }
}
