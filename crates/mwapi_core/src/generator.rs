use std::collections::{BTreeMap, VecDeque};

use serde_json::Value;

use crate::error::{Error, Result};
use crate::page::{NamespaceId, PageKey, PageResult};
use crate::paraminfo::ModuleInfo;
use crate::params::Params;
use crate::request::QueryFetch;

pub type ListGenerator<'a> = QueryGenerator<'a, ListItems>;
pub type PageGenerator<'a> = QueryGenerator<'a, MergedPages>;
pub type PropertyGenerator<'a> = QueryGenerator<'a, MergedPages>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavour {
    List,
    Pages,
    Properties,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorState {
    Idle,
    Fetching,
    Exhausted,
}

/// How one `action=query` response turns into items.
pub trait ResultShape {
    type Item;

    /// Items ready to yield from `response`. `batch_complete` is the server's
    /// `batchcomplete` flag.
    fn extract(&mut self, response: &Value, module: &str, batch_complete: bool)
    -> Result<Vec<Self::Item>>;

    /// Items still held back once no continuation is left.
    fn flush(&mut self) -> Vec<Self::Item> {
        Vec::new()
    }
}

/// Elements of `query.<module>` for `list=` modules.
#[derive(Debug, Default)]
pub struct ListItems;

impl ResultShape for ListItems {
    type Item = Value;

    fn extract(&mut self, response: &Value, module: &str, _: bool) -> Result<Vec<Value>> {
        match response.get("query").and_then(|query| query.get(module)) {
            Some(Value::Array(items)) => Ok(items.clone()),
            Some(Value::Object(items)) => Ok(items.values().cloned().collect()),
            Some(other) => Err(Error::InvalidResponse(format!(
                "query.{module} is not a list: {other}"
            ))),
            None => Ok(Vec::new()),
        }
    }
}

/// `query.pages` merged by page until the batch is complete.
///
/// Used by both page and property generators: a `prop` that continues
/// repeats the same page in the following response.
#[derive(Debug, Default)]
pub struct MergedPages {
    pending: Vec<PageResult>,
    index: BTreeMap<PageKey, usize>,
}

impl ResultShape for MergedPages {
    type Item = PageResult;

    fn extract(
        &mut self,
        response: &Value,
        _: &str,
        batch_complete: bool,
    ) -> Result<Vec<PageResult>> {
        for page in pages_of(response)? {
            match self.index.get(&page.key()) {
                Some(&position) => self.pending[position].merge(page),
                None => {
                    self.index.insert(page.key(), self.pending.len());
                    self.pending.push(page);
                }
            }
        }
        Ok(if batch_complete {
            self.flush()
        } else {
            Vec::new()
        })
    }

    fn flush(&mut self) -> Vec<PageResult> {
        self.index.clear();
        std::mem::take(&mut self.pending)
    }
}

/// Pages in response order; object-keyed pages come sorted by their string key.
fn pages_of(response: &Value) -> Result<Vec<PageResult>> {
    let pages = match response.get("query").and_then(|query| query.get("pages")) {
        Some(Value::Array(pages)) => pages.clone(),
        Some(Value::Object(pages)) => {
            let mut keyed = pages.iter().collect::<Vec<_>>();
            keyed.sort_by(|(a, _), (b, _)| a.cmp(b));
            keyed.into_iter().map(|(_, page)| page.clone()).collect()
        }
        Some(other) => {
            return Err(Error::InvalidResponse(format!(
                "query.pages is not a list: {other}"
            )));
        }
        None => Vec::new(),
    };
    pages
        .into_iter()
        .map(|page| PageResult::from_value(page).map_err(Error::from))
        .collect()
}

/// Iterates an `action=query` request across continuations.
///
/// Each `next` that finds the buffer empty issues one request through the
/// fetcher. The `continue` object of each response replaces the previous one
/// in the next request. Errors are yielded once, after which the generator is
/// exhausted.
pub struct QueryGenerator<'a, S: ResultShape> {
    api: &'a mut dyn QueryFetch,
    shape: S,
    module: String,
    params: Params,
    continuation: Params,
    state: GeneratorState,
    buffer: VecDeque<S::Item>,
    limit_params: Vec<String>,
    namespace_param: Option<(String, bool)>,
    flavour: Flavour,
    maximum_items: Option<usize>,
    query_increment: Option<usize>,
    yielded: usize,
    request_count: usize,
}

impl<'a> QueryGenerator<'a, ListItems> {
    /// `list=<module>`, yielding the raw list entries.
    pub fn list(api: &'a mut dyn QueryFetch, module: &str, params: Params) -> Self {
        let mut base = params!["action" => "query", "list" => module];
        base.extend(&params);
        Self::with_shape(api, ListItems, module, base, Flavour::List)
    }
}

impl<'a> QueryGenerator<'a, MergedPages> {
    /// `generator=<module>`, yielding one page per result.
    pub fn pages(api: &'a mut dyn QueryFetch, module: &str, params: Params) -> Self {
        let mut base = params!["action" => "query", "generator" => module];
        base.extend(&params);
        Self::with_shape(api, MergedPages::default(), module, base, Flavour::Pages)
    }

    /// `prop=<modules>` over the pages named in `params` (`titles`, `pageids`...).
    ///
    /// The cap counts pages, so it never becomes the prop module's `<prefix>limit`.
    /// That parameter is only sent after an explicit [`Self::set_query_increment`],
    /// since modules like `revisions` reject it for more than one page.
    pub fn properties(api: &'a mut dyn QueryFetch, modules: &[&str], params: Params) -> Self {
        let mut base = params!["action" => "query", "prop" => modules];
        base.extend(&params);
        Self::with_shape(
            api,
            MergedPages::default(),
            &modules.join("|"),
            base,
            Flavour::Properties,
        )
    }
}

impl<'a, S: ResultShape> QueryGenerator<'a, S> {
    fn with_shape(
        api: &'a mut dyn QueryFetch,
        shape: S,
        module: &str,
        params: Params,
        flavour: Flavour,
    ) -> Self {
        Self {
            api,
            shape,
            module: module.to_string(),
            params,
            continuation: Params::new(),
            state: GeneratorState::Idle,
            buffer: VecDeque::new(),
            limit_params: Vec::new(),
            namespace_param: None,
            flavour,
            maximum_items: None,
            query_increment: None,
            yielded: 0,
            request_count: 0,
        }
    }

    /// Learns the limit and namespace parameter names from the module schema.
    pub fn with_module_info(mut self, info: &ModuleInfo) -> Self {
        let prefix = if self.flavour == Flavour::Pages {
            format!("g{}", info.prefix)
        } else {
            info.prefix.clone()
        };
        if info.has_limit() {
            let name = format!("{prefix}limit");
            if !self.limit_params.contains(&name) {
                self.limit_params.push(name);
            }
        }
        if let Some(param) = info.parameter("namespace") {
            self.namespace_param = Some((format!("{prefix}namespace"), param.multi));
        }
        self
    }

    pub fn state(&self) -> GeneratorState {
        self.state
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn request_count(&self) -> usize {
        self.request_count
    }

    /// Caps the number of yielded items; zero or negative removes the cap.
    pub fn set_maximum_items(&mut self, maximum: i64) {
        self.maximum_items = usize::try_from(maximum).ok().filter(|max| *max > 0);
    }

    pub fn set_maximum_items_str(&mut self, maximum: &str) -> Result<()> {
        let parsed = maximum.trim().parse::<i64>().map_err(|_| {
            Error::Validation(format!("maximum items must be an integer, got {maximum:?}"))
        })?;
        self.set_maximum_items(parsed);
        Ok(())
    }

    pub fn maximum_items(&self) -> Option<usize> {
        self.maximum_items
    }

    /// Items requested per round trip; zero falls back to `max`.
    pub fn set_query_increment(&mut self, increment: usize) {
        self.query_increment = Some(increment).filter(|value| *value > 0);
    }

    pub fn set_namespace(&mut self, namespaces: &[NamespaceId]) -> Result<()> {
        if self.flavour == Flavour::Pages {
            return Err(Error::Validation(
                "namespace filtering is not supported on page generators".into(),
            ));
        }
        if namespaces.is_empty() {
            return Err(Error::Validation("namespace list must not be empty".into()));
        }
        let (name, multi) = self.namespace_param.clone().ok_or_else(|| {
            Error::Validation(format!("{} has no namespace parameter", self.module))
        })?;
        if !multi && namespaces.len() > 1 {
            return Err(Error::Validation(format!(
                "{name} accepts a single namespace, got {namespaces:?}"
            )));
        }
        self.params.insert(name, namespaces);
        Ok(())
    }

    fn cap_reached(&self) -> bool {
        self.maximum_items
            .is_some_and(|maximum| self.yielded >= maximum)
    }

    fn limit_value(&self) -> Option<String> {
        if self.flavour == Flavour::Properties {
            return self.query_increment.map(|increment| increment.to_string());
        }
        let remaining = self
            .maximum_items
            .map(|maximum| maximum.saturating_sub(self.yielded));
        Some(match (remaining, self.query_increment) {
            (Some(remaining), Some(increment)) => remaining.min(increment).to_string(),
            (Some(limit), None) | (None, Some(limit)) => limit.to_string(),
            (None, None) => "max".to_string(),
        })
    }

    fn fetch_next(&mut self) -> Result<()> {
        let mut request = self.params.clone();
        request.extend(&self.continuation);
        if !self.limit_params.is_empty()
            && let Some(limit) = self.limit_value()
        {
            for name in &self.limit_params {
                request.insert(name.clone(), limit.as_str());
            }
        }
        self.request_count += 1;
        let response = self.api.fetch(&request)?;

        let batch_complete = response
            .get("batchcomplete")
            .is_some_and(|flag| !matches!(flag, Value::Bool(false) | Value::Null));
        let mut items = self
            .shape
            .extract(&response, &self.module, batch_complete)?;

        match response.get("continue").and_then(Value::as_object) {
            Some(markers) => {
                self.continuation = Params::new();
                for (key, value) in markers {
                    let text = match value {
                        Value::String(text) => text.clone(),
                        other => other.to_string(),
                    };
                    self.continuation.insert(key.clone(), text.as_str());
                }
            }
            None => {
                self.state = GeneratorState::Exhausted;
                items.extend(self.shape.flush());
            }
        }
        self.buffer.extend(items);
        Ok(())
    }
}

impl<S: ResultShape> Iterator for QueryGenerator<'_, S> {
    type Item = Result<S::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.cap_reached() {
                self.state = GeneratorState::Exhausted;
                self.buffer.clear();
                return None;
            }
            if let Some(item) = self.buffer.pop_front() {
                self.yielded += 1;
                return Some(Ok(item));
            }
            if self.state == GeneratorState::Exhausted {
                return None;
            }
            self.state = GeneratorState::Fetching;
            if let Err(error) = self.fetch_next() {
                self.state = GeneratorState::Exhausted;
                return Some(Err(error));
            }
        }
    }
}
