use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::params::Params;
use crate::request::QueryFetch;

const INIT_MODULES: [&str; 2] = ["main", "paraminfo"];
const MODULES_PER_REQUEST: usize = 50;
const QUERY_SUBMODULE_PARAMS: [&str; 3] = ["prop", "list", "meta"];
/// Parameters of the json format module, accepted on every request.
const FORMAT_PARAMS: [&str; 5] = ["format", "formatversion", "utf8", "ascii", "callback"];

/// Schema of one API module as reported by `action=paraminfo`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ModuleInfo {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub parameters: Vec<ParameterInfo>,
    /// Everything else the server reports, e.g. `mustbeposted` or `readrights`.
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ParameterInfo {
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: ParamType,
    #[serde(default)]
    pub multi: bool,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub deprecated: bool,
    #[serde(default)]
    pub max: Option<u64>,
    #[serde(default)]
    pub highmax: Option<u64>,
    #[serde(default)]
    pub default: Option<Value>,
    /// Submodule name to module path, for parameters selecting submodules.
    #[serde(default)]
    pub submodules: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ParamType {
    Values(Vec<String>),
    Name(String),
}

impl Default for ParamType {
    fn default() -> Self {
        Self::Name("string".to_string())
    }
}

impl ParameterInfo {
    /// Option names of a toggle list, with the `!` negation stripped.
    pub fn option_names(&self) -> Option<BTreeSet<String>> {
        match &self.kind {
            ParamType::Values(values) => Some(
                values
                    .iter()
                    .map(|value| value.trim_start_matches('!').to_string())
                    .collect(),
            ),
            ParamType::Name(_) => None,
        }
    }
}

impl ModuleInfo {
    pub fn parameter(&self, name: &str) -> Option<&ParameterInfo> {
        self.parameters.iter().find(|param| param.name == name)
    }

    /// Whether the module accepts a `<prefix>limit` parameter.
    pub fn has_limit(&self) -> bool {
        self.parameter("limit")
            .is_some_and(|param| param.kind == ParamType::Name("limit".to_string()))
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes
            .get(name)
            .filter(|value| !matches!(value, Value::Bool(false) | Value::Null))
    }

    pub fn must_be_posted(&self) -> bool {
        self.attribute("mustbeposted").is_some()
    }

    /// Full wire names of the module parameters.
    pub fn prefixed_parameters(&self, extra_prefix: &str) -> impl Iterator<Item = String> + '_ {
        let prefix = format!("{extra_prefix}{}", self.prefix);
        self.parameters
            .iter()
            .map(move |param| format!("{prefix}{}", param.name))
    }
}

/// Lazily populated registry of module schemas, keyed by module path (`query+revisions`).
#[derive(Debug, Clone, Default)]
pub struct ParamInfo {
    modules: BTreeMap<String, ModuleInfo>,
    missing: BTreeSet<String>,
    submodules: BTreeMap<String, BTreeMap<String, String>>,
    preload: BTreeSet<String>,
    initialized: bool,
}

impl ParamInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry that also loads `modules` together with `main` and `paraminfo`.
    pub fn with_preloaded(modules: &[&str]) -> Self {
        Self {
            preload: modules.iter().map(ToString::to_string).collect(),
            ..Self::default()
        }
    }

    pub fn preloaded_modules(&self) -> BTreeSet<String> {
        INIT_MODULES
            .iter()
            .map(ToString::to_string)
            .chain(self.preload.iter().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.modules.contains_key(path)
    }

    /// Whether the server already reported `path` as unknown.
    pub fn is_missing(&self, path: &str) -> bool {
        self.missing.contains(path)
    }

    /// Adds a module schema by hand, replacing any loaded one.
    pub fn insert(&mut self, module: ModuleInfo) {
        let table = module
            .parameters
            .iter()
            .filter_map(|param| param.submodules.as_ref())
            .flat_map(|subs| subs.iter().map(|(k, v)| (k.clone(), v.clone())))
            .collect::<BTreeMap<_, _>>();
        if !table.is_empty() {
            self.submodules.insert(module.path.clone(), table);
        }
        self.missing.remove(&module.path);
        self.modules.insert(module.path.clone(), module);
    }

    /// Loads `main`, `paraminfo` and the preloaded modules once.
    pub fn init(&mut self, api: &mut dyn QueryFetch) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        let wanted = self
            .preloaded_modules()
            .into_iter()
            .filter(|path| !self.modules.contains_key(path))
            .collect::<Vec<_>>();
        self.load(api, &wanted)?;
        self.initialized = true;
        Ok(())
    }

    /// Loads the named modules. Names the server does not know are recorded as missing, not raised.
    pub fn fetch(&mut self, api: &mut dyn QueryFetch, names: &[&str]) -> Result<()> {
        self.init(api)?;
        if !self.contains("query") && names.iter().any(|name| self.needs_query_table(name)) {
            self.load(api, &["query".to_string()])?;
        }
        let mut wanted = Vec::new();
        for name in names {
            let path = self.normalize(name);
            if !self.modules.contains_key(&path)
                && !self.missing.contains(&path)
                && !wanted.contains(&path)
            {
                wanted.push(path);
            }
        }
        self.load(api, &wanted)
    }

    /// Direct lookup of an already loaded module.
    pub fn get(&self, name: &str) -> Result<&ModuleInfo> {
        self.modules
            .get(&self.normalize(name))
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    /// Loads `name` if needed and returns it.
    pub fn module(&mut self, api: &mut dyn QueryFetch, name: &str) -> Result<&ModuleInfo> {
        self.fetch(api, &[name])?;
        self.get(name)
    }

    pub fn parameter(
        &mut self,
        api: &mut dyn QueryFetch,
        module: &str,
        param: &str,
    ) -> Result<Option<&ParameterInfo>> {
        Ok(self.module(api, module)?.parameter(param))
    }

    /// Submodule names (or paths when `with_path`) of a module that has any.
    pub fn submodules(
        &mut self,
        api: &mut dyn QueryFetch,
        name: &str,
        with_path: bool,
    ) -> Result<BTreeSet<String>> {
        self.fetch(api, &[name])?;
        let table = self
            .submodules
            .get(&self.normalize(name))
            .ok_or_else(|| Error::NotFound(format!("{name} has no submodules")))?;
        Ok(if with_path {
            table.values().cloned().collect()
        } else {
            table.keys().cloned().collect()
        })
    }

    pub fn action_modules(&mut self, api: &mut dyn QueryFetch) -> Result<BTreeSet<String>> {
        self.init(api)?;
        Ok(self.action_table().keys().cloned().collect())
    }

    pub fn query_modules(&mut self, api: &mut dyn QueryFetch) -> Result<BTreeSet<String>> {
        self.submodules(api, "query", false)
    }

    /// Query submodules that accept a `<prefix>limit` parameter.
    pub fn query_modules_with_limits(
        &mut self,
        api: &mut dyn QueryFetch,
    ) -> Result<BTreeSet<String>> {
        let paths = self.submodules(api, "query", true)?;
        let names = paths.iter().map(String::as_str).collect::<Vec<_>>();
        self.fetch(api, &names)?;
        Ok(paths
            .iter()
            .filter_map(|path| self.modules.get(path))
            .filter(|module| module.has_limit())
            .map(|module| module.name.clone())
            .collect())
    }

    /// Loads every action module and every query submodule.
    pub fn fetch_all(&mut self, api: &mut dyn QueryFetch) -> Result<()> {
        let mut paths = self.action_modules(api)?;
        paths.extend(self.submodules(api, "query", true)?);
        let names = paths.iter().map(String::as_str).collect::<Vec<_>>();
        self.fetch(api, &names)
    }

    /// Bare module names, without their `query+` path.
    pub fn modules(&mut self, api: &mut dyn QueryFetch) -> Result<BTreeSet<String>> {
        self.fetch_all(api)?;
        Ok(self.modules.values().map(|module| module.name.clone()).collect())
    }

    pub fn module_paths(&mut self, api: &mut dyn QueryFetch) -> Result<BTreeSet<String>> {
        self.fetch_all(api)?;
        Ok(self.modules.keys().cloned().collect())
    }

    /// Module name to parameter prefix.
    pub fn prefixes(&mut self, api: &mut dyn QueryFetch) -> Result<BTreeMap<String, String>> {
        self.fetch_all(api)?;
        Ok(self
            .modules
            .values()
            .map(|module| (module.name.clone(), module.prefix.clone()))
            .collect())
    }

    /// Module path to parameter prefix.
    pub fn prefix_map(&mut self, api: &mut dyn QueryFetch) -> Result<BTreeMap<String, String>> {
        self.fetch_all(api)?;
        Ok(self
            .modules
            .iter()
            .map(|(path, module)| (path.clone(), module.prefix.clone()))
            .collect())
    }

    /// Module path to attribute value, for every module carrying `attribute`.
    pub fn attributes(
        &mut self,
        api: &mut dyn QueryFetch,
        attribute: &str,
    ) -> Result<BTreeMap<String, Value>> {
        self.fetch_all(api)?;
        Ok(self
            .modules
            .iter()
            .filter_map(|(path, module)| {
                module
                    .attribute(attribute)
                    .map(|value| (path.clone(), value.clone()))
            })
            .collect())
    }

    /// `Some(true)` if `action` is known and must be posted; `None` when it is not loaded.
    pub fn must_be_posted(&self, action: &str) -> Option<bool> {
        self.modules.get(action).map(ModuleInfo::must_be_posted)
    }

    /// Every parameter name `params` may carry, given its action and selected submodules.
    pub fn allowed_parameters(
        &mut self,
        api: &mut dyn QueryFetch,
        params: &Params,
    ) -> Result<BTreeSet<String>> {
        let action = params
            .first("action")
            .ok_or_else(|| Error::Validation("missing action parameter".into()))?
            .to_string();
        if !self.action_modules(api)?.contains(&action) {
            return Err(Error::Validation(format!("unknown action: {action}")));
        }
        self.fetch(api, &[action.as_str()])?;

        let mut allowed = FORMAT_PARAMS
            .iter()
            .map(ToString::to_string)
            .collect::<BTreeSet<_>>();
        allowed.extend(self.get("main")?.prefixed_parameters(""));
        allowed.extend(self.get(&action)?.prefixed_parameters(""));

        if action == "query" {
            let mut selected = Vec::new();
            for key in QUERY_SUBMODULE_PARAMS {
                for name in params.get(key).unwrap_or_default() {
                    selected.push((format!("query+{name}"), ""));
                }
            }
            if let Some(generator) = params.first("generator") {
                selected.push((format!("query+{generator}"), "g"));
            }
            let paths = selected.iter().map(|(path, _)| path.as_str()).collect::<Vec<_>>();
            self.fetch(api, &paths)?;
            for (path, extra) in &selected {
                let module = self.get(path).map_err(|_| {
                    Error::Validation(format!("unknown query module: {path}"))
                })?;
                allowed.extend(module.prefixed_parameters(extra));
            }
        }
        Ok(allowed)
    }

    fn action_table(&self) -> BTreeMap<String, String> {
        self.modules
            .get("main")
            .and_then(|main| main.parameter("action"))
            .and_then(|param| param.submodules.clone())
            .unwrap_or_default()
    }

    fn needs_query_table(&self, name: &str) -> bool {
        !name.contains('+')
            && !INIT_MODULES.contains(&name)
            && name != "query"
            && !self.action_table().contains_key(name)
    }

    /// Resolves a bare query submodule name (`info`) to its path (`query+info`).
    fn normalize(&self, name: &str) -> String {
        if name.contains('+') || INIT_MODULES.contains(&name) {
            return name.to_string();
        }
        if let Some(path) = self.action_table().get(name) {
            return path.clone();
        }
        self.submodules
            .get("query")
            .and_then(|table| table.get(name))
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }

    fn load(&mut self, api: &mut dyn QueryFetch, paths: &[String]) -> Result<()> {
        for batch in paths.chunks(MODULES_PER_REQUEST) {
            let mut params = Params::new();
            params.insert("action", "paraminfo");
            params.insert("modules", batch.to_vec());
            params.insert("helpformat", "none");
            let response = api.fetch(&params)?;
            let modules = response
                .pointer("/paraminfo/modules")
                .and_then(Value::as_array)
                .ok_or_else(|| {
                    Error::InvalidResponse("paraminfo response without modules".into())
                })?;
            let mut returned = BTreeSet::new();
            for module in modules {
                let module: ModuleInfo = serde_json::from_value(module.clone())?;
                returned.insert(module.path.clone());
                self.insert(module);
            }
            for path in batch {
                if !returned.contains(path) {
                    log::debug!("paraminfo: module {path} not present on this wiki");
                    self.missing.insert(path.clone());
                }
            }
        }
        Ok(())
    }
}
