use std::collections::BTreeMap;

use serde_json::Value;

use crate::cache::CacheStore;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::generator::{ListGenerator, PageGenerator, PropertyGenerator, QueryGenerator};
use crate::options::OptionSet;
use crate::paraminfo::{ModuleInfo, ParamInfo};
use crate::params::Params;
use crate::request::{QueryFetch, Request, RetryPolicy, check_response, is_write, url_length};
use crate::transport::{HttpTransport, Method, Transport};

/// A session against one `api.php` endpoint.
pub struct Site {
    config: ClientConfig,
    api_url: String,
    transport: Box<dyn Transport>,
    paraminfo: ParamInfo,
    tokens: BTreeMap<String, String>,
    user: Option<String>,
    retry: RetryPolicy,
}

impl Site {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let transport = HttpTransport::new(&config)?;
        Self::with_transport(config, Box::new(transport))
    }

    pub fn with_transport(config: ClientConfig, transport: Box<dyn Transport>) -> Result<Self> {
        let api_url = config.api_url()?;
        let retry = RetryPolicy {
            max_lag_retries: config.max_retries(),
            ..RetryPolicy::default()
        };
        Ok(Self {
            config,
            api_url,
            transport,
            paraminfo: ParamInfo::new(),
            tokens: BTreeMap::new(),
            user: None,
            retry,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// The logged-in user, or `None` for an anonymous session.
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn paraminfo(&self) -> &ParamInfo {
        &self.paraminfo
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn set_retry_policy(&mut self, policy: RetryPolicy) {
        self.retry = policy;
    }

    pub fn request_count(&self) -> usize {
        self.transport.request_count()
    }

    pub fn cache_store(&self) -> CacheStore {
        CacheStore::new(self.config.cache_dir())
    }

    /// Submits `params` through [`Request::submit`].
    pub fn submit(&mut self, params: Params) -> Result<Value> {
        Request::new(params).submit(self)
    }

    /// One round trip without retries. The payload may still carry an API `error`.
    ///
    /// Pacing follows [`Request::is_write`], not the HTTP method.
    pub fn send_raw(&mut self, method: Method, params: &Params) -> Result<Value> {
        let is_write = is_write(params);
        let mut wire = params.clone();
        wire.insert("format", "json");
        wire.insert("formatversion", "2");
        self.transport.send(method, &wire, is_write)
    }

    /// One round trip with API errors mapped to [`Error`].
    pub fn call(&mut self, method: Method, params: &Params) -> Result<Value> {
        check_response(self.send_raw(method, params)?)
    }

    /// A token of `kind` (`csrf`, `login`, `patrol`...), fetched once and then reused.
    pub fn token(&mut self, kind: &str) -> Result<String> {
        if let Some(token) = self.tokens.get(kind) {
            return Ok(token.clone());
        }
        let token = self.fetch_token(kind)?;
        self.tokens.insert(kind.to_string(), token.clone());
        Ok(token)
    }

    pub fn invalidate_token(&mut self, kind: &str) {
        self.tokens.remove(kind);
    }

    /// Logs in with the configured credentials.
    pub fn login(&mut self) -> Result<()> {
        let username = self.config.username().ok_or_else(|| Error::NoUsername {
            site: self.api_url.clone(),
        })?;
        let password = self.config.password().ok_or_else(|| Error::Auth {
            reason: format!("no password configured for {username}"),
        })?;

        let login_token = self.fetch_token("login")?;
        let response = self.call(
            Method::Post,
            &params![
                "action" => "login",
                "lgname" => &username,
                "lgpassword" => password,
                "lgtoken" => login_token,
            ],
        )?;
        let login = response
            .get("login")
            .ok_or_else(|| Error::InvalidResponse("login response without login object".into()))?;
        match login.get("result").and_then(Value::as_str) {
            Some("Success") => {
                let name = login
                    .get("lgusername")
                    .and_then(Value::as_str)
                    .map_or(username, ToString::to_string);
                log::info!("logged in to {} as {name}", self.api_url);
                self.user = Some(name);
                self.tokens.clear();
                Ok(())
            }
            other => Err(Error::Auth {
                reason: login
                    .get("reason")
                    .and_then(Value::as_str)
                    .or(other)
                    .unwrap_or("unknown error")
                    .to_string(),
            }),
        }
    }

    /// Runs `f` with the registry and a fetcher that bypasses validation and retries.
    pub fn with_paraminfo<T>(
        &mut self,
        f: impl FnOnce(&mut ParamInfo, &mut dyn QueryFetch) -> Result<T>,
    ) -> Result<T> {
        let mut paraminfo = std::mem::take(&mut self.paraminfo);
        let result = f(&mut paraminfo, &mut Direct(self));
        self.paraminfo = paraminfo;
        result
    }

    pub fn paraminfo_fetch(&mut self, modules: &[&str]) -> Result<()> {
        self.with_paraminfo(|paraminfo, api| paraminfo.fetch(api, modules))
    }

    pub fn module_info(&mut self, module: &str) -> Result<ModuleInfo> {
        self.with_paraminfo(|paraminfo, api| paraminfo.module(api, module).cloned())
    }

    /// An option set bound to the schema of `module`'s parameter `param`.
    pub fn option_set(&mut self, module: &str, param: &str) -> Result<OptionSet> {
        let info = self.module_info(module)?;
        let parameter = info
            .parameter(param)
            .ok_or_else(|| Error::NotFound(format!("{module} parameter {param}")))?;
        OptionSet::for_parameter(module, parameter)
    }

    pub fn list_generator(&mut self, module: &str, params: Params) -> Result<ListGenerator<'_>> {
        let info = self.module_info(module)?;
        Ok(QueryGenerator::list(self, module, params).with_module_info(&info))
    }

    pub fn page_generator(&mut self, module: &str, params: Params) -> Result<PageGenerator<'_>> {
        let info = self.module_info(module)?;
        Ok(QueryGenerator::pages(self, module, params).with_module_info(&info))
    }

    pub fn property_generator(
        &mut self,
        modules: &[&str],
        params: Params,
    ) -> Result<PropertyGenerator<'_>> {
        let infos = modules
            .iter()
            .map(|module| self.module_info(module))
            .collect::<Result<Vec<_>>>()?;
        let mut generator = QueryGenerator::properties(self, modules, params);
        for info in &infos {
            generator = generator.with_module_info(info);
        }
        Ok(generator)
    }

    fn fetch_token(&mut self, kind: &str) -> Result<String> {
        let response = self.call(
            Method::Get,
            &params!["action" => "query", "meta" => "tokens", "type" => kind],
        )?;
        response
            .pointer(&format!("/query/tokens/{kind}token"))
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| Error::InvalidResponse(format!("no {kind} token in response")))
    }
}

impl QueryFetch for Site {
    fn fetch(&mut self, params: &Params) -> Result<Value> {
        Request::new(params.clone()).submit(self)
    }
}

/// Plain fetcher used for registry loads.
struct Direct<'s>(&'s mut Site);

impl QueryFetch for Direct<'_> {
    fn fetch(&mut self, params: &Params) -> Result<Value> {
        let method = if url_length(params, self.0) > self.0.config.max_url_length() {
            Method::Post
        } else {
            Method::Get
        };
        self.0.call(method, params)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use serde_json::{Value, json};

    use super::Site;
    use crate::config::ClientConfig;
    use crate::error::{Error, Result};
    use crate::params::Params;
    use crate::paraminfo::tests::schema_fetch;
    use crate::transport::{Method, Transport};

    pub(crate) type Calls = Rc<RefCell<Vec<(Method, Params)>>>;

    /// A site whose transport answers with `respond` and records every request.
    pub(crate) fn fake_site_with_config<F>(config: ClientConfig, mut respond: F) -> (Site, Calls)
    where
        F: FnMut(Method, &Params) -> Result<Value> + 'static,
    {
        let calls = Calls::default();
        let log = Rc::clone(&calls);
        let transport = move |method: Method, params: &Params| -> Result<Value> {
            log.borrow_mut().push((method, params.clone()));
            respond(method, params)
        };
        let site = Site::with_transport(config, Box::new(transport)).expect("site");
        (site, calls)
    }

    /// A config for the fake endpoint that ignores `WIKI_*` variables.
    pub(crate) fn test_config() -> ClientConfig {
        ClientConfig::for_api_url("https://test.wiki/w/api.php").without_env()
    }

    pub(crate) fn fake_site<F>(respond: F) -> (Site, Calls)
    where
        F: FnMut(Method, &Params) -> Result<Value> + 'static,
    {
        fake_site_with_config(test_config(), respond)
    }

    fn credentials() -> ClientConfig {
        let mut config = test_config();
        config.wiki.username = Some("Bot".into());
        config.wiki.password = Some("secret".into());
        config
    }

    #[test]
    fn tokens_are_cached_until_invalidated() {
        let (mut site, calls) = fake_site(|_, _| {
            Ok(json!({"query": {"tokens": {"csrftoken": "abc+\\"}}}))
        });
        assert_eq!(site.token("csrf").expect("token"), "abc+\\");
        assert_eq!(site.token("csrf").expect("token"), "abc+\\");
        assert_eq!(calls.borrow().len(), 1);
        site.invalidate_token("csrf");
        site.token("csrf").expect("token");
        assert_eq!(calls.borrow().len(), 2);
        assert_eq!(calls.borrow()[0].1.first("type"), Some("csrf"));
    }

    #[test]
    fn missing_token_is_an_invalid_response() {
        let (mut site, _calls) = fake_site(|_, _| Ok(json!({"query": {"tokens": {}}})));
        assert!(matches!(site.token("patrol"), Err(Error::InvalidResponse(_))));
    }

    #[test]
    fn login_posts_credentials_and_records_user() {
        let (mut site, calls) = fake_site_with_config(credentials(), |_, params| {
            if params.first("action") == Some("login") {
                Ok(json!({"login": {"result": "Success", "lguserid": 1, "lgusername": "Bot"}}))
            } else {
                Ok(json!({"query": {"tokens": {"logintoken": "lt+\\"}}}))
            }
        });
        site.login().expect("login");
        assert_eq!(site.user(), Some("Bot"));
        let calls = calls.borrow();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].1.first("type"), Some("login"));
        assert_eq!(calls[1].0, Method::Post);
        assert_eq!(calls[1].1.first("lgtoken"), Some("lt+\\"));
        assert!(calls[1].1.contains_key("lgpassword"));
    }

    #[test]
    fn refused_login_is_an_auth_error() {
        let (mut site, _calls) = fake_site_with_config(credentials(), |_, params| {
            if params.first("action") == Some("login") {
                Ok(json!({"login": {"result": "Failed", "reason": "Incorrect password"}}))
            } else {
                Ok(json!({"query": {"tokens": {"logintoken": "lt+\\"}}}))
            }
        });
        match site.login() {
            Err(Error::Auth { reason }) => assert_eq!(reason, "Incorrect password"),
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(site.user(), None);
    }

    #[test]
    fn login_without_username_fails() {
        let (mut site, calls) = fake_site(|_, _| Ok(json!({})));
        assert!(matches!(site.login(), Err(Error::NoUsername { .. })));
        assert!(calls.borrow().is_empty());
    }

    /// Records the HTTP method and write flag of every send.
    struct Recorder(Rc<RefCell<Vec<(Method, bool)>>>);

    impl Transport for Recorder {
        fn send(&mut self, method: Method, _: &Params, is_write: bool) -> Result<Value> {
            self.0.borrow_mut().push((method, is_write));
            Ok(json!({"batchcomplete": true}))
        }
    }

    #[test]
    fn pacing_follows_write_actions_not_post() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut config = test_config();
        config.http.max_url_length = Some(120);
        let mut site =
            Site::with_transport(config, Box::new(Recorder(Rc::clone(&seen)))).expect("site");

        let titles = (0..40).map(|n| format!("Page {n}")).collect::<Vec<_>>();
        site.submit(params!["action" => "query", "titles" => titles])
            .expect("long read");
        site.submit(params!["action" => "query", "meta" => "siteinfo"])
            .expect("short read");
        site.submit(params!["action" => "edit", "title" => "A", "token" => "t"])
            .expect("write");

        assert_eq!(
            *seen.borrow(),
            vec![
                (Method::Post, false),
                (Method::Get, false),
                (Method::Post, true)
            ]
        );
    }

    #[test]
    fn option_set_loads_schema() {
        let (mut site, _calls) = fake_site(|_, params| {
            let mut count = 0;
            schema_fetch(&mut count, params)
        });
        let mut options = site.option_set("recentchanges", "show").expect("option set");
        assert!(options.is_bound());
        options.set("bot", Some(false)).expect("bot");
        assert!(options.set("minor", Some(true)).is_err());
        assert!(matches!(
            site.option_set("recentchanges", "nosuch"),
            Err(Error::NotFound(_))
        ));
    }
}
