use std::thread::sleep;
use std::time::Duration;

use serde_json::Value;

use crate::error::{ApiErrorKind, Error, Result};
use crate::params::Params;
use crate::site::Site;
use crate::transport::Method;

/// Actions that change wiki state and always go out as POST.
pub const WRITE_ACTIONS: &[&str] = &[
    "block",
    "changecontentmodel",
    "createaccount",
    "delete",
    "edit",
    "emailuser",
    "filerevert",
    "import",
    "login",
    "logout",
    "managetags",
    "mergehistory",
    "move",
    "options",
    "patrol",
    "protect",
    "purge",
    "rollback",
    "setnotificationtimestamp",
    "tag",
    "unblock",
    "undelete",
    "upload",
    "userrights",
    "watch",
];

/// Source of query responses for the registry and the paginated generators.
pub trait QueryFetch {
    fn fetch(&mut self, params: &Params) -> Result<Value>;
}

impl<F> QueryFetch for F
where
    F: FnMut(&Params) -> Result<Value>,
{
    fn fetch(&mut self, params: &Params) -> Result<Value> {
        self(params)
    }
}

/// One API call: the parameters plus the rules to send it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    params: Params,
    force_post: bool,
}

impl Request {
    pub fn new(params: Params) -> Self {
        Self {
            params,
            force_post: false,
        }
    }

    pub fn post(mut self) -> Self {
        self.force_post = true;
        self
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut Params {
        &mut self.params
    }

    pub fn action(&self) -> Option<&str> {
        self.params.first("action")
    }

    pub fn is_write(&self) -> bool {
        is_write(&self.params)
    }

    /// POST for writes, token-carrying or `mustbeposted` modules and over-long URLs.
    pub fn method(&self, site: &Site) -> Method {
        if self.force_post {
            return Method::Post;
        }
        choose_method(&self.params, site)
    }

    /// Rejects parameter names the target modules do not declare.
    pub fn validate(&self, site: &mut Site) -> Result<()> {
        let action = self.require_action()?;
        let allowed = site.with_paraminfo(|paraminfo, api| {
            paraminfo.allowed_parameters(api, &self.params)
        })?;
        let unknown = self
            .params
            .keys()
            .filter(|key| !allowed.contains(*key))
            .collect::<Vec<_>>();
        if unknown.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(format!(
                "unknown parameters for action={action}: {}",
                unknown.join(", ")
            )))
        }
    }

    /// Sends the request, refreshing a bad token, logging in lazily and waiting out
    /// replication lag as the site's retry policy allows.
    pub fn submit(&self, site: &mut Site) -> Result<Value> {
        let action = self.require_action()?.to_string();
        if site.config().strict_params {
            self.validate(site)?;
        }

        let policy = site.retry_policy();
        let mut attempts = RetryAttempts::default();
        let mut params = self.params.clone();
        loop {
            let method = if self.force_post {
                Method::Post
            } else {
                choose_method(&params, site)
            };
            let mut wire = params.clone();
            if is_write(&params)
                && !wire.contains_key("maxlag")
                && let Some(maxlag) = site.config().maxlag()
            {
                wire.insert("maxlag", maxlag);
            }
            log::debug!(
                "{method} action={action} [{}]",
                params.keys().collect::<Vec<_>>().join(",")
            );

            let payload = site.send_raw(method, &wire)?;
            let Some(error_body) = payload.get("error") else {
                log_warnings(&payload);
                return Ok(payload);
            };
            let error = Error::from_api_error(error_body);
            match policy.decide(&error, &mut attempts) {
                RetryAction::RefreshToken => {
                    let (kind, param) = token_slot(&params);
                    log::warn!("action={action}: bad {kind} token, fetching a new one");
                    site.invalidate_token(kind);
                    let token = site.token(kind)?;
                    params.insert(param, token);
                }
                RetryAction::Login => {
                    log::warn!("action={action}: {error}; logging in");
                    site.login()?;
                }
                RetryAction::WaitForLag => {
                    let lag = lag_seconds(error_body);
                    log::warn!("action={action}: server lagged {lag}s, waiting");
                    sleep(Duration::from_secs(lag.max(1)));
                }
                RetryAction::GiveUp => {
                    if error.kind() == ApiErrorKind::MaxLag {
                        return Err(Error::MaxLag {
                            attempts: attempts.max_lag + 1,
                            lag: lag_seconds(error_body),
                        });
                    }
                    return Err(error);
                }
            }
        }
    }

    fn require_action(&self) -> Result<&str> {
        self.action()
            .ok_or_else(|| Error::Validation("missing action parameter".into()))
    }
}

/// Bounded retries per error class; anything not listed fails immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub bad_token_retries: usize,
    pub login_retries: usize,
    pub max_lag_retries: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            bad_token_retries: 1,
            login_retries: 1,
            max_lag_retries: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryAttempts {
    pub bad_token: usize,
    pub login: usize,
    pub max_lag: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    RefreshToken,
    Login,
    WaitForLag,
    GiveUp,
}

impl RetryPolicy {
    pub fn decide(&self, error: &Error, attempts: &mut RetryAttempts) -> RetryAction {
        let (used, budget, action) = match error.kind() {
            ApiErrorKind::BadToken => (
                &mut attempts.bad_token,
                self.bad_token_retries,
                RetryAction::RefreshToken,
            ),
            ApiErrorKind::LoginRequired => {
                (&mut attempts.login, self.login_retries, RetryAction::Login)
            }
            ApiErrorKind::MaxLag => (
                &mut attempts.max_lag,
                self.max_lag_retries,
                RetryAction::WaitForLag,
            ),
            ApiErrorKind::Internal | ApiErrorKind::Fatal => return RetryAction::GiveUp,
        };
        if *used < budget {
            *used += 1;
            action
        } else {
            RetryAction::GiveUp
        }
    }
}

pub(crate) fn is_write(params: &Params) -> bool {
    params.contains_key("token")
        || params
            .first("action")
            .is_some_and(|action| WRITE_ACTIONS.contains(&action))
}

fn choose_method(params: &Params, site: &Site) -> Method {
    let posted = params
        .first("action")
        .and_then(|action| site.paraminfo().must_be_posted(action))
        .unwrap_or(false);
    if posted || is_write(params) || url_length(params, site) > site.config().max_url_length() {
        Method::Post
    } else {
        Method::Get
    }
}

/// Length of the GET URL including the parameters added on the wire.
pub(crate) fn url_length(params: &Params, site: &Site) -> usize {
    site.api_url().len() + "?format=json&formatversion=2&".len() + params.encode().len()
}

/// Token type and parameter to refresh after a `badtoken` error.
fn token_slot(params: &Params) -> (&'static str, &'static str) {
    if params.contains_key("lgtoken") {
        ("login", "lgtoken")
    } else {
        ("csrf", "token")
    }
}

fn lag_seconds(error: &Value) -> u64 {
    error
        .get("lag")
        .and_then(Value::as_f64)
        .map(|lag| lag.max(0.0).ceil() as u64)
        .unwrap_or(1)
}

pub(crate) fn check_response(payload: Value) -> Result<Value> {
    if let Some(error) = payload.get("error") {
        return Err(Error::from_api_error(error));
    }
    log_warnings(&payload);
    Ok(payload)
}

fn log_warnings(payload: &Value) {
    let Some(warnings) = payload.get("warnings").and_then(Value::as_object) else {
        return;
    };
    for (module, warning) in warnings {
        match warning.get("warnings").and_then(Value::as_str) {
            Some(text) => log::warn!("API warning from {module}: {text}"),
            None => log::warn!("API warning from {module}: {warning}"),
        }
    }
}
