use std::fmt;
use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use reqwest::blocking::Client;
use reqwest::{StatusCode, Url};
use serde_json::Value;

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::params::Params;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sends one fully built parameter set and returns the decoded JSON body.
///
/// Implementations deal with HTTP only; a payload carrying an API `error`
/// object is still returned as `Ok`. `is_write` selects write pacing and is
/// independent of `method`: reads may be posted too.
pub trait Transport {
    fn send(&mut self, method: Method, params: &Params, is_write: bool) -> Result<Value>;

    fn request_count(&self) -> usize {
        0
    }
}

impl<F> Transport for F
where
    F: FnMut(Method, &Params) -> Result<Value>,
{
    fn send(&mut self, method: Method, params: &Params, _is_write: bool) -> Result<Value> {
        self(method, params)
    }
}

/// Blocking `reqwest` transport with cookies, pacing and retry on transient HTTP failures.
pub struct HttpTransport {
    client: Client,
    api_url: Url,
    user_agent: String,
    max_retries: usize,
    retry_delay: Duration,
    rate_limit_read: Duration,
    rate_limit_write: Duration,
    last_request_at: Option<Instant>,
    request_count: usize,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let api_url = config.api_url()?;
        let api_url = Url::parse(&api_url)
            .map_err(|e| Error::Config(format!("invalid WIKI_API_URL {api_url}: {e}")))?;
        let client = Client::builder()
            .timeout(config.timeout())
            .cookie_store(true)
            .build()?;

        Ok(Self {
            client,
            api_url,
            user_agent: config.user_agent(),
            max_retries: config.max_retries(),
            retry_delay: config.retry_delay(),
            rate_limit_read: config.rate_limit(false),
            rate_limit_write: config.rate_limit(true),
            last_request_at: None,
            request_count: 0,
        })
    }

    pub fn api_url(&self) -> &Url {
        &self.api_url
    }

    fn apply_rate_limit(&mut self, is_write: bool) {
        let delay = if is_write {
            self.rate_limit_write
        } else {
            self.rate_limit_read
        };
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }

    fn wait_before_retry(&self, attempt: usize, is_write: bool) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .retry_delay
            .saturating_mul(2u32.saturating_pow(exponent));
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        let multiplier = if is_write { 2 } else { 1 };
        sleep(
            base.saturating_mul(multiplier)
                .saturating_add(Duration::from_millis(jitter)),
        );
    }
}

impl Transport for HttpTransport {
    fn send(&mut self, method: Method, params: &Params, is_write: bool) -> Result<Value> {
        let pairs = params.pairs();

        for attempt in 0..=self.max_retries {
            self.apply_rate_limit(is_write);
            let request = match method {
                Method::Get => self.client.get(self.api_url.clone()).query(&pairs),
                Method::Post => self.client.post(self.api_url.clone()).form(&pairs),
            };
            let response = request
                .header("User-Agent", self.user_agent.clone())
                .send();

            match response {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        if attempt < self.max_retries && is_retryable_status(status) {
                            log::warn!("HTTP {status} from {}, retrying", self.api_url);
                            self.wait_before_retry(attempt, is_write);
                            continue;
                        }
                        return Err(Error::Status(status));
                    }
                    return Ok(response.json()?);
                }
                Err(error) => {
                    if attempt < self.max_retries && is_retryable_error(&error) {
                        log::warn!("request to {} failed ({error}), retrying", self.api_url);
                        self.wait_before_retry(attempt, is_write);
                        continue;
                    }
                    return Err(error.into());
                }
            }
        }

        Err(Error::InvalidResponse(
            "MediaWiki API request exhausted retry budget".into(),
        ))
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}
