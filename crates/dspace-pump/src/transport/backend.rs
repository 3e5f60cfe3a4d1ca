//! HTTP execution seam and its reqwest implementation.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use super::outcome::{BackendError, RawResponse};
use super::{ApiMethod, ApiRequest, RequestBody, RequestCounters, TransportClient};
use crate::config::{BackendConfig, RetryPolicy};
use crate::error::{MigrateError, Result};
use crate::pool::ClientFactory;

const CSRF_HEADER: &str = "dspace-xsrf-token";
const CSRF_REQUEST_HEADER: &str = "X-XSRF-TOKEN";

/// Sends one request and performs login. No retries at this level.
#[async_trait]
pub trait HttpBackend: Send + Sync {
    async fn send(&self, request: &ApiRequest) -> std::result::Result<RawResponse, BackendError>;

    /// Obtain a fresh session.
    async fn authenticate(&self) -> Result<()>;
}

#[derive(Debug, Default)]
struct Session {
    bearer: Option<String>,
    csrf: Option<String>,
}

/// [`HttpBackend`] over a reqwest client with bearer + CSRF session handling.
pub struct ReqwestBackend {
    client: reqwest::Client,
    config: BackendConfig,
    session: Mutex<Session>,
}

impl ReqwestBackend {
    pub fn new(config: &BackendConfig, policy: &RetryPolicy) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(policy.connect_timeout())
            .timeout(policy.read_timeout())
            .cookie_store(true)
            .build()?;

        Ok(Self {
            client,
            config: config.clone(),
            session: Mutex::new(Session::default()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.endpoint.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn remember_csrf(&self, headers: &reqwest::header::HeaderMap) {
        if let Some(token) = headers.get(CSRF_HEADER).and_then(|v| v.to_str().ok()) {
            if let Ok(mut session) = self.session.lock() {
                session.csrf = Some(token.to_string());
            }
        }
    }

    fn session_headers(&self) -> (Option<String>, Option<String>) {
        match self.session.lock() {
            Ok(session) => (session.bearer.clone(), session.csrf.clone()),
            Err(_) => (None, None),
        }
    }
}

#[async_trait]
impl HttpBackend for ReqwestBackend {
    async fn send(&self, request: &ApiRequest) -> std::result::Result<RawResponse, BackendError> {
        let method = match request.method {
            ApiMethod::Get => reqwest::Method::GET,
            ApiMethod::Post => reqwest::Method::POST,
            ApiMethod::Put => reqwest::Method::PUT,
            ApiMethod::Patch => reqwest::Method::PATCH,
            ApiMethod::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self
            .client
            .request(method, self.url(&request.path))
            .query(&request.params);
        let (bearer, csrf) = self.session_headers();
        if let Some(bearer) = bearer {
            builder = builder.header(reqwest::header::AUTHORIZATION, bearer);
        }
        if let Some(csrf) = csrf {
            builder = builder.header(CSRF_REQUEST_HEADER, csrf);
        }
        match &request.body {
            Some(RequestBody::Json(body)) => builder = builder.json(body),
            Some(RequestBody::UriList(uris)) => {
                builder = builder
                    .header(reqwest::header::CONTENT_TYPE, "text/uri-list")
                    .body(uris.join("\n"))
            }
            None => {}
        }

        let response = builder.send().await?;
        self.remember_csrf(response.headers());

        let status = response.status().as_u16();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response.text().await?;

        Ok(RawResponse {
            status,
            headers,
            body,
        })
    }

    async fn authenticate(&self) -> Result<()> {
        let csrf = self.client.get(self.url("security/csrf")).send().await?;
        self.remember_csrf(csrf.headers());
        let (_, token) = self.session_headers();
        let token = token.ok_or_else(|| {
            MigrateError::connection("no CSRF token in response", self.url("security/csrf"))
        })?;

        let login = self
            .client
            .post(self.url("authn/login"))
            .header(CSRF_REQUEST_HEADER, token)
            .form(&[
                ("user", self.config.user.as_str()),
                ("password", self.config.password.as_str()),
            ])
            .send()
            .await?;
        self.remember_csrf(login.headers());

        if !login.status().is_success() {
            return Err(MigrateError::connection(
                format!("login rejected with status {}", login.status().as_u16()),
                self.url("authn/login"),
            ));
        }
        let bearer = login
            .headers()
            .get(reqwest::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                MigrateError::connection("login response carried no token", self.url("authn/login"))
            })?;

        if let Ok(mut session) = self.session.lock() {
            session.bearer = Some(bearer);
        }
        debug!("Authenticated as {}", self.config.user);
        Ok(())
    }
}

/// Builds authenticated clients that share one set of request counters.
#[derive(Clone)]
pub struct TransportFactory {
    config: BackendConfig,
    policy: RetryPolicy,
    counters: Arc<RequestCounters>,
}

impl TransportFactory {
    pub fn new(config: BackendConfig, policy: RetryPolicy, counters: Arc<RequestCounters>) -> Self {
        Self {
            config,
            policy,
            counters,
        }
    }

    pub fn counters(&self) -> &Arc<RequestCounters> {
        &self.counters
    }

    /// New client with its own HTTP session.
    pub async fn connect(&self) -> Result<TransportClient> {
        let backend = ReqwestBackend::new(&self.config, &self.policy)?;
        if self.config.authenticate {
            backend.authenticate().await?;
            info!("Logged in to {}", self.config.endpoint);
        }
        Ok(TransportClient::new(
            Arc::new(backend),
            self.policy.clone(),
            Arc::clone(&self.counters),
        ))
    }
}

#[async_trait]
impl ClientFactory for TransportFactory {
    type Client = TransportClient;

    async fn create(&self, worker_id: usize) -> Result<TransportClient> {
        debug!("Worker {}: opening API session", worker_id);
        self.connect().await
    }
}
