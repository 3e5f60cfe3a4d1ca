//! Resilient client for the destination REST API.
//!
//! Every call goes through one retry loop:
//!
//! 1. The circuit breaker is consulted; an open breaker fails fast.
//! 2. The attempt is counted and sent through the [`HttpBackend`].
//! 3. The result is reduced to an [`Outcome`] by [`classify`].
//! 4. Retryable outcomes back off exponentially, an expired session is
//!    re-established once, and anything else ends the call.

mod backend;
mod breaker;
mod counters;
mod outcome;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{HttpBackend, ReqwestBackend, TransportFactory};
pub use breaker::{BreakerState, CircuitBreaker};
pub use counters::{RequestCounters, RequestTally};
pub use outcome::{
    classify, sanitize_snippet, BackendError, BackendErrorKind, FailureReason, Outcome,
    RawResponse, RetryClass, TransportFailure, MAX_SNIPPET_CHARS, RETRYABLE_STATUSES,
};

use crate::config::RetryPolicy;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// HTTP verbs used against the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl fmt::Display for ApiMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ApiMethod::Get => "GET",
            ApiMethod::Post => "POST",
            ApiMethod::Put => "PUT",
            ApiMethod::Patch => "PATCH",
            ApiMethod::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

/// Request payload.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Json(Value),
    /// `text/uri-list`, one absolute URL per line.
    UriList(Vec<String>),
}

/// One logical API call: a path relative to the endpoint, query parameters
/// and an optional body.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: ApiMethod,
    pub path: String,
    pub params: Vec<(String, String)>,
    pub body: Option<RequestBody>,
}

impl ApiRequest {
    pub fn new(method: ApiMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            params: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(ApiMethod::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(ApiMethod::Post, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(ApiMethod::Put, path)
    }

    /// Add a query parameter.
    pub fn param(mut self, key: &str, value: impl ToString) -> Self {
        self.params.push((key.to_string(), value.to_string()));
        self
    }

    /// Add a query parameter when the value is present.
    pub fn param_opt<T: ToString>(self, key: &str, value: Option<T>) -> Self {
        match value {
            Some(value) => self.param(key, value),
            None => self,
        }
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(RequestBody::Json(body));
        self
    }

    pub fn uri_list(mut self, uris: Vec<String>) -> Self {
        self.body = Some(RequestBody::UriList(uris));
        self
    }

    pub fn json_body(&self) -> Option<&Value> {
        match &self.body {
            Some(RequestBody::Json(value)) => Some(value),
            _ => None,
        }
    }

    pub fn param_value(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// A successful response.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    /// Parsed body; `None` for empty or non-JSON bodies.
    pub body: Option<Value>,
}

impl Response {
    fn from_raw(raw: RawResponse) -> Self {
        let body = if raw.body.trim().is_empty() {
            None
        } else {
            serde_json::from_str(&raw.body).ok()
        };
        Self {
            status: raw.status,
            headers: raw.headers,
            body,
        }
    }

    /// String form of a top-level body field (numbers are stringified).
    pub fn field(&self, name: &str) -> Option<String> {
        match self.body.as_ref()?.get(name)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// The destination-assigned identifier (`id`, falling back to `uuid`).
    pub fn id(&self) -> Option<String> {
        self.field("id").or_else(|| self.field("uuid"))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Resilient API client. Cheap to share behind an `Arc`; each pool worker
/// nevertheless owns its own instance so sessions are not contended.
pub struct TransportClient {
    backend: Arc<dyn HttpBackend>,
    policy: RetryPolicy,
    breaker: Mutex<CircuitBreaker>,
    counters: Arc<RequestCounters>,
}

impl TransportClient {
    pub fn new(
        backend: Arc<dyn HttpBackend>,
        policy: RetryPolicy,
        counters: Arc<RequestCounters>,
    ) -> Self {
        let breaker = CircuitBreaker::new(policy.breaker_threshold, policy.breaker_cooldown());
        Self {
            backend,
            policy,
            breaker: Mutex::new(breaker),
            counters,
        }
    }

    pub fn counters(&self) -> &Arc<RequestCounters> {
        &self.counters
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.with_breaker(|b| b.state())
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.with_breaker(|b| b.consecutive_failures())
    }

    fn with_breaker<T>(&self, f: impl FnOnce(&mut CircuitBreaker) -> T) -> T {
        // A poisoned lock only means another thread panicked mid-update;
        // the breaker state is still usable.
        let mut guard = match self.breaker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Execute a request with retries, backoff, breaker and re-authentication.
    pub async fn call(&self, request: &ApiRequest) -> Result<Response, TransportFailure> {
        let mut reauthenticated = false;
        let mut last_status = None;
        let mut last_body = String::new();
        // A re-authentication on the last attempt earns one more try.
        let mut max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        while attempt < max_attempts {
            if !self.with_breaker(|b| b.try_acquire(Instant::now())) {
                warn!(
                    "{} {}: circuit breaker open, failing fast",
                    request.method, request.path
                );
                return Err(self.failure(
                    request,
                    FailureReason::CircuitOpen,
                    attempt,
                    last_status,
                    &last_body,
                ));
            }

            self.counters.record(request.method);
            let outcome = classify(self.backend.send(request).await);

            match &outcome {
                Outcome::RetryableFailure {
                    class: RetryClass::ServerError,
                    ..
                } => self.with_breaker(|b| b.record_server_error(Instant::now())),
                Outcome::RetryableFailure {
                    class: RetryClass::Transport,
                    ..
                } => self.with_breaker(|b| b.record_no_response(Instant::now())),
                _ => self.with_breaker(|b| b.record_response()),
            }

            match outcome {
                Outcome::Success(raw) => {
                    debug!("{} {} -> {}", request.method, request.path, raw.status);
                    return Ok(Response::from_raw(raw));
                }
                Outcome::TerminalFailure { status, body } => {
                    let failure = self.failure(
                        request,
                        FailureReason::Terminal,
                        attempt + 1,
                        Some(status),
                        &body,
                    );
                    if status != 409 {
                        error!("{}", failure);
                    }
                    return Err(failure);
                }
                Outcome::AuthExpired { status, body } => {
                    if reauthenticated {
                        let failure = self.failure(
                            request,
                            FailureReason::Terminal,
                            attempt + 1,
                            Some(status),
                            &body,
                        );
                        error!("{}", failure);
                        return Err(failure);
                    }
                    warn!(
                        "{} {}: status {}, re-authenticating",
                        request.method, request.path, status
                    );
                    if let Err(e) = self.backend.authenticate().await {
                        let failure = self.failure(
                            request,
                            FailureReason::AuthRejected,
                            attempt + 1,
                            Some(status),
                            &e.to_string(),
                        );
                        error!("{}", failure);
                        return Err(failure);
                    }
                    reauthenticated = true;
                    last_status = Some(status);
                    last_body = body;
                    if attempt + 1 == max_attempts {
                        max_attempts += 1;
                    }
                }
                Outcome::RetryableFailure {
                    class,
                    status,
                    body,
                } => {
                    last_status = status;
                    last_body = body;
                    if attempt + 1 < max_attempts {
                        let delay = self.policy.backoff(attempt);
                        warn!(
                            "{} {}: {} (status {:?}), retry {}/{} in {:?}",
                            request.method,
                            request.path,
                            class,
                            status,
                            attempt + 1,
                            max_attempts - 1,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
            attempt += 1;
        }

        let failure = self.failure(
            request,
            FailureReason::Exhausted,
            max_attempts,
            last_status,
            &last_body,
        );
        error!("{}", failure);
        Err(failure)
    }

    fn failure(
        &self,
        request: &ApiRequest,
        reason: FailureReason,
        attempts: u32,
        status: Option<u16>,
        body: &str,
    ) -> TransportFailure {
        TransportFailure {
            method: request.method.to_string(),
            endpoint: request.path.clone(),
            reason,
            attempts,
            status,
            snippet: sanitize_snippet(body),
        }
    }

    pub async fn get(&self, path: &str) -> Result<Response, TransportFailure> {
        self.call(&ApiRequest::get(path)).await
    }

    /// Read every page of a paginated collection resource.
    pub async fn fetch_all_pages(
        &self,
        path: &str,
        embedded_key: &str,
        page_size: usize,
    ) -> Result<Vec<Value>, TransportFailure> {
        let mut objects = Vec::new();
        let mut page = 0usize;
        loop {
            let request = ApiRequest::get(path)
                .param("page", page)
                .param("size", page_size);
            let response = self.call(&request).await?;
            let body = response.body.unwrap_or(Value::Null);

            if let Some(items) = body
                .get("_embedded")
                .and_then(|e| e.get(embedded_key))
                .and_then(Value::as_array)
            {
                objects.extend(items.iter().cloned());
            }

            let total_pages = body
                .get("page")
                .and_then(|p| p.get("totalPages"))
                .and_then(Value::as_u64)
                .unwrap_or(0) as usize;
            page += 1;
            if page >= total_pages {
                break;
            }
        }
        Ok(objects)
    }
}
