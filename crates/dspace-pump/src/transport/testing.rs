//! In-memory [`HttpBackend`] for tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{
    ApiRequest, BackendError, BackendErrorKind, HttpBackend, RawResponse, RequestCounters,
    TransportClient,
};
use crate::config::RetryPolicy;
use crate::error::{MigrateError, Result};
use crate::pool::ClientFactory;

pub(crate) type Reply = std::result::Result<RawResponse, BackendError>;
type Handler = Box<dyn Fn(&ApiRequest) -> Reply + Send + Sync>;

pub(crate) struct FakeBackend {
    script: Mutex<VecDeque<Reply>>,
    handler: Option<Handler>,
    requests: Mutex<Vec<ApiRequest>>,
    calls: AtomicUsize,
    auth_calls: AtomicUsize,
    reject_logins: AtomicBool,
}

impl FakeBackend {
    /// Replies are returned in order, one per request.
    pub(crate) fn scripted(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(replies.into()),
            handler: None,
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            auth_calls: AtomicUsize::new(0),
            reject_logins: AtomicBool::new(false),
        })
    }

    /// Every request is answered by `handler`.
    pub(crate) fn with_handler(
        handler: impl Fn(&ApiRequest) -> Reply + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            handler: Some(Box::new(handler)),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            auth_calls: AtomicUsize::new(0),
            reject_logins: AtomicBool::new(false),
        })
    }

    pub(crate) fn reject_logins(&self) {
        self.reject_logins.store(true, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn auth_calls(&self) -> usize {
        self.auth_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpBackend for FakeBackend {
    async fn send(&self, request: &ApiRequest) -> Reply {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        if let Some(handler) = &self.handler {
            return handler(request);
        }
        self.script.lock().unwrap().pop_front().unwrap_or_else(|| {
            Err(BackendError::new(
                BackendErrorKind::Other,
                "no scripted response left",
            ))
        })
    }

    async fn authenticate(&self) -> Result<()> {
        self.auth_calls.fetch_add(1, Ordering::SeqCst);
        if self.reject_logins.load(Ordering::SeqCst) {
            return Err(MigrateError::connection("login rejected", "authn/login"));
        }
        Ok(())
    }
}

/// One attempt per call and no breaker, so scripted failures surface at once.
pub(crate) fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 1,
        base_delay_ms: 1,
        breaker_threshold: 1_000,
        ..RetryPolicy::default()
    }
}

pub(crate) fn client_for(backend: &Arc<FakeBackend>, counters: &Arc<RequestCounters>) -> TransportClient {
    TransportClient::new(
        Arc::clone(backend) as Arc<dyn HttpBackend>,
        fast_policy(),
        Arc::clone(counters),
    )
}

/// Pool clients that all talk to the same [`FakeBackend`].
pub(crate) struct FakeFactory {
    pub(crate) backend: Arc<FakeBackend>,
    pub(crate) counters: Arc<RequestCounters>,
}

#[async_trait]
impl ClientFactory for FakeFactory {
    type Client = TransportClient;

    async fn create(&self, _worker_id: usize) -> Result<TransportClient> {
        Ok(client_for(&self.backend, &self.counters))
    }
}
