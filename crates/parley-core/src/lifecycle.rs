//! Agent lifecycle manager.
//!
//! Decides whether a session is usable and owns session creation and resume.
//!
//! ```text
//! Uninitialized --start/resume--> Initializing --ok--> Initialized
//!                                      |--provider missing--> NoProvider
//!                                      `--other failure-----> Error
//! Initialized --start/resume(same id)--> (snapshot refetch, no Initializing)
//! any --reset--> Uninitialized
//! ```
//!
//! `NoProvider` and `Error` stay put until [`AgentLifecycle::reset`].
//! At most one start/resume call is outstanding: concurrent callers await
//! the same shared future.

use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use parley_types::{ServiceError, ServiceErrorKind, Session};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::client::{ServiceResult, SessionService};
use crate::config::AgentConfig;
use crate::config_store::ConfigStore;
use crate::error::{CoreError, CoreResult};
use crate::recovery::ensure_config_ready;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Uninitialized,
    Initializing,
    NoProvider,
    Initialized,
    Error,
}

/// What a caller asked the lifecycle to load.
#[derive(Debug, Clone)]
pub enum LoadRequest {
    Start {
        working_dir: PathBuf,
        recipe: Option<Value>,
    },
    Resume {
        session_id: String,
    },
}

type SharedLoad = Shared<BoxFuture<'static, CoreResult<Session>>>;

struct InFlight {
    epoch: u64,
    future: SharedLoad,
}

struct Inner {
    state: AgentState,
    session_id: Option<String>,
    last_error: Option<CoreError>,
    in_flight: Option<InFlight>,
    /// Bumped by reset; results from older epochs are discarded.
    epoch: u64,
    config_ready: bool,
}

/// Everything a load needs, detached from `&self` so the future is `'static`.
#[derive(Clone)]
struct Loader {
    service: Arc<dyn SessionService>,
    store: Option<Arc<dyn ConfigStore>>,
    agent: AgentConfig,
}

pub struct AgentLifecycle {
    loader: Loader,
    inner: Arc<Mutex<Inner>>,
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

fn classify(err: ServiceError) -> CoreError {
    if err.is_provider_missing() {
        return CoreError::ProviderNotConfigured(err.message);
    }
    match err.kind {
        ServiceErrorKind::Parse => CoreError::MalformedSession(err.message),
        _ => CoreError::AgentInit(err.message),
    }
}

/// Reads a non-blank string setting from the store.
async fn read_setting(store: &dyn ConfigStore, key: &str) -> CoreResult<Option<String>> {
    let value = store
        .read(key, false)
        .await
        .map_err(|e| CoreError::config(&e))?;
    Ok(value
        .as_ref()
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string))
}

/// Retries transient failures with a fixed delay.
async fn retry_transient<T, F, Fut>(agent: &AgentConfig, what: &str, mut op: F) -> ServiceResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ServiceResult<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(err) if err.is_transient() && attempt < agent.init_retries => {
                attempt += 1;
                warn!(what, attempt, error = %err, "transient failure, retrying");
                tokio::time::sleep(agent.retry_delay()).await;
            }
            result => return result,
        }
    }
}

impl Loader {
    async fn prepare_config(&self) -> CoreResult<()> {
        if let Some(store) = &self.store {
            let outcome = ensure_config_ready(store.as_ref()).await?;
            info!(%outcome, "configuration checked");
        }
        Ok(())
    }

    /// Provider and model as currently persisted. Without a store, the
    /// settings the lifecycle was built with are used.
    async fn provider_and_model(&self) -> CoreResult<Option<(String, String)>> {
        let Some(store) = &self.store else {
            return Ok(self
                .agent
                .provider_and_model()
                .map(|(provider, model)| (provider.to_string(), model.to_string())));
        };
        let provider = read_setting(store.as_ref(), "agent.provider").await?;
        let model = read_setting(store.as_ref(), "agent.model").await?;
        Ok(provider.zip(model))
    }

    /// Full initialization: provider check, start/resume, provider push,
    /// prompt extension.
    async fn initialize(self, request: LoadRequest, check_config: bool) -> CoreResult<Session> {
        if check_config {
            self.prepare_config().await?;
        }

        let Some((provider, model)) = self.provider_and_model().await? else {
            return Err(CoreError::ProviderNotConfigured(
                "agent.provider and agent.model must be set".to_string(),
            ));
        };

        let service = self.service.as_ref();
        let session = match &request {
            LoadRequest::Start {
                working_dir,
                recipe,
            } => {
                retry_transient(&self.agent, "start", || {
                    service.start(working_dir, recipe.as_ref())
                })
                .await
            }
            LoadRequest::Resume { session_id } => {
                retry_transient(&self.agent, "resume", || service.resume(session_id)).await
            }
        }
        .map_err(classify)?;
        validate_session(&session)?;

        retry_transient(&self.agent, "update_provider", || {
            service.update_agent_provider(&session.id, &provider, Some(model.as_str()))
        })
        .await
        .map_err(classify)?;

        if let Some(extra) = self.agent.extra_prompt.as_deref().filter(|p| !p.is_empty()) {
            retry_transient(&self.agent, "extend_prompt", || {
                service.extend_prompt(&session.id, extra)
            })
            .await
            .map_err(classify)?;
        }

        Ok(session)
    }

    /// Snapshot refetch for an already initialized session.
    async fn refresh(self, session_id: String) -> CoreResult<Session> {
        let service = self.service.as_ref();
        let session = retry_transient(&self.agent, "resume", || service.resume(&session_id))
            .await
            .map_err(classify)?;
        validate_session(&session)?;
        Ok(session)
    }
}

fn validate_session(session: &Session) -> CoreResult<()> {
    if session.id.trim().is_empty() {
        return Err(CoreError::MalformedSession(
            "session payload has an empty id".to_string(),
        ));
    }
    Ok(())
}

impl AgentLifecycle {
    pub fn new(service: Arc<dyn SessionService>, agent: AgentConfig) -> Self {
        Self {
            loader: Loader {
                service,
                store: None,
                agent,
            },
            inner: Arc::new(Mutex::new(Inner {
                state: AgentState::Uninitialized,
                session_id: None,
                last_error: None,
                in_flight: None,
                epoch: 0,
                config_ready: false,
            })),
        }
    }

    /// Runs the config recovery chain once before the first session call.
    #[must_use]
    pub fn with_config_store(mut self, store: Arc<dyn ConfigStore>) -> Self {
        self.loader.store = Some(store);
        self
    }

    pub fn state(&self) -> AgentState {
        lock(&self.inner).state
    }

    pub fn session_id(&self) -> Option<String> {
        lock(&self.inner).session_id.clone()
    }

    pub fn last_error(&self) -> Option<CoreError> {
        lock(&self.inner).last_error.clone()
    }

    pub async fn start(
        &self,
        working_dir: impl Into<PathBuf>,
        recipe: Option<Value>,
    ) -> CoreResult<Session> {
        self.load(LoadRequest::Start {
            working_dir: working_dir.into(),
            recipe,
        })
        .await
    }

    pub async fn resume(&self, session_id: impl Into<String>) -> CoreResult<Session> {
        self.load(LoadRequest::Resume {
            session_id: session_id.into(),
        })
        .await
    }

    /// Starts or resumes, sharing any load already in flight.
    pub async fn load(&self, request: LoadRequest) -> CoreResult<Session> {
        let future = self.acquire(request)?;
        future.await
    }

    /// Returns to `Uninitialized` and forgets the session. Settings are
    /// re-read and the config checked again on the next load.
    ///
    /// A load still in flight finishes for its existing awaiters but no
    /// longer updates state; the next load waits for it before calling the
    /// service.
    pub fn reset(&self) {
        let mut inner = lock(&self.inner);
        inner.epoch += 1;
        inner.state = AgentState::Uninitialized;
        inner.session_id = None;
        inner.last_error = None;
        inner.config_ready = false;
        info!(epoch = inner.epoch, "agent lifecycle reset");
    }

    fn acquire(&self, request: LoadRequest) -> CoreResult<SharedLoad> {
        let mut inner = lock(&self.inner);

        let stale = match &inner.in_flight {
            Some(in_flight) if in_flight.epoch == inner.epoch => {
                debug!("joining in-flight session load");
                return Ok(in_flight.future.clone());
            }
            Some(in_flight) => Some(in_flight.future.clone()),
            None => None,
        };

        let loader = self.loader.clone();
        let future: BoxFuture<'static, CoreResult<Session>> = match inner.state {
            AgentState::NoProvider => {
                return Err(inner.last_error.clone().unwrap_or_else(|| {
                    CoreError::ProviderNotConfigured("provider setup required".to_string())
                }));
            }
            AgentState::Error => {
                return Err(inner
                    .last_error
                    .clone()
                    .unwrap_or_else(|| CoreError::AgentInit("agent is in error state".into())));
            }
            AgentState::Initialized => {
                let switching = match (&request, &inner.session_id) {
                    (LoadRequest::Resume { session_id }, Some(current)) => session_id != current,
                    (_, None) => true,
                    (_, Some(_)) => false,
                };
                if switching {
                    info!(?request, "loading a different session");
                    inner.state = AgentState::Initializing;
                    loader.initialize(request, false).boxed()
                } else {
                    let current = inner.session_id.clone().unwrap_or_default();
                    debug!(session_id = %current, "refetching initialized session");
                    loader.refresh(current).boxed()
                }
            }
            AgentState::Uninitialized | AgentState::Initializing => {
                let check_config = !inner.config_ready;
                inner.state = AgentState::Initializing;
                info!(?request, "initializing agent");
                loader.initialize(request, check_config).boxed()
            }
        };

        let future = match stale {
            Some(previous) => async move {
                debug!("waiting for load started before reset");
                let _ = previous.await;
                future.await
            }
            .boxed(),
            None => future,
        };

        let epoch = inner.epoch;
        let shared = Self::settle(Arc::clone(&self.inner), epoch, future)
            .boxed()
            .shared();
        inner.in_flight = Some(InFlight {
            epoch,
            future: shared.clone(),
        });
        Ok(shared)
    }

    /// Wraps a load so its outcome is applied to the state exactly once,
    /// unless a reset happened in between.
    async fn settle(
        inner: Arc<Mutex<Inner>>,
        epoch: u64,
        load: BoxFuture<'static, CoreResult<Session>>,
    ) -> CoreResult<Session> {
        let result = load.await;

        let mut guard = lock(&inner);
        if guard.in_flight.as_ref().is_some_and(|f| f.epoch == epoch) {
            guard.in_flight = None;
        }
        if guard.epoch != epoch {
            debug!(epoch, current = guard.epoch, "discarding stale session load");
            return result;
        }

        match &result {
            Ok(session) => {
                guard.state = AgentState::Initialized;
                guard.session_id = Some(session.id.clone());
                guard.last_error = None;
                guard.config_ready = true;
                info!(session_id = %session.id, "agent initialized");
            }
            Err(err @ CoreError::ProviderNotConfigured(_)) => {
                guard.state = AgentState::NoProvider;
                guard.last_error = Some(err.clone());
                guard.config_ready = true;
                warn!(error = %err, "agent has no provider configured");
            }
            Err(err) if guard.state == AgentState::Initialized && !err.is_fatal() => {
                warn!(error = %err, "session refetch failed");
            }
            Err(err) => {
                guard.state = AgentState::Error;
                guard.last_error = Some(err.clone());
                warn!(error = %err, "agent initialization failed");
            }
        }
        result
    }
}
