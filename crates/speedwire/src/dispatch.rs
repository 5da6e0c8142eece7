//! Server-side dispatch: routes invocations to handlers by method name.
//!
//! For every invocation the dispatcher, in order:
//!   1. Applies the method's sliding-window rate limit, if it has one
//!   2. Validates the parameters against the method spec
//!   3. Calls the handler with a clone of the server state, and stores the
//!      state the handler hands back
//!
//! Every invocation is answered: one the handler left pending, or one
//! without a handler, gets `invalid_state`. Handlers run concurrently, so
//! two overlapping invocations may both read the same state and the later
//! write wins.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use speedwire_protocol::RateLimit;
use speedwire_session::{Invocation, Session, SessionEvent};
use tokio::time::Instant;

use crate::{ErrorCode, SpeedwireError};

type Handler<S> =
    Arc<dyn Fn(Invocation, S) -> BoxFuture<'static, Result<Option<S>, SpeedwireError>> + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// RateLimiter
// ---------------------------------------------------------------------------

/// Sliding-window invocation counter, keyed by method name.
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: HashMap<String, VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an invocation of `name` at `now` unless the method already
    /// reached its limit inside the window. Returns whether it is allowed.
    pub fn check(&mut self, name: &str, limit: RateLimit, now: Instant) -> bool {
        let window = self.windows.entry(name.to_string()).or_default();
        while window
            .front()
            .is_some_and(|&t| now.saturating_duration_since(t) > limit.window)
        {
            window.pop_front();
        }

        if window.len() >= limit.max_invocations as usize {
            return false;
        }
        window.push_back(now);
        true
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

struct Inner<S> {
    session: Session,
    state: Mutex<S>,
    limiter: Mutex<RateLimiter>,
    handlers: Mutex<HashMap<String, Handler<S>>>,
}

/// Dispatcher attached to a server-side [`Session`].
///
/// Holds application state of type `S`; each handler gets a clone and may
/// return a replacement.
pub struct Server<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for Server<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> Server<S>
where
    S: Clone + Send + Sync + 'static,
{
    /// Attaches a dispatcher to `session` with an initial state.
    pub fn new(session: Session, state: S) -> Self {
        let inner = Arc::new(Inner {
            session: session.clone(),
            state: Mutex::new(state),
            limiter: Mutex::new(RateLimiter::new()),
            handlers: Mutex::new(HashMap::new()),
        });

        // Released with the session's listeners when it closes.
        let listener = Arc::clone(&inner);
        session.subscribe(move |event| {
            let inner = Arc::clone(&listener);
            async move {
                if let SessionEvent::Invocation(inv) = event {
                    inner.dispatch(inv).await;
                }
            }
        });

        Self { inner }
    }

    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    /// A clone of the current state.
    pub fn state(&self) -> S {
        lock(&self.inner.state).clone()
    }

    pub fn set_state(&self, state: S) {
        *lock(&self.inner.state) = state;
    }

    /// Registers the handler for the method called `name`, replacing any
    /// previous one.
    ///
    /// # Errors
    /// Returns [`SpeedwireError::UnknownMethod`] if the session's SpecSpace
    /// has no such method.
    pub fn on_invocation<F, Fut>(&self, name: &str, callback: F) -> Result<(), SpeedwireError>
    where
        F: Fn(Invocation, S) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<S>, SpeedwireError>> + Send + 'static,
    {
        if self.inner.session.spec_space().method_spec(name).is_none() {
            return Err(SpeedwireError::UnknownMethod(name.to_string()));
        }
        let handler: Handler<S> = Arc::new(move |inv, state| callback(inv, state).boxed());
        lock(&self.inner.handlers).insert(name.to_string(), handler);
        tracing::debug!(session = %self.inner.session.id(), method = name, "handler registered");
        Ok(())
    }
}

impl<S> Inner<S>
where
    S: Clone + Send + Sync + 'static,
{
    async fn dispatch(&self, inv: Invocation) {
        let name = inv.name().to_string();
        let Some(handler) = lock(&self.handlers).get(&name).cloned() else {
            tracing::warn!(session = %self.session.id(), method = %name, "no handler for invocation");
            self.reject(&inv, ErrorCode::InvalidState, ErrorCode::InvalidState.message())
                .await;
            return;
        };

        if let Some(limit) = inv.method.spec.rate_limit {
            let allowed = lock(&self.limiter).check(&name, limit, Instant::now());
            if !allowed {
                tracing::debug!(session = %self.session.id(), method = %name, "invocation rate limited");
                self.reject(&inv, ErrorCode::RateLimit, ErrorCode::RateLimit.message())
                    .await;
                return;
            }
        }

        if let Some(detail) = inv.method.find_error() {
            tracing::debug!(session = %self.session.id(), method = %name, %detail, "invalid parameters");
            let message = format!("{}: {detail}", ErrorCode::ValidationFailed.message());
            self.reject(&inv, ErrorCode::ValidationFailed, &message).await;
            return;
        }

        let state = lock(&self.state).clone();
        match handler(inv.clone(), state).await {
            Ok(new_state) => {
                if let Some(new_state) = new_state {
                    *lock(&self.state) = new_state;
                }
                if inv.is_pending() {
                    tracing::warn!(session = %self.session.id(), method = %name, "handler returned without answering");
                    self.reject(&inv, ErrorCode::InvalidState, ErrorCode::InvalidState.message())
                        .await;
                }
            }
            Err(SpeedwireError::Rejected { code, message }) => {
                self.reject(&inv, code, &message).await;
            }
            Err(e) => {
                tracing::warn!(session = %self.session.id(), method = %name, error = %e, "handler failed");
                if inv.is_pending() {
                    self.reject(&inv, ErrorCode::InvalidState, ErrorCode::InvalidState.message())
                        .await;
                }
            }
        }
    }

    async fn reject(&self, inv: &Invocation, code: ErrorCode, message: &str) {
        if let Err(e) = inv.error(code.code(), message).await {
            tracing::debug!(session = %self.session.id(), error = %e, "failed to send method error");
        }
    }
}
