//! The session: one peer's view of a connection.
//!
//! A session owns three tasks. The reader task decodes incoming segments in
//! arrival order and routes each one either to the open transaction that
//! awaits it or to the event bus. The listener task starts listeners on
//! events in the order they arrived. The writer actor (see
//! [`crate::writer`]) owns the write half. Everything else goes through
//! [`Session`], a cheap cloneable handle.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::{join_all, BoxFuture};
use futures_util::stream::FuturesUnordered;
use futures_util::{FutureExt, StreamExt};
use speedwire_protocol::{
    Confirmation, ConfirmationSpec, Entity, FieldValue, Method, MethodSpec, PeerRole,
    ProtocolError, Segment, SegmentBody, SegmentContext, SpecSpace,
};
use speedwire_transport::{ConnectionId, Readable, Writable};
use tokio::sync::{mpsc, watch};

use crate::event::{ConfirmationRequest, Invocation, SessionEvent};
use crate::table::{Inbound, InboundSender, Origin, TransactionTable};
use crate::writer::{spawn_writer, WriterHandle};
use crate::{SessionConfig, SessionError};

type Listener = Arc<dyn Fn(SessionEvent) -> BoxFuture<'static, ()> + Send + Sync>;

/// One event and the listeners registered when it arrived.
type Delivery = (Vec<Listener>, SessionEvent);

/// MethodError code sent for an invocation nobody listens for.
const INVALID_STATE: u16 = 0xFFFF;

/// Called by [`Session::invoke_method`] when the server asks for a
/// confirmation mid-invocation. Returns the response fields.
pub type ConfirmCallback = Box<dyn FnMut(Confirmation) -> BoxFuture<'static, FieldValue> + Send>;

struct Shared {
    id: ConnectionId,
    role: PeerRole,
    space: Arc<SpecSpace>,
    config: SessionConfig,
    table: Mutex<TransactionTable>,
    listeners: Mutex<Vec<Listener>>,
    writer: WriterHandle,
    events: mpsc::UnboundedSender<Delivery>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, TransactionTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<Listener>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SegmentContext for Shared {
    fn spec_space(&self) -> &SpecSpace {
        &self.space
    }

    fn originating_method(&self, transaction: u8) -> Option<Arc<MethodSpec>> {
        self.table().method(transaction)
    }

    fn pending_confirmation(&self, transaction: u8) -> Option<Arc<ConfirmationSpec>> {
        self.table().confirmation(transaction)
    }
}

/// Handle to a running session. Clones refer to the same session.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

/// Where the reader sends a decoded segment.
enum Route {
    /// Unsolicited: becomes a [`SessionEvent`].
    Event,
    /// Belongs to an open transaction.
    Awaiter(Option<InboundSender>),
    /// Names a transaction that is not open.
    Stray,
}

impl Session {
    /// Starts a session over an already-connected stream and returns its
    /// handle. Must be called from within a Tokio runtime.
    pub fn spawn<R, W>(
        id: ConnectionId,
        config: SessionConfig,
        space: Arc<SpecSpace>,
        role: PeerRole,
        reader: R,
        writer: W,
    ) -> Self
    where
        R: Readable + 'static,
        W: Writable + 'static,
    {
        Self::spawn_with(id, config, space, role, reader, writer, |_| {})
    }

    /// Like [`spawn`](Self::spawn), but runs `setup` before the first
    /// segment is read, so listeners attached there see every event.
    pub fn spawn_with<R, W, F>(
        id: ConnectionId,
        config: SessionConfig,
        space: Arc<SpecSpace>,
        role: PeerRole,
        reader: R,
        writer: W,
        setup: F,
    ) -> Self
    where
        R: Readable + 'static,
        W: Writable + 'static,
        F: FnOnce(&Session),
    {
        let config = config.validated();
        let writer = spawn_writer(id, writer, config.write_queue_depth);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (events, events_rx) = mpsc::unbounded_channel();

        let session = Self {
            shared: Arc::new(Shared {
                id,
                role,
                space,
                table: Mutex::new(TransactionTable::new(config.max_transactions)),
                config,
                listeners: Mutex::new(Vec::new()),
                writer,
                events,
                closed: AtomicBool::new(false),
                shutdown,
            }),
        };

        tracing::info!(
            session = %id,
            %role,
            project = %session.shared.space.project,
            "session started"
        );
        tokio::spawn(run_listeners(id, events_rx));
        setup(&session);
        tokio::spawn(read_loop(session.clone(), reader, shutdown_rx));
        session
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn role(&self) -> PeerRole {
        self.shared.role
    }

    pub fn spec_space(&self) -> &Arc<SpecSpace> {
        &self.shared.space
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Number of transactions currently open, in either direction.
    pub fn open_transactions(&self) -> usize {
        self.shared.table().len()
    }

    /// Segment kinds seen so far on an open transaction, oldest first.
    pub fn transaction_history(&self, id: u8) -> Option<Vec<&'static str>> {
        self.shared.table().history(id).map(<[_]>::to_vec)
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    /// Opens a transaction on a free id and sends its first segment.
    ///
    /// # Errors
    /// - [`SessionError::NoFreeTransaction`] if every id is in use
    /// - [`SessionError::Closed`] if the session has stopped
    pub async fn create_transaction(&self, body: SegmentBody) -> Result<Transaction, SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.shared.table().allocate(Some(tx))?;
        tracing::debug!(session = %self.shared.id, transaction = id, kind = body.kind_name(), "transaction opened");

        if let Err(e) = self.send_segment(Segment::new(id, body)).await {
            self.release(id);
            return Err(e);
        }
        Ok(Transaction::attached(self.clone(), id, rx))
    }

    /// Invokes a method on the server and waits for its result.
    ///
    /// Confirmations requested by the server are answered through
    /// `confirm`.
    ///
    /// # Errors
    /// - [`SessionError::Rpc`] when the server answers with a MethodError
    /// - [`SessionError::MissingConfirmationCallback`] when the server asks
    ///   for a confirmation and `confirm` is `None`. The transaction stays
    ///   open until the server resolves it.
    pub async fn invoke_method(
        &self,
        method: Method,
        mut confirm: Option<ConfirmCallback>,
    ) -> Result<FieldValue, SessionError> {
        let name = method.spec.name.clone();
        let mut tran = self
            .create_transaction(SegmentBody::InvokeMethod(method))
            .await?;

        loop {
            let segment = tran.next().await?;
            match segment.body {
                SegmentBody::MethodReturn(returned) => {
                    return Ok(returned.return_value.unwrap_or_default());
                }
                SegmentBody::MethodError(e) => {
                    tracing::debug!(method = %name, code = e.code, "invocation failed remotely");
                    return Err(SessionError::Rpc {
                        code: e.code,
                        message: e.message,
                    });
                }
                SegmentBody::ConfRequest(conf) => {
                    let Some(callback) = confirm.as_mut() else {
                        tracing::warn!(
                            method = %name,
                            confirmation = %conf.spec.name,
                            "confirmation requested without a callback"
                        );
                        return Err(SessionError::MissingConfirmationCallback);
                    };
                    let spec = Arc::clone(&conf.spec);
                    let response = callback(conf).await;
                    tran.send(SegmentBody::ConfResponse(
                        Confirmation::new(spec).with_response(response),
                    ))
                    .await?;
                }
                other => {
                    tracing::warn!(
                        method = %name,
                        kind = other.kind_name(),
                        "unexpected segment during invocation"
                    );
                }
            }
        }
    }

    /// Pushes an entity to the client on a one-shot transaction.
    pub async fn push_entity(&self, entity: Entity) -> Result<(), SessionError> {
        if self.shared.role != PeerRole::Server {
            return Err(SessionError::ServerOnly("push_entity"));
        }
        if self.is_closed() {
            return Err(SessionError::Closed);
        }

        let id = self.shared.table().allocate(None)?;
        let result = self
            .send_segment(Segment::new(id, SegmentBody::EntityUpdate(entity)))
            .await;
        self.release(id);
        result
    }

    /// Asks the client to complete a standalone confirmation and waits for
    /// the response.
    pub async fn request_confirmation(
        &self,
        confirmation: Confirmation,
        request: FieldValue,
    ) -> Result<FieldValue, SessionError> {
        if self.shared.role != PeerRole::Server {
            return Err(SessionError::ServerOnly("request_confirmation"));
        }
        let mut tran = self
            .create_transaction(SegmentBody::ConfRequest(confirmation.with_request(request)))
            .await?;
        tran.conf_response().await
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Registers a session-wide listener. Listeners are called in
    /// registration order for every event.
    pub fn subscribe<F, Fut>(&self, listener: F)
    where
        F: Fn(SessionEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener: Listener = Arc::new(move |event| listener(event).boxed());
        self.shared.listeners().push(listener);
    }

    fn emit(&self, event: SessionEvent) {
        let listeners = self.shared.listeners().clone();
        self.deliver(listeners, event);
    }

    /// Queues `event` for the listener task. Events are started in the
    /// order they are queued.
    fn deliver(&self, listeners: Vec<Listener>, event: SessionEvent) {
        let id = self.shared.id;
        if listeners.is_empty() && !matches!(event, SessionEvent::Closed(_)) {
            tracing::warn!(session = %id, kind = event.kind_name(), "unhandled event");
            if let SessionEvent::Invocation(inv) = event {
                tokio::spawn(async move {
                    if let Err(e) = inv.error(INVALID_STATE, "no handler for invocation").await {
                        tracing::debug!(session = %id, error = %e, "failed to refuse invocation");
                    }
                });
            }
            return;
        }
        if self.shared.events.send((listeners, event)).is_err() {
            tracing::debug!(session = %id, "listener task gone, event dropped");
        }
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Stops the session. Pending transactions fail with
    /// [`SessionError::Closed`]; listeners receive
    /// [`SessionEvent::Closed`] and are dropped.
    pub async fn close(&self) {
        self.shut_down(None).await;
    }

    async fn shut_down(&self, reason: Option<String>) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shared.shutdown.send(true);

        let awaiters = self.shared.table().drain();
        for awaiter in awaiters {
            let _ = awaiter.send(Err(SessionError::Closed));
        }
        self.shared.writer.close().await;

        tracing::info!(session = %self.shared.id, reason = reason.as_deref(), "session closed");
        let listeners = std::mem::take(&mut *self.shared.listeners());
        self.deliver(listeners, SessionEvent::Closed(reason));
    }

    // -----------------------------------------------------------------------
    // Internals shared with the event handles
    // -----------------------------------------------------------------------

    /// Encodes and writes one segment, recording it in its transaction's
    /// history first.
    pub(crate) async fn send_segment(&self, segment: Segment) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let data = segment.encode()?.freeze();
        self.shared
            .table()
            .note(segment.transaction_id, &segment.body);
        if self.shared.config.trace_segments {
            tracing::trace!(session = %self.shared.id, direction = "out", %segment, "segment");
        }
        self.shared.writer.write(data).await
    }

    pub(crate) fn release(&self, id: u8) {
        if self.shared.table().release(id) {
            tracing::debug!(session = %self.shared.id, transaction = id, "transaction released");
        }
    }

    pub(crate) fn attach(&self, id: u8, awaiter: InboundSender) -> bool {
        self.shared.table().attach(id, awaiter)
    }

    /// Sends a decoded segment where it belongs.
    ///
    /// # Errors
    /// Fails when the peer opens a transaction whose id is already open.
    fn route(&self, segment: Segment) -> Result<(), ProtocolError> {
        let tran = segment.transaction_id;
        if self.shared.config.trace_segments {
            tracing::trace!(session = %self.shared.id, direction = "in", %segment, "segment");
        }

        let route = {
            let mut table = self.shared.table();
            match &segment.body {
                SegmentBody::EntityUpdate(_) => Route::Event,
                SegmentBody::InvokeMethod(_) => {
                    table.open_remote(tran, &segment.body)?;
                    Route::Event
                }
                SegmentBody::ConfRequest(_) if !table.is_open(tran) => {
                    table.open_remote(tran, &segment.body)?;
                    Route::Event
                }
                body if table.note(tran, body) => {
                    let awaiter = table.awaiter(tran);
                    let standalone = matches!(body, SegmentBody::ConfResponse(_))
                        && table.origin(tran) == Some(Origin::Local)
                        && table.method(tran).is_none();
                    if body.is_terminal() || standalone {
                        table.release(tran);
                        tracing::debug!(session = %self.shared.id, transaction = tran, "transaction released");
                    }
                    Route::Awaiter(awaiter)
                }
                _ => Route::Stray,
            }
        };

        match route {
            Route::Event => {
                if let Some(event) = self.into_event(segment) {
                    self.emit(event);
                }
            }
            Route::Awaiter(Some(awaiter)) => {
                if awaiter.send(Ok(segment)).is_err() {
                    tracing::debug!(session = %self.shared.id, transaction = tran, "awaiter gone, segment dropped");
                }
            }
            Route::Awaiter(None) => {
                tracing::warn!(session = %self.shared.id, transaction = tran, %segment, "nobody awaits segment");
            }
            Route::Stray => {
                tracing::warn!(session = %self.shared.id, transaction = tran, %segment, "segment for a closed transaction");
            }
        }
        Ok(())
    }

    fn into_event(&self, segment: Segment) -> Option<SessionEvent> {
        let tran = segment.transaction_id;
        match segment.body {
            SegmentBody::InvokeMethod(method) => Some(SessionEvent::Invocation(
                Invocation::received(self.clone(), tran, method),
            )),
            SegmentBody::ConfRequest(conf) => Some(SessionEvent::ConfirmationRequest(
                ConfirmationRequest::received(self.clone(), tran, conf),
            )),
            SegmentBody::EntityUpdate(entity) => Some(SessionEvent::EntityUpdate(entity)),
            _ => None,
        }
    }
}

/// Runs listener futures for every queued event. Each event's listeners
/// are started in registration order, and events are started in arrival
/// order; once started they run concurrently, so the reader never waits
/// on application code. Stops after delivering [`SessionEvent::Closed`].
async fn run_listeners(id: ConnectionId, mut events: mpsc::UnboundedReceiver<Delivery>) {
    let mut running = FuturesUnordered::new();
    let mut open = true;

    while open || !running.is_empty() {
        tokio::select! {
            delivery = events.recv(), if open => match delivery {
                Some((listeners, event)) => {
                    open = !matches!(event, SessionEvent::Closed(_));
                    let futures: Vec<_> = listeners.iter().map(|l| l(event.clone())).collect();
                    running.push(join_all(futures));
                }
                None => open = false,
            },
            Some(_) = running.next(), if !running.is_empty() => {}
        }
    }
    tracing::debug!(session = %id, "listener task stopped");
}

// ---------------------------------------------------------------------------
// Reader task
// ---------------------------------------------------------------------------

/// Reads one segment. On a body decode failure the error carries the
/// transaction id from the header.
async fn next_segment<R: Readable>(
    reader: &mut R,
    ctx: &Shared,
    role: PeerRole,
) -> Result<Segment, (Option<u8>, ProtocolError)> {
    let header = Segment::read_header(reader).await.map_err(|e| (None, e))?;
    let tran = header.transaction_id;
    Segment::read_body(reader, header, ctx, role)
        .await
        .map_err(|e| (Some(tran), e))
}

async fn read_loop<R: Readable>(session: Session, mut reader: R, mut shutdown: watch::Receiver<bool>) {
    let id = session.shared.id;
    let role = session.shared.role;

    let reason = loop {
        if *shutdown.borrow() {
            return;
        }
        let result = tokio::select! {
            _ = shutdown.changed() => return,
            result = next_segment(&mut reader, &session.shared, role) => result,
        };

        let (tran, err) = match result {
            Ok(segment) => match session.route(segment) {
                Ok(()) => continue,
                Err(e) => (None, e),
            },
            Err(failure) => failure,
        };

        if let ProtocolError::Transport(e) = &err {
            if e.is_closed() {
                tracing::info!(session = %id, "peer closed the stream");
                break Some(e.to_string());
            }
        }

        let reason = err.to_string();
        tracing::error!(session = %id, transaction = tran, error = %reason, "failed to decode segment");
        if let Some(awaiter) = tran.and_then(|t| session.shared.table().awaiter(t)) {
            let _ = awaiter.send(Err(SessionError::Protocol(err)));
        }
        break Some(reason);
    };

    session.shut_down(reason).await;
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// A locally opened transaction: send on it and receive what the peer
/// answers.
pub struct Transaction {
    session: Session,
    id: u8,
    inbound: mpsc::UnboundedReceiver<Inbound>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("session", &self.session.shared.id)
            .field("id", &self.id)
            .finish()
    }
}

impl Transaction {
    pub(crate) fn attached(session: Session, id: u8, inbound: mpsc::UnboundedReceiver<Inbound>) -> Self {
        Self {
            session,
            id,
            inbound,
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    /// Sends another segment on this transaction.
    pub async fn send(&self, body: SegmentBody) -> Result<(), SessionError> {
        self.session.send_segment(Segment::new(self.id, body)).await
    }

    /// Waits for the next segment the peer sends on this transaction.
    pub async fn next(&mut self) -> Result<Segment, SessionError> {
        self.inbound.recv().await.ok_or(SessionError::Closed)?
    }

    /// Frees the id without waiting for the peer.
    pub fn abort(self) {
        self.session.release(self.id);
    }

    /// Waits for the ConfResponse that resolves a pending ConfRequest.
    pub(crate) async fn conf_response(&mut self) -> Result<FieldValue, SessionError> {
        loop {
            let segment = self.next().await?;
            match segment.body {
                SegmentBody::ConfResponse(conf) => return Ok(conf.response.unwrap_or_default()),
                other => {
                    tracing::warn!(
                        transaction = self.id,
                        kind = other.kind_name(),
                        "ignoring segment while awaiting confirmation"
                    );
                }
            }
        }
    }
}
