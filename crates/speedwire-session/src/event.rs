//! Events delivered to session listeners and the handles used to answer
//! them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use speedwire_protocol::{
    Confirmation, Entity, FieldValue, Method, MethodError, Segment, SegmentBody,
};
use tokio::sync::mpsc;

use crate::{Session, SessionError, Transaction};

/// Something the peer started that the application should handle.
#[derive(Clone)]
pub enum SessionEvent {
    /// The client invoked a method (server side).
    Invocation(Invocation),
    /// The peer pushed an entity.
    EntityUpdate(Entity),
    /// The server asked for a standalone confirmation (client side).
    ConfirmationRequest(ConfirmationRequest),
    /// The session ended. Carries the reason when it was not a local close.
    Closed(Option<String>),
}

impl SessionEvent {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Invocation(_) => "invocation",
            Self::EntityUpdate(_) => "entity_update",
            Self::ConfirmationRequest(_) => "confirmation_request",
            Self::Closed(_) => "closed",
        }
    }
}

/// Where an event came from: the session and transaction to answer on.
/// Answering is allowed once.
struct Origin {
    session: Session,
    transaction: u8,
    answered: AtomicBool,
}

impl Origin {
    fn new(session: Session, transaction: u8) -> Arc<Self> {
        Arc::new(Self {
            session,
            transaction,
            answered: AtomicBool::new(false),
        })
    }

    fn check(origin: &Option<Arc<Self>>) -> Result<&Self, SessionError> {
        match origin {
            Some(o) if !o.answered.load(Ordering::Acquire) => Ok(o),
            _ => Err(SessionError::NoEvent),
        }
    }

    /// Marks the event answered. Only the first caller wins.
    fn claim(origin: &Option<Arc<Self>>) -> Result<&Self, SessionError> {
        let o = Self::check(origin)?;
        if o.answered.swap(true, Ordering::AcqRel) {
            return Err(SessionError::NoEvent);
        }
        Ok(o)
    }

    /// Sends the final segment of the transaction and frees the slot.
    async fn finish(&self, body: SegmentBody) -> Result<(), SessionError> {
        let result = self
            .session
            .send_segment(Segment::new(self.transaction, body))
            .await;
        self.session.release(self.transaction);
        result
    }
}

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

/// A method call received by the server.
///
/// Clones share the same originating event, so only one clone can answer.
#[derive(Clone)]
pub struct Invocation {
    pub method: Method,
    origin: Option<Arc<Origin>>,
}

impl Invocation {
    pub(crate) fn received(session: Session, transaction: u8, method: Method) -> Self {
        Self {
            method,
            origin: Some(Origin::new(session, transaction)),
        }
    }

    /// An invocation with no originating event. Every response fails with
    /// [`SessionError::NoEvent`].
    pub fn unbound(method: Method) -> Self {
        Self {
            method,
            origin: None,
        }
    }

    pub fn name(&self) -> &str {
        self.method.name()
    }

    pub fn params(&self) -> Option<&FieldValue> {
        self.method.params.as_ref()
    }

    pub fn transaction_id(&self) -> Option<u8> {
        self.origin.as_ref().map(|o| o.transaction)
    }

    /// Whether a response can still be sent.
    pub fn is_pending(&self) -> bool {
        Origin::check(&self.origin).is_ok()
    }

    /// Answers with a MethodReturn and closes the transaction.
    pub async fn return_value(&self, value: FieldValue) -> Result<(), SessionError> {
        let origin = Origin::claim(&self.origin)?;
        let mut method = Method::new(Arc::clone(&self.method.spec));
        method.return_value = Some(value);
        origin.finish(SegmentBody::MethodReturn(method)).await
    }

    /// Answers with a MethodError and closes the transaction.
    pub async fn error(&self, code: u16, message: impl Into<String>) -> Result<(), SessionError> {
        let origin = Origin::claim(&self.origin)?;
        origin
            .finish(SegmentBody::MethodError(MethodError {
                code,
                message: message.into(),
            }))
            .await
    }

    /// Asks the client to complete a confirmation before the invocation
    /// goes on, and waits for its response.
    ///
    /// # Errors
    /// - [`SessionError::NoEvent`] if there is no originating event, or it
    ///   was already answered
    /// - [`SessionError::ConfirmationNotAllowed`] if the method does not
    ///   list this confirmation
    pub async fn confirm(
        &self,
        confirmation: Confirmation,
        request: FieldValue,
    ) -> Result<FieldValue, SessionError> {
        let origin = Origin::check(&self.origin)?;
        let id = confirmation.numeric_id();
        if !self.method.spec.allows_confirmation(id) {
            return Err(SessionError::ConfirmationNotAllowed {
                id,
                method: self.method.spec.name.clone(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if !origin.session.attach(origin.transaction, tx) {
            return Err(SessionError::Closed);
        }
        let mut tran = Transaction::attached(origin.session.clone(), origin.transaction, rx);
        tran.send(SegmentBody::ConfRequest(confirmation.with_request(request)))
            .await?;
        tran.conf_response().await
    }
}

// ---------------------------------------------------------------------------
// ConfirmationRequest
// ---------------------------------------------------------------------------

/// A standalone confirmation the server asked the client to complete.
#[derive(Clone)]
pub struct ConfirmationRequest {
    pub confirmation: Confirmation,
    origin: Option<Arc<Origin>>,
}

impl ConfirmationRequest {
    pub(crate) fn received(session: Session, transaction: u8, confirmation: Confirmation) -> Self {
        Self {
            confirmation,
            origin: Some(Origin::new(session, transaction)),
        }
    }

    pub fn name(&self) -> &str {
        &self.confirmation.spec.name
    }

    pub fn request(&self) -> Option<&FieldValue> {
        self.confirmation.request.as_ref()
    }

    /// Sends the response and closes the transaction.
    pub async fn respond(&self, response: FieldValue) -> Result<(), SessionError> {
        let origin = Origin::claim(&self.origin)?;
        let reply = Confirmation::new(Arc::clone(&self.confirmation.spec)).with_response(response);
        origin.finish(SegmentBody::ConfResponse(reply)).await
    }
}
