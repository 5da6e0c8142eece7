//! Segments: the addressed, role-typed messages that make up a session.
//!
//! ```text
//! [transaction id: u8][prefix: u8][body ...]
//!
//! prefix: 7..6 kind | 5 high-packing | 4 has-optional | 3..0 kind-specific
//! ```
//!
//! The kind bits mean different things depending on which peer the
//! segment is bound to:
//!
//! | kind | server-bound  | client-bound |
//! |------|---------------|--------------|
//! | 0    | InvokeMethod  | MethodReturn |
//! | 1    | EntityUpdate  | EntityUpdate |
//! | 2    | ConfResponse  | ConfRequest  |
//! | 3    | (reserved)    | MethodError  |
//!
//! Some bodies cannot be decoded alone: a MethodReturn needs the method
//! that opened its transaction and a ConfResponse needs the pending
//! ConfRequest. The reader asks a [`SegmentContext`] for those.

use std::fmt;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use speedwire_transport::Readable;

use crate::codec::{read_u8, read_uint};
use crate::spec::STATIC_METHOD_FLAG;
use crate::{
    entity, Confirmation, ConfirmationSpec, Entity, FieldValue, Method, MethodSpec, PackingMode,
    ProtocolError, Repr, SpecSpace, Value,
};

const KIND_SHIFT: u8 = 6;

/// Which side of a session a peer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerRole {
    Server,
    Client,
}

impl PeerRole {
    pub fn opposite(self) -> Self {
        match self {
            Self::Server => Self::Client,
            Self::Client => Self::Server,
        }
    }
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server => f.write_str("server"),
            Self::Client => f.write_str("client"),
        }
    }
}

/// Application-level failure reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodError {
    pub code: u16,
    pub message: String,
}

#[derive(Debug, Clone)]
pub enum SegmentBody {
    InvokeMethod(Method),
    MethodReturn(Method),
    MethodError(MethodError),
    EntityUpdate(Entity),
    ConfRequest(Confirmation),
    ConfResponse(Confirmation),
}

impl SegmentBody {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::InvokeMethod(_) => "InvokeMethod",
            Self::MethodReturn(_) => "MethodReturn",
            Self::MethodError(_) => "MethodError",
            Self::EntityUpdate(_) => "EntityUpdate",
            Self::ConfRequest(_) => "ConfRequest",
            Self::ConfResponse(_) => "ConfResponse",
        }
    }

    /// The peer this body is addressed to. `EntityUpdate` may go either
    /// way; it is reported as client-bound, its usual direction.
    pub fn bound_to(&self) -> PeerRole {
        match self {
            Self::InvokeMethod(_) | Self::ConfResponse(_) => PeerRole::Server,
            Self::MethodReturn(_)
            | Self::MethodError(_)
            | Self::EntityUpdate(_)
            | Self::ConfRequest(_) => PeerRole::Client,
        }
    }

    fn kind(&self) -> u8 {
        match self {
            Self::InvokeMethod(_) | Self::MethodReturn(_) => 0,
            Self::EntityUpdate(_) => 1,
            Self::ConfRequest(_) | Self::ConfResponse(_) => 2,
            Self::MethodError(_) => 3,
        }
    }

    /// Ends the transaction it travels on.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::MethodReturn(_) | Self::MethodError(_))
    }
}

/// What the reader needs to know about open transactions.
pub trait SegmentContext {
    fn spec_space(&self) -> &SpecSpace;

    /// Spec of the method whose InvokeMethod opened `transaction`.
    fn originating_method(&self, transaction: u8) -> Option<Arc<MethodSpec>>;

    /// Spec of the latest ConfRequest seen on `transaction`.
    fn pending_confirmation(&self, transaction: u8) -> Option<Arc<ConfirmationSpec>>;
}

/// A segment header: transaction id and prefix byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub transaction_id: u8,
    pub prefix: u8,
}

impl SegmentHeader {
    pub fn kind(&self) -> u8 {
        self.prefix >> KIND_SHIFT
    }

    pub fn mode(&self) -> PackingMode {
        PackingMode::from_segment_prefix(self.prefix)
    }
}

#[derive(Debug, Clone)]
pub struct Segment {
    pub transaction_id: u8,
    pub body: SegmentBody,
}

impl Segment {
    pub fn new(transaction_id: u8, body: SegmentBody) -> Self {
        Self {
            transaction_id,
            body,
        }
    }

    pub fn bound_to(&self) -> PeerRole {
        self.body.bound_to()
    }

    pub fn kind_name(&self) -> &'static str {
        self.body.kind_name()
    }

    /// Encodes the whole segment into one buffer.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::with_capacity(32);
        buf.put_u8(self.transaction_id);
        let kind = self.body.kind() << KIND_SHIFT;
        let empty = FieldValue::new();

        match &self.body {
            SegmentBody::InvokeMethod(method) => {
                let params = method.params.as_ref().unwrap_or(&empty);
                let mode = method.spec.params.choose_mode(params);
                buf.put_u8(kind | mode.segment_bits());
                write_method_ids(&mut buf, method)?;
                method.spec.params.encode_with_mode(&mut buf, params, mode)?;
            }
            SegmentBody::MethodReturn(method) => {
                let returns = method.return_value.as_ref().unwrap_or(&empty);
                let mode = method.spec.returns.choose_mode(returns);
                buf.put_u8(kind | mode.segment_bits());
                method.spec.returns.encode_with_mode(&mut buf, returns, mode)?;
            }
            SegmentBody::MethodError(err) => {
                buf.put_u8(kind);
                Repr::int(2)?.write(&mut buf, &u32::from(err.code).into())?;
                Repr::str().write(&mut buf, &err.message.as_str().into())?;
            }
            SegmentBody::EntityUpdate(entity) => {
                buf.put_u8(kind);
                entity::write_entity(&mut buf, entity)?;
            }
            SegmentBody::ConfRequest(conf) => {
                let request = conf.request.as_ref().unwrap_or(&empty);
                let mode = conf.spec.request.choose_mode(request);
                buf.put_u8(kind | mode.segment_bits() | (conf.numeric_id() & 0x0F));
                conf.spec.request.encode_with_mode(&mut buf, request, mode)?;
            }
            SegmentBody::ConfResponse(conf) => {
                let response = conf.response.as_ref().unwrap_or(&empty);
                let mode = conf.spec.response.choose_mode(response);
                buf.put_u8(kind | mode.segment_bits());
                conf.spec.response.encode_with_mode(&mut buf, response, mode)?;
            }
        }

        Ok(buf)
    }

    /// Reads the transaction id and prefix byte.
    pub async fn read_header<R: Readable>(r: &mut R) -> Result<SegmentHeader, ProtocolError> {
        let data = r.read(2).await?;
        Ok(SegmentHeader {
            transaction_id: data[0],
            prefix: data[1],
        })
    }

    /// Decodes the body that follows `header`. `role` is the role of the
    /// reading peer, i.e. the side the segment is bound to.
    pub async fn read_body<R, C>(
        r: &mut R,
        header: SegmentHeader,
        ctx: &C,
        role: PeerRole,
    ) -> Result<Segment, ProtocolError>
    where
        R: Readable,
        C: SegmentContext + Sync + ?Sized,
    {
        let space = ctx.spec_space();
        let tran = header.transaction_id;
        let mode = header.mode();

        let body = match (role, header.kind()) {
            (PeerRole::Server, 0) => SegmentBody::InvokeMethod(read_invoke(r, space, mode).await?),
            (_, 1) => SegmentBody::EntityUpdate(entity::read_entity(r, Some(space)).await?),
            (PeerRole::Server, 2) => {
                let spec = ctx
                    .pending_confirmation(tran)
                    .ok_or(ProtocolError::UnexpectedSegment {
                        kind: "ConfResponse",
                        transaction: tran,
                    })?;
                let response = spec.response.read(r, mode, Some(space)).await?;
                SegmentBody::ConfResponse(Confirmation::new(spec).with_response(response))
            }
            (PeerRole::Client, 0) => {
                let spec = ctx
                    .originating_method(tran)
                    .ok_or(ProtocolError::UnexpectedSegment {
                        kind: "MethodReturn",
                        transaction: tran,
                    })?;
                let returns = spec.returns.read(r, mode, Some(space)).await?;
                let mut method = Method::new(spec);
                method.return_value = Some(returns);
                SegmentBody::MethodReturn(method)
            }
            (PeerRole::Client, 2) => {
                let id = header.prefix & 0x0F;
                let spec = space
                    .confirmation(id)
                    .ok_or(ProtocolError::UnknownConfirmation(id))?;
                let request = spec.request.read(r, mode, Some(space)).await?;
                SegmentBody::ConfRequest(Confirmation::new(Arc::clone(spec)).with_request(request))
            }
            (PeerRole::Client, 3) => {
                let code = read_uint(r, 2).await?;
                let message = match Repr::str().read(r, None).await? {
                    Value::Str(message) => message,
                    other => {
                        return Err(ProtocolError::TypeMismatch {
                            expected: "Str",
                            found: other.kind_name(),
                        });
                    }
                };
                SegmentBody::MethodError(MethodError {
                    // two bytes always fit
                    code: code as u16,
                    message,
                })
            }
            (role, kind) => return Err(ProtocolError::UnknownSegmentKind { kind, role }),
        };

        Ok(Segment::new(tran, body))
    }

    /// Reads one whole segment.
    pub async fn read<R, C>(r: &mut R, ctx: &C, role: PeerRole) -> Result<Segment, ProtocolError>
    where
        R: Readable,
        C: SegmentContext + Sync + ?Sized,
    {
        let header = Self::read_header(r).await?;
        Self::read_body(r, header, ctx, role).await
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.body {
            SegmentBody::InvokeMethod(m) | SegmentBody::MethodReturn(m) => {
                write!(f, "{}({})", self.kind_name(), m.name())?
            }
            SegmentBody::MethodError(e) => write!(f, "MethodError({})", e.code)?,
            SegmentBody::EntityUpdate(e) => write!(f, "EntityUpdate({})", e.spec().name)?,
            SegmentBody::ConfRequest(c) | SegmentBody::ConfResponse(c) => {
                write!(f, "{}({})", self.kind_name(), c.spec.name)?
            }
        }
        write!(f, " on transaction {}", self.transaction_id)
    }
}

fn write_method_ids(buf: &mut BytesMut, method: &Method) -> Result<(), ProtocolError> {
    let spec = &method.spec;
    let Some(entity_type) = spec.entity_type else {
        buf.put_u8(spec.numeric_id);
        return Ok(());
    };

    match (&method.entity_id, spec.is_static()) {
        (Some(_), true) => {
            return Err(ProtocolError::Encode(format!(
                "static method `{}` takes no entity id",
                spec.name
            )));
        }
        (None, false) => {
            return Err(ProtocolError::Encode(format!(
                "dynamic method `{}` needs an entity id",
                spec.name
            )));
        }
        _ => {}
    }

    buf.put_u8(spec.numeric_id | STATIC_METHOD_FLAG);
    match &method.entity_id {
        Some(id) => {
            buf.put_u8(entity_type | 0x80);
            let repr = spec.entity_id_repr.as_ref().ok_or_else(|| {
                ProtocolError::Encode(format!("method `{}` has no entity id repr", spec.name))
            })?;
            repr.write(buf, id)
        }
        None => {
            buf.put_u8(entity_type);
            Ok(())
        }
    }
}

async fn read_invoke<R: Readable>(
    r: &mut R,
    space: &SpecSpace,
    mode: PackingMode,
) -> Result<Method, ProtocolError> {
    let mut method_id = read_u8(r).await?;
    let mut entity_byte = None;

    if method_id & 0x80 != 0 {
        let ent = read_u8(r).await?;
        // Without an instance id the method is static and keeps its flag.
        method_id = (method_id & 0x7F) | (!ent & 0x80);
        entity_byte = Some(ent);
    }

    let entity_type = entity_byte.map(|e| e & 0x7F);
    let spec = match entity_type {
        None => space.global_method(method_id),
        Some(ent) => space.entity_method(ent, method_id),
    }
    .ok_or(ProtocolError::UnknownMethod {
        method: method_id,
        entity: entity_type,
    })?;

    let mut method = Method::new(Arc::clone(spec));
    if entity_byte.is_some_and(|e| e & 0x80 != 0) {
        let repr = spec.entity_id_repr.as_ref().ok_or_else(|| {
            ProtocolError::Decode(format!("method `{}` has no entity id repr", spec.name))
        })?;
        method.entity_id = Some(repr.read(r, Some(space)).await?);
    }

    method.params = Some(spec.params.read(r, mode, Some(space)).await?);
    Ok(method)
}
