//! Wire protocol for speedwire.
//!
//! This crate defines how typed values become bytes and how those bytes
//! are framed into segments:
//!
//! - **Values** ([`Value`], [`FieldValue`], [`ListValue`]): the dynamic
//!   data model that descriptor-driven codecs produce and consume.
//! - **Codecs** ([`Repr`], [`FieldSpec`], [`ListRepr`]): bit-exact
//!   encodings, including the two optional-field packings.
//! - **Descriptors** ([`SpecSpace`], [`MethodSpec`], [`EntitySpec`],
//!   [`ConfirmationSpec`]): the immutable registry both peers share.
//! - **Segments** ([`Segment`], [`SegmentBody`]): addressed messages
//!   carrying one payload on one transaction.
//! - **Errors** ([`ProtocolError`]): what can go wrong during
//!   encoding/decoding.
//!
//! # Architecture
//!
//! The protocol layer sits between transport (raw bytes) and session
//! (transactions). It doesn't know about open exchanges; when a segment
//! can only be decoded in context it asks a [`SegmentContext`].
//!
//! ```text
//! Transport (bytes) → Protocol (Segment) → Session (transactions, events)
//! ```

// ---------------------------------------------------------------------------
// Module declarations
// ---------------------------------------------------------------------------

mod codec;
mod entity;
mod error;
mod fields;
mod list;
mod segment;
mod spec;
mod value;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use codec::{
    big_int_mode, set_big_int_mode, BigIntMode, BigIntRepr, BinRepr, EnumRepr, IntRepr, Repr,
    StrRepr,
};
pub use entity::{Entity, EntitySpec, MAX_ENTITY_ID};
pub use error::ProtocolError;
pub use fields::{FieldSpec, OptionalField, PackingMode};
pub use list::ListRepr;
pub use segment::{
    MethodError, PeerRole, Segment, SegmentBody, SegmentContext, SegmentHeader,
};
pub use spec::{
    Confirmation, ConfirmationSpec, Method, MethodSpec, RateLimit, SpecSpace, SpecSpaceBuilder,
    MAX_CONFIRMATION_ID, STATIC_METHOD_FLAG,
};
pub use value::{FieldValue, ListUpdate, ListValue, PartialOp, Value};

// ---------------------------------------------------------------------------
// Standalone (de)serialization
// ---------------------------------------------------------------------------

use bytes::{Bytes, BytesMut};
use speedwire_transport::SliceReader;

/// Encodes a single value outside of any session.
pub fn serialize(repr: &Repr, value: &Value) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    repr.write(&mut buf, value)?;
    Ok(buf.freeze())
}

/// Decodes a single value outside of any session.
///
/// Trailing bytes are an error: the buffer must hold exactly one value.
pub async fn deserialize(
    repr: &Repr,
    data: impl Into<Bytes>,
    space: Option<&SpecSpace>,
) -> Result<Value, ProtocolError> {
    let mut reader = SliceReader::new(data);
    let value = repr.read(&mut reader, space).await?;
    if reader.remaining() != 0 {
        return Err(ProtocolError::Decode(format!(
            "{} trailing byte(s) after value",
            reader.remaining()
        )));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_standalone_round_trip() {
        let repr = Repr::list(Repr::str(), 1).unwrap();
        let value = Value::from(vec![Value::from("a"), Value::from("bc")]);
        let bytes = serialize(&repr, &value).unwrap();
        assert_eq!(deserialize(&repr, bytes, None).await.unwrap(), value);
    }

    #[tokio::test]
    async fn test_deserialize_rejects_trailing_bytes() {
        let err = deserialize(&Repr::Bool, vec![1u8, 0], None).await.unwrap_err();
        assert!(err.to_string().contains("trailing"));
    }

    #[tokio::test]
    async fn test_deserialize_truncated_input_is_transport_error() {
        let repr = Repr::int(4).unwrap();
        let err = deserialize(&repr, vec![0u8, 1], None).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Transport(_)));
    }
}
