//! Whole-segment scenarios decoded the way a session reader does it.

use std::sync::Arc;

use speedwire_protocol::{
    ConfirmationSpec, EntitySpec, FieldSpec, FieldValue, ListUpdate, MethodSpec, PeerRole,
    ProtocolError, Repr, Segment, SegmentBody, SegmentContext, SpecSpace, Value,
};
use speedwire_transport::SliceReader;

struct Ctx {
    space: SpecSpace,
}

impl SegmentContext for Ctx {
    fn spec_space(&self) -> &SpecSpace {
        &self.space
    }

    fn originating_method(&self, _transaction: u8) -> Option<Arc<MethodSpec>> {
        None
    }

    fn pending_confirmation(&self, _transaction: u8) -> Option<Arc<ConfirmationSpec>> {
        None
    }
}

fn ctx() -> Ctx {
    let tags = Repr::list(Repr::str(), 1).unwrap();
    let space = SpecSpace::builder("wire", 3)
        .method(
            MethodSpec::new("note", 0).params(
                FieldSpec::new()
                    .optional("tag", 0, Repr::str())
                    .optional("weight", 12, Repr::int(1).unwrap()),
            ),
        )
        .entity(
            EntitySpec::new(
                "Channel",
                2,
                FieldSpec::new()
                    .required("id", Repr::int(2).unwrap())
                    .optional("name", 0, Repr::str())
                    .optional("tags", 1, tags),
            )
            .method(
                MethodSpec::new("rename", 0)
                    .params(FieldSpec::new().required("name", Repr::str())),
            ),
        )
        .build()
        .unwrap();
    Ctx { space }
}

async fn decode(bytes: &[u8], ctx: &Ctx, role: PeerRole) -> Result<Segment, ProtocolError> {
    let mut reader = SliceReader::new(bytes.to_vec());
    let segment = Segment::read(&mut reader, ctx, role).await?;
    assert_eq!(reader.remaining(), 0, "segment must consume every byte");
    Ok(segment)
}

// =========================================================================
// EntityUpdate
// =========================================================================

#[tokio::test]
async fn test_entity_update_with_partial_list_round_trips() {
    let ctx = ctx();
    let channel = ctx.space.entity_by_name("Channel").unwrap().instantiate(
        FieldValue::new()
            .with("id", 300u32)
            .with("tags", ListUpdate::append(vec![Value::from("new")])),
    );

    let bytes = Segment::new(4, SegmentBody::EntityUpdate(channel.clone()))
        .encode()
        .unwrap();
    assert_eq!(bytes[0], 4);
    assert_eq!(bytes[1] >> 6, 1, "EntityUpdate kind");

    for role in [PeerRole::Server, PeerRole::Client] {
        let segment = decode(&bytes, &ctx, role).await.unwrap();
        match segment.body {
            SegmentBody::EntityUpdate(entity) => assert_eq!(entity, channel),
            other => panic!("expected EntityUpdate, got {}", other.kind_name()),
        }
    }
}

// =========================================================================
// InvokeMethod
// =========================================================================

#[tokio::test]
async fn test_sparse_optional_fields_round_trip() {
    let ctx = ctx();
    let method = ctx
        .space
        .method("note")
        .unwrap()
        .with_params(FieldValue::new().with("weight", 9u32));

    let bytes = Segment::new(0, SegmentBody::InvokeMethod(method.clone()))
        .encode()
        .unwrap();
    // One optional field out of a two-byte selector: low packing.
    assert_eq!(bytes.to_vec(), vec![0, 0x10, 0, 1, 12, 9]);

    let segment = decode(&bytes, &ctx, PeerRole::Server).await.unwrap();
    let SegmentBody::InvokeMethod(decoded) = segment.body else {
        panic!("expected InvokeMethod");
    };
    assert_eq!(decoded.params, method.params);
}

#[tokio::test]
async fn test_unknown_optional_field_is_decode_error() {
    let ctx = ctx();
    let err = decode(&[1, 0x10, 0, 1, 9, 0], &ctx, PeerRole::Server)
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::UnknownField { id: 9, .. }));
}

#[tokio::test]
async fn test_entity_method_invocation_resolves_by_name() {
    let ctx = ctx();
    let method = ctx
        .space
        .method("Channel.rename")
        .unwrap()
        .with_entity_id(300u32)
        .with_params(FieldValue::new().with("name", "general"));

    let bytes = Segment::new(2, SegmentBody::InvokeMethod(method)).encode().unwrap();
    let segment = decode(&bytes, &ctx, PeerRole::Server).await.unwrap();
    let SegmentBody::InvokeMethod(decoded) = segment.body else {
        panic!("expected InvokeMethod");
    };
    assert_eq!(decoded.name(), "Channel.rename");
    assert_eq!(decoded.entity_id, Some(Value::Int(300)));
    assert_eq!(decoded.params.unwrap().str("name"), Some("general"));
}

#[tokio::test]
async fn test_client_cannot_decode_invoke_method_without_origin() {
    let ctx = ctx();
    let method = ctx.space.method("note").unwrap().with_params(FieldValue::new());
    let bytes = Segment::new(0, SegmentBody::InvokeMethod(method)).encode().unwrap();

    // Kind 0 is a MethodReturn when client-bound, and nothing opened it.
    let err = decode(&bytes, &ctx, PeerRole::Client).await.unwrap_err();
    assert!(matches!(
        err,
        ProtocolError::UnexpectedSegment { kind: "MethodReturn", transaction: 0 }
    ));
}
