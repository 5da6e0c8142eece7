//! Integration tests for invocation dispatch and the TCP server.

use std::time::Duration;

use futures_util::FutureExt;
use speedwire::prelude::*;
use speedwire_protocol::StrRepr;
use speedwire_transport::pipe;

// =========================================================================
// Fixtures
// =========================================================================

fn space() -> Arc<SpecSpace> {
    let text = || FieldSpec::new().required("text", Repr::str());
    Arc::new(
        SpecSpace::builder("speedwire-test", 1)
            .method(MethodSpec::new("echo", 0).params(text()).returns(text()))
            .method(
                MethodSpec::new("limited", 1)
                    .params(text())
                    .returns(text())
                    .rate_limit(2, Duration::from_secs(60)),
            )
            .method(
                MethodSpec::new("rename", 2)
                    .params(FieldSpec::new().required("name", StrRepr::default().with_len(1..=8)))
                    .returns(FieldSpec::new().required("count", Repr::int(2).unwrap())),
            )
            .method(
                MethodSpec::new("captcha", 3)
                    .returns(FieldSpec::new().required("ok", Repr::Bool))
                    .confirmation(0),
            )
            .confirmation(
                ConfirmationSpec::new("Captcha", 0)
                    .request(FieldSpec::new().required("url", Repr::str()))
                    .response(FieldSpec::new().required("code", Repr::str())),
            )
            .build()
            .unwrap(),
    )
}

/// A server-role session with a dispatcher, linked to a client session.
fn linked<S>(state: S) -> (Server<S>, Session)
where
    S: Clone + Send + Sync + 'static,
{
    let ((a_read, a_write), (b_read, b_write)) = pipe();
    let server = Session::spawn(
        ConnectionId::next(),
        SessionConfig::default(),
        space(),
        PeerRole::Server,
        a_read,
        a_write,
    );
    let client = Session::spawn(
        ConnectionId::next(),
        SessionConfig::default(),
        space(),
        PeerRole::Client,
        b_read,
        b_write,
    );
    (Server::new(server, state), client)
}

fn method(client: &Session, name: &str, params: FieldValue) -> Method {
    client.spec_space().method(name).unwrap().with_params(params)
}

fn text(value: &str) -> FieldValue {
    FieldValue::new().with("text", value)
}

fn rpc_error(err: SessionError) -> (u16, String) {
    match err {
        SessionError::Rpc { code, message } => (code, message),
        other => panic!("expected Rpc, got {other:?}"),
    }
}

fn register_echo(server: &Server<()>) {
    server
        .on_invocation("echo", |inv, _state| async move {
            let text = inv.params().and_then(|p| p.str("text")).unwrap_or_default();
            inv.return_value(FieldValue::new().with("text", format!("{text} return")))
                .await?;
            Ok::<_, SpeedwireError>(None)
        })
        .unwrap();
}

// =========================================================================
// Dispatch
// =========================================================================

#[tokio::test]
async fn test_echo_handler_returns_value() {
    let (server, client) = linked(());
    register_echo(&server);

    let returned = client
        .invoke_method(method(&client, "echo", text("Hello, World!")), None)
        .await
        .unwrap();
    assert_eq!(returned.str("text"), Some("Hello, World! return"));
}

#[tokio::test]
async fn test_on_invocation_unknown_method_is_rejected() {
    let (server, _client) = linked(());
    let err = server
        .on_invocation("nope", |_inv, _state| async { Ok(None) })
        .unwrap_err();
    assert!(matches!(err, SpeedwireError::UnknownMethod(name) if name == "nope"));
}

#[tokio::test]
async fn test_handler_state_is_replaced() {
    let (server, client) = linked(0u32);
    server
        .on_invocation("rename", |inv, count: u32| async move {
            let count = count + 1;
            inv.return_value(FieldValue::new().with("count", count)).await?;
            Ok::<_, SpeedwireError>(Some(count))
        })
        .unwrap();

    for expected in 1..=3u32 {
        let returned = client
            .invoke_method(method(&client, "rename", FieldValue::new().with("name", "ada")), None)
            .await
            .unwrap();
        assert_eq!(returned.int("count"), Some(expected));
        // The state is stored once the handler returns, after it answered.
        wait_for_state(&server, expected).await;
    }
}

async fn wait_for_state(server: &Server<u32>, expected: u32) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while server.state() != expected {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("state was not replaced");
}

async fn wait_for_release(session: &Session) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while session.open_transactions() != 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("transaction was not released");
}

#[tokio::test]
async fn test_invalid_params_fail_validation() {
    let (server, client) = linked(0u32);
    server
        .on_invocation("rename", |_inv, _state| async { Ok(Some(99)) })
        .unwrap();

    let err = client
        .invoke_method(
            method(&client, "rename", FieldValue::new().with("name", "much too long")),
            None,
        )
        .await
        .unwrap_err();
    let (code, message) = rpc_error(err);
    assert_eq!(code, ErrorCode::ValidationFailed.code());
    assert_eq!(
        message,
        "validation failed: FieldArray.name: Str[len]: \"13\" is out of range 1..8"
    );
    assert_eq!(server.state(), 0, "handler did not run");
}

#[tokio::test]
async fn test_rate_limit_rejects_after_max() {
    let (server, client) = linked(());
    server
        .on_invocation("limited", |inv, _state| async move {
            inv.return_value(FieldValue::new().with("text", "ok")).await?;
            Ok::<_, SpeedwireError>(None)
        })
        .unwrap();

    for _ in 0..2 {
        client
            .invoke_method(method(&client, "limited", text("x")), None)
            .await
            .unwrap();
    }
    let err = client
        .invoke_method(method(&client, "limited", text("x")), None)
        .await
        .unwrap_err();
    assert_eq!(rpc_error(err), (65533, "rate limit exceeded".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_recovers_after_window() {
    let (server, client) = linked(());
    server
        .on_invocation("limited", |inv, _state| async move {
            inv.return_value(FieldValue::new().with("text", "ok")).await?;
            Ok::<_, SpeedwireError>(None)
        })
        .unwrap();

    for _ in 0..2 {
        client
            .invoke_method(method(&client, "limited", text("x")), None)
            .await
            .unwrap();
    }
    let err = client
        .invoke_method(method(&client, "limited", text("x")), None)
        .await
        .unwrap_err();
    assert_eq!(rpc_error(err).0, ErrorCode::RateLimit.code());

    tokio::time::advance(Duration::from_secs(61)).await;
    let returned = client
        .invoke_method(method(&client, "limited", text("x")), None)
        .await
        .unwrap();
    assert_eq!(returned.str("text"), Some("ok"));
}

#[tokio::test]
async fn test_rejected_handler_answers_with_its_code() {
    let (server, client) = linked(());
    server
        .on_invocation("echo", |_inv, _state| async {
            Err(SpeedwireError::rejected(ErrorCode::InvalidId))
        })
        .unwrap();

    let err = client
        .invoke_method(method(&client, "echo", text("x")), None)
        .await
        .unwrap_err();
    assert_eq!(rpc_error(err), (65531, "invalid id".to_string()));
}

#[tokio::test]
async fn test_failed_handler_answers_invalid_state() {
    let (server, client) = linked(());
    server
        .on_invocation("echo", |_inv, _state| async {
            Err(SpeedwireError::Session(SessionError::Closed))
        })
        .unwrap();

    let err = client
        .invoke_method(method(&client, "echo", text("x")), None)
        .await
        .unwrap_err();
    assert_eq!(rpc_error(err).0, ErrorCode::InvalidState.code());
}

#[tokio::test]
async fn test_handler_without_answer_gets_invalid_state() {
    let (server, client) = linked(0u32);
    server
        .on_invocation("rename", |_inv, _state| async { Ok(Some(5)) })
        .unwrap();

    let err = client
        .invoke_method(method(&client, "rename", FieldValue::new().with("name", "ada")), None)
        .await
        .unwrap_err();
    assert_eq!(rpc_error(err), (65535, "invalid state".to_string()));
    assert_eq!(server.state(), 5);
    wait_for_release(server.session()).await;
}

#[tokio::test]
async fn test_method_without_handler_gets_invalid_state() {
    let (server, client) = linked(());
    register_echo(&server);

    let err = client
        .invoke_method(method(&client, "limited", text("x")), None)
        .await
        .unwrap_err();
    assert_eq!(rpc_error(err).0, ErrorCode::InvalidState.code());
    wait_for_release(server.session()).await;
}

#[tokio::test]
async fn test_invocation_queued_before_server_starts_is_handled() {
    let ((a_read, a_write), (b_read, b_write)) = pipe();
    let client = Session::spawn(
        ConnectionId::next(),
        SessionConfig::default(),
        space(),
        PeerRole::Client,
        b_read,
        b_write,
    );

    let pending = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .invoke_method(method(&client, "echo", text("early")), None)
                .await
        }
    });
    while client.open_transactions() == 0 {
        tokio::task::yield_now().await;
    }

    // The InvokeMethod is already waiting in the pipe.
    let _server = Session::spawn_with(
        ConnectionId::next(),
        SessionConfig::default(),
        space(),
        PeerRole::Server,
        a_read,
        a_write,
        |session| register_echo(&Server::new(session.clone(), ())),
    );

    let returned = pending.await.unwrap().unwrap();
    assert_eq!(returned.str("text"), Some("early return"));
}

// =========================================================================
// Confirmations through dispatch
// =========================================================================

fn register_captcha(server: &Server<()>) {
    let space = server.session().spec_space().clone();
    server
        .on_invocation("captcha", move |inv, _state| {
            let space = space.clone();
            async move {
                let captcha = space.new_confirmation("Captcha").unwrap();
                let request = FieldValue::new().with("url", "https://example.com/x.png");
                let response = inv.confirm(captcha, request).await?;
                if response.str("code") != Some("42") {
                    return Err(SpeedwireError::Rejected {
                        code: ErrorCode::ValidationFailed,
                        message: "Invalid captcha".into(),
                    });
                }
                inv.return_value(FieldValue::new().with("ok", true)).await?;
                Ok::<_, SpeedwireError>(None)
            }
        })
        .unwrap();
}

fn answer_with(code: &'static str) -> ConfirmCallback {
    Box::new(move |conf: Confirmation| {
        assert_eq!(
            conf.request.as_ref().and_then(|r| r.str("url")),
            Some("https://example.com/x.png")
        );
        async move { FieldValue::new().with("code", code) }.boxed()
    })
}

#[tokio::test]
async fn test_captcha_correct_code_returns() {
    let (server, client) = linked(());
    register_captcha(&server);

    let returned = client
        .invoke_method(method(&client, "captcha", FieldValue::new()), Some(answer_with("42")))
        .await
        .unwrap();
    assert_eq!(returned.get("ok"), Some(&Value::Bool(true)));
}

#[tokio::test]
async fn test_captcha_wrong_code_is_rejected() {
    let (server, client) = linked(());
    register_captcha(&server);

    let err = client
        .invoke_method(method(&client, "captcha", FieldValue::new()), Some(answer_with("7")))
        .await
        .unwrap_err();
    assert_eq!(rpc_error(err), (65534, "Invalid captcha".to_string()));
}

// =========================================================================
// TCP
// =========================================================================

#[tokio::test]
async fn test_tcp_server_serves_echo() {
    let listener = SpeedwireServer::builder()
        .bind("127.0.0.1:0")
        .build(space())
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    tokio::spawn(listener.run(|session| {
        let server = Server::new(session, ());
        register_echo(&server);
    }));

    let client = connect(&addr, space(), SessionConfig::default()).await.unwrap();
    let returned = client
        .invoke_method(method(&client, "echo", text("tcp")), None)
        .await
        .unwrap();
    assert_eq!(returned.str("text"), Some("tcp return"));

    client.close().await;
}
