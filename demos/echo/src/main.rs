use std::time::Duration;

use futures_util::FutureExt;
use speedwire::prelude::*;

const ADDR: &str = "127.0.0.1:9000";

// ---------------------------------------------------------------------------
// Protocol
// ---------------------------------------------------------------------------

fn spec_space() -> Result<SpecSpace, SpeedwireError> {
    let text = || FieldSpec::new().required("text", Repr::str());
    let space = SpecSpace::builder("echo", 1)
        .method(
            MethodSpec::new("echo", 0)
                .params(text())
                .returns(text())
                .rate_limit(10, Duration::from_secs(1)),
        )
        .method(
            MethodSpec::new("captcha", 1)
                .returns(FieldSpec::new().required("served", Repr::int(4)?))
                .confirmation(0),
        )
        .entity(EntitySpec::new(
            "Counter",
            1,
            FieldSpec::new()
                .required("id", Repr::int(1)?)
                .required("served", Repr::int(4)?),
        ))
        .confirmation(
            ConfirmationSpec::new("Captcha", 0)
                .request(FieldSpec::new().required("url", Repr::str()))
                .response(FieldSpec::new().required("code", Repr::str())),
        )
        .build()?;
    Ok(space)
}

/// Session settings, read from the JSON file named by `ECHO_CONFIG` if set.
fn session_config() -> Result<SessionConfig, Box<dyn std::error::Error>> {
    match std::env::var("ECHO_CONFIG") {
        Ok(path) => Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?),
        Err(_) => Ok(SessionConfig::default()),
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Invocations served so far on one session.
type Served = u32;

fn serve(session: Session) {
    let server = Server::new(session, Served::default());

    let pusher = server.session().clone();
    let registered = server.on_invocation("echo", move |inv, served| {
        let pusher = pusher.clone();
        async move {
            let text = inv.params().and_then(|p| p.str("text")).unwrap_or_default();
            inv.return_value(FieldValue::new().with("text", format!("{text} return")))
                .await?;

            let served = served + 1;
            let counter = pusher
                .spec_space()
                .entity_by_name("Counter")
                .map(|spec| spec.instantiate(FieldValue::new().with("id", 0u32).with("served", served)));
            if let Some(counter) = counter {
                pusher.push_entity(counter).await?;
            }
            Ok::<_, SpeedwireError>(Some(served))
        }
    });

    let space = server.session().spec_space().clone();
    let registered = registered.and_then(|()| {
        server.on_invocation("captcha", move |inv, served| {
            let space = space.clone();
            async move {
                let Some(captcha) = space.new_confirmation("Captcha") else {
                    return Err(SpeedwireError::rejected(ErrorCode::InvalidState));
                };
                let request = FieldValue::new().with("url", "https://example.com/x.png");
                let response = inv.confirm(captcha, request).await?;
                if response.str("code") != Some("42") {
                    return Err(SpeedwireError::Rejected {
                        code: ErrorCode::ConfirmationFailed,
                        message: "Invalid captcha".into(),
                    });
                }
                inv.return_value(FieldValue::new().with("served", served)).await?;
                Ok::<_, SpeedwireError>(None)
            }
        })
    });

    if let Err(e) = registered {
        tracing::error!(error = %e, "failed to register handlers");
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

async fn run_client(space: Arc<SpecSpace>, config: SessionConfig) -> Result<(), SpeedwireError> {
    let client = connect(ADDR, Arc::clone(&space), config).await?;
    client.subscribe(|event| async move {
        if let SessionEvent::EntityUpdate(entity) = event {
            tracing::info!(served = ?entity.value().int("served"), "counter updated");
        }
    });

    let Some(echo) = space.method("echo") else {
        return Err(SpeedwireError::UnknownMethod("echo".into()));
    };
    let returned = client
        .invoke_method(echo.with_params(FieldValue::new().with("text", "Hello, World!")), None)
        .await?;
    tracing::info!(text = ?returned.str("text"), "echo returned");

    let Some(captcha) = space.method("captcha") else {
        return Err(SpeedwireError::UnknownMethod("captcha".into()));
    };
    let solve: ConfirmCallback = Box::new(|conf: Confirmation| {
        tracing::info!(url = ?conf.request.as_ref().and_then(|r| r.str("url")), "solving captcha");
        async { FieldValue::new().with("code", "42") }.boxed()
    });
    let returned = client.invoke_method(captcha, Some(solve)).await?;
    tracing::info!(served = ?returned.int("served"), "captcha accepted");

    client.close().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    speedwire::init_tracing("info");

    let space = Arc::new(spec_space()?);
    let config = session_config()?;

    if std::env::args().nth(1).as_deref() == Some("client") {
        run_client(space, config).await?;
        return Ok(());
    }

    let server = SpeedwireServer::builder()
        .bind(ADDR)
        .session_config(config)
        .build(space)
        .await?;
    server.run(serve).await?;
    Ok(())
}
