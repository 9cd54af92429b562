use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use engine::{CompiledHandler, EngineError, HandlerSource, RuntimeConfig, RuntimeEngine};
use runtime_core::envelope::ENVELOPE_HEADER;
use runtime_core::{
    Etag, ExpectedEtag, Handler, HmacSigner, InboundRequest, ParamEnvelope, ParseBody, ScriptError,
    SetOptions, StorageCell,
};
use serde_json::{Value, json};

fn body_json(response: &runtime_core::HandlerResponse) -> Value {
    serde_json::from_slice(&response.body).unwrap()
}

async fn run_fixture(name: &str, request: InboundRequest) -> runtime_core::HandlerResponse {
    let engine = RuntimeEngine::new(RuntimeConfig::default(), HandlerSource::source(name)).unwrap();
    engine.execute_request(request).await
}

#[tokio::test]
async fn test_every_calling_convention_says_hello() {
    for name in ["hello-world-1", "hello-world-2", "hello-world-3"] {
        let response = run_fixture(name, InboundRequest::new("GET", "/")).await;
        assert_eq!(response.status, 200, "{}", name);
        assert_eq!(response.body_text(), "\"hello world\"", "{}", name);
    }
}

#[test]
fn test_unsupported_arity_is_rejected_when_the_runtime_is_built() {
    for arity in [0, 4] {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handler = Handler::with_context(move |_ctx, cb| {
            counter.fetch_add(1, Ordering::SeqCst);
            cb.finish();
            Ok(())
        });
        let result = RuntimeEngine::new(
            RuntimeConfig::default(),
            HandlerSource::Compiled(CompiledHandler::with_arity(arity, handler)),
        );

        match result {
            Err(EngineError::InvalidSignature { arity: declared }) => assert_eq!(declared, arity),
            other => panic!("expected an invalid signature, got {:?}", other.map(|_| ())),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}

#[tokio::test]
async fn test_echo_returns_parsed_body_when_requested() {
    let request = InboundRequest::new("POST", "/?webtask_pb=1&x=1")
        .with_header("content-type", "application/json")
        .with_body(r#"{"hello":"world"}"#);
    let response = run_fixture("echo", request).await;

    assert_eq!(response.status, 200);
    let body = body_json(&response);
    assert_eq!(body["body"], json!({ "hello": "world" }));
    assert_eq!(body["method"], "POST");
    assert_eq!(body["query"], json!({ "x": "1" }));
}

#[tokio::test]
async fn test_storage_etags_flow_across_requests() {
    let engine =
        RuntimeEngine::new(RuntimeConfig::default(), HandlerSource::source("storage-set-query")).unwrap();

    let first = engine
        .execute_request(InboundRequest::new("GET", "/?store=this"))
        .await;
    assert_eq!(first.status, 200);
    let first = body_json(&first);
    assert!(first.get("initialEtag").is_none());
    assert_eq!(first["afterReadEtag"], Value::Null);
    assert!(first["etag"].is_string());
    assert!(first.get("data").is_none());

    let second = body_json(&engine.execute_request(InboundRequest::new("GET", "/")).await);
    assert_eq!(second["initialEtag"], first["etag"]);
    assert_eq!(second["afterReadEtag"], first["etag"]);
    assert_ne!(second["etag"], second["initialEtag"]);
    assert_eq!(second["data"], json!({ "store": "this" }));
}

#[tokio::test]
async fn test_storage_is_persisted_between_runtimes() {
    let dir = tempfile::tempdir().unwrap();
    let config = RuntimeConfig {
        storage_file: Some(dir.path().join("storage.json")),
        ..RuntimeConfig::default()
    };

    let engine = RuntimeEngine::new(config.clone(), HandlerSource::source("storage-set-query")).unwrap();
    engine
        .execute_request(InboundRequest::new("GET", "/?count=1"))
        .await;

    let restarted = RuntimeEngine::new(config, HandlerSource::source("storage-set-query")).unwrap();
    let (value, etag) = restarted.storage().peek();
    assert_eq!(value, Some(json!({ "count": "1" })));
    assert!(matches!(etag, Etag::Tag(_)));
}

#[tokio::test]
async fn test_conflicting_writers_see_current_value() {
    let storage = Arc::new(StorageCell::new());
    let handler = Handler::with_context(|ctx, cb| {
        ctx.storage.get();
        let stale = ExpectedEtag::Tag("stale".to_string());
        tokio::spawn(async move {
            let result = ctx
                .storage
                .set(Some(json!({ "v": 2 })), SetOptions::expecting(stale))
                .await;
            cb.done(result.map(|_| json!({ "written": true })));
        });
        Ok(())
    });
    let engine = RuntimeEngine::builder(RuntimeConfig::default())
        .storage(Arc::clone(&storage))
        .build(handler.into())
        .unwrap();

    storage.get();
    storage
        .set(Some(json!({ "v": 1 })), SetOptions::default())
        .await
        .unwrap();

    let response = engine.execute_request(InboundRequest::new("GET", "/")).await;
    assert_eq!(response.status, 400);
    let body = body_json(&response);
    assert_eq!(body["name"], "StorageError");
    assert_eq!(body["message"], "Item was modified since it was read.");
    assert_eq!(storage.peek().0, Some(json!({ "v": 1 })));
}

#[tokio::test]
async fn test_configured_envelope_is_stamped_with_a_signed_token() {
    let mut config = RuntimeConfig {
        signing_secret: Some("dev-secret".to_string()),
        container: "tenant".to_string(),
        ..RuntimeConfig::default()
    };
    config
        .envelope
        .secrets
        .insert("api_key".to_string(), "k".to_string());

    let handler = Handler::with_context(|ctx, cb| {
        cb.succeed(&json!({ "token": ctx.token, "secrets": ctx.secrets, "container": ctx.container }));
        Ok(())
    });
    let engine = RuntimeEngine::new(config, handler.into()).unwrap();

    let body = body_json(&engine.execute_request(InboundRequest::new("GET", "/")).await);
    assert_eq!(body["secrets"], json!({ "api_key": "k" }));
    assert_eq!(body["container"], "tenant");
    let claims = HmacSigner::new("dev-secret")
        .verify(body["token"].as_str().unwrap())
        .unwrap();
    assert_eq!(claims.ten, "tenant");

    // An explicit envelope replaces the configured one entirely.
    let envelope = ParamEnvelope {
        parse_body: ParseBody::Never,
        ..ParamEnvelope::default()
    };
    let request = InboundRequest::new("GET", "/").with_header(ENVELOPE_HEADER, envelope.encode().unwrap());
    let body = body_json(&engine.execute_request(request).await);
    assert_eq!(body["secrets"], json!({}));
    assert_eq!(body["token"], Value::Null);
}

#[tokio::test]
async fn test_synchronous_errors_map_to_unhandled_exception() {
    let engine = RuntimeEngine::new(
        RuntimeConfig::default(),
        Handler::raw(|_ctx, _req, _res| Err(ScriptError::new("boom"))).into(),
    )
    .unwrap();
    let response = engine.execute_request(InboundRequest::new("GET", "/")).await;
    assert_eq!(response.status, 500);
    let body = body_json(&response);
    assert_eq!(body["error"], "Script generated an unhandled synchronous exception.");
    assert_eq!(body["details"], "Error: boom");
}
