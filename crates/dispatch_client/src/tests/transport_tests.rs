use super::*;
use std::time::Duration;

use axum::{
    http::{HeaderMap, StatusCode},
    routing::{any, get},
    Json, Router,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;

async fn handle_echo(method: axum::http::Method, headers: HeaderMap, body: String) -> Json<Value> {
    let step = headers
        .get("x-install-step")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    Json(json!({
        "method": method.as_str(),
        "step": step,
        "body": body,
    }))
}

async fn handle_missing() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "no such host")
}

async fn handle_slow() -> &'static str {
    tokio::time::sleep(Duration::from_secs(10)).await;
    "late"
}

async fn spawn_install_api() -> anyhow::Result<String> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let app = Router::new()
        .route("/api/echo", any(handle_echo))
        .route("/api/missing", get(handle_missing))
        .route("/api/slow", get(handle_slow));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(format!("http://{addr}"))
}

fn request(resource: &str, options: DispatchOptions) -> TransportRequest {
    TransportRequest {
        resource: ResourceId::parse(resource).expect("resource"),
        options,
    }
}

#[tokio::test]
async fn applies_method_headers_and_body() {
    let server_url = spawn_install_api().await.expect("spawn server");
    let transport = HttpTransport::with_base_url(&server_url).expect("transport");
    let options = DispatchOptions::post("X").with_header("X-Install-Step", "database");

    let response = transport
        .send(request("/api/echo", options), CancellationToken::new())
        .await
        .expect("send");

    assert_eq!(response.status, 200);
    assert!(response
        .header("Content-Type")
        .is_some_and(|value| value.starts_with("application/json")));
    let echoed: Value = response.json().expect("json");
    assert_eq!(echoed["method"], "POST");
    assert_eq!(echoed["step"], "database");
    assert_eq!(echoed["body"], "X");
}

#[tokio::test]
async fn defaults_to_get_without_body() {
    let server_url = spawn_install_api().await.expect("spawn server");
    let transport = HttpTransport::with_base_url(&server_url).expect("transport");

    let response = transport
        .send(
            request("/api/echo", DispatchOptions::default()),
            CancellationToken::new(),
        )
        .await
        .expect("send");

    let echoed: Value = response.json().expect("json");
    assert_eq!(echoed["method"], "GET");
    assert_eq!(echoed["step"], Value::Null);
    assert_eq!(echoed["body"], "");
}

#[tokio::test]
async fn error_status_is_returned_as_response() {
    let server_url = spawn_install_api().await.expect("spawn server");
    let transport = HttpTransport::with_base_url(&server_url).expect("transport");

    let response = transport
        .send(
            request("/api/missing", DispatchOptions::default()),
            CancellationToken::new(),
        )
        .await
        .expect("404 is not a transport failure");

    assert_eq!(response.status, 404);
    assert_eq!(response.text(), "no such host");
}

#[tokio::test]
async fn cancelling_token_aborts_outstanding_request() {
    let server_url = spawn_install_api().await.expect("spawn server");
    let transport = HttpTransport::with_base_url(&server_url).expect("transport");
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let result = tokio::time::timeout(
        Duration::from_secs(2),
        transport.send(request("/api/slow", DispatchOptions::default()), cancel),
    )
    .await
    .expect("cancellation must be prompt");

    assert!(matches!(result, Err(TransportError::Cancelled)));
}

#[tokio::test]
async fn pre_cancelled_token_never_sends() {
    let transport = HttpTransport::with_base_url("http://127.0.0.1:9").expect("transport");
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = transport
        .send(request("/api/echo", DispatchOptions::default()), cancel)
        .await
        .expect_err("cancelled");

    assert!(err.is_cancelled());
}

#[tokio::test]
async fn connection_failure_is_not_cancellation() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");

    let transport = HttpTransport::with_base_url(&format!("http://{addr}")).expect("transport");
    let err = transport
        .send(
            request("/api/echo", DispatchOptions::default()),
            CancellationToken::new(),
        )
        .await
        .expect_err("nothing listening");

    assert!(matches!(err, TransportError::Request(_)));
    assert!(!err.is_cancelled());
}

#[test]
fn resolves_paths_against_base_url() {
    let transport = HttpTransport::with_base_url("http://installer.local:8080/").expect("transport");
    let resource = ResourceId::parse("/api/validate?field=hostname").expect("resource");

    let url = transport.resolve(&resource).expect("resolve");

    assert_eq!(
        url.as_str(),
        "http://installer.local:8080/api/validate?field=hostname"
    );
}

#[test]
fn absolute_resource_needs_no_base_url() {
    let transport = HttpTransport::new();
    assert!(transport.base_url().is_none());

    let absolute = ResourceId::parse("https://example.com/api/ping").expect("resource");
    assert_eq!(
        transport.resolve(&absolute).expect("resolve").as_str(),
        "https://example.com/api/ping"
    );

    let relative = ResourceId::parse("/api/ping").expect("resource");
    let err = transport.resolve(&relative).expect_err("relative without base");
    assert!(matches!(err, TransportError::InvalidUrl { .. }));
}

#[test]
fn rejects_malformed_base_url() {
    let err = HttpTransport::with_base_url("not a url").expect_err("malformed");
    assert!(matches!(err, TransportError::InvalidUrl { .. }));
}

#[test]
fn maps_every_method() {
    assert_eq!(reqwest_method(RequestMethod::Get), Method::GET);
    assert_eq!(reqwest_method(RequestMethod::Head), Method::HEAD);
    assert_eq!(reqwest_method(RequestMethod::Post), Method::POST);
    assert_eq!(reqwest_method(RequestMethod::Put), Method::PUT);
    assert_eq!(reqwest_method(RequestMethod::Patch), Method::PATCH);
    assert_eq!(reqwest_method(RequestMethod::Delete), Method::DELETE);
}

#[test]
fn base_url_without_trailing_slash_keeps_its_last_segment() {
    let transport = HttpTransport::with_base_url("http://installer.local/api").expect("transport");
    assert_eq!(
        transport.base_url().map(Url::as_str),
        Some("http://installer.local/api/")
    );

    let relative = ResourceId::parse("validate?field=port").expect("resource");
    assert_eq!(
        transport.resolve(&relative).expect("resolve").as_str(),
        "http://installer.local/api/validate?field=port"
    );

    let rooted = ResourceId::parse("/health").expect("resource");
    assert_eq!(
        transport.resolve(&rooted).expect("resolve").as_str(),
        "http://installer.local/health"
    );
}
