//! End-to-end interception through real clients.
//!
//! Each test starts its own upstream servers on ephemeral ports and talks to
//! them through an intercepted `reqwest` client or the hyper tower layer.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use netscope::adapters::hyper::build_http_client;
use netscope::config::RecorderConfig;
use netscope::model::{Method, MockKind, Request, Response, TransportErrorKind};
use netscope::recorder::EvictionReason;
use netscope::{
    Engine, InterceptLayer, InterceptOption, MockResponse, MockRule, NetscopeConfig,
    ReqwestInterceptExt, RuleMatcher, TransactionEvent,
};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::TcpListener;
use tower::{Layer, ServiceExt};

/// Upstream that answers `"<name> <METHOD> <path>"`.
async fn start_server(name: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let service = hyper::service::service_fn(move |req: hyper::Request<Incoming>| async move {
                    let body = format!("{name} {} {}", req.method(), req.uri().path());
                    Ok::<_, Infallible>(
                        hyper::Response::builder()
                            .header("content-type", "text/plain")
                            .header("x-served-by", name)
                            .body(Full::new(Bytes::from(body)))
                            .unwrap(),
                    )
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    addr
}

fn http_client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

#[tokio::test]
async fn test_pass_through_records_response() {
    let upstream = start_server("upstream").await;
    let engine = Engine::builder().build().unwrap();
    let client = http_client().intercepted(Arc::clone(&engine));

    let response = client
        .send(client.get(format!("http://{upstream}/v1/ping")))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["x-served-by"], "upstream");
    assert_eq!(response.text().await.unwrap(), "upstream GET /v1/ping");

    let recorded = engine.recorder().snapshot();
    assert_eq!(recorded.len(), 1);
    let transaction = &recorded[0];
    assert_eq!(transaction.adapter, "reqwest");
    assert_eq!(transaction.request.url().path(), "/v1/ping");
    assert!(transaction.mock.is_none());

    let recorded_response = transaction.response().unwrap();
    assert_eq!(recorded_response.status(), 200);
    assert_eq!(recorded_response.body_bytes(), b"upstream GET /v1/ping");
    assert_eq!(
        recorded_response.headers().get_str("x-served-by"),
        Some("upstream")
    );
    assert!(engine.recorder().pending().is_empty());
}

#[tokio::test]
async fn test_response_reads_like_uninstrumented_client() {
    let upstream = start_server("upstream").await;
    let mock = start_server("mock").await;
    let engine = Engine::builder()
        .rules(vec![MockRule::redirect(
            "moved",
            RuleMatcher::exact("/moved"),
            format!("http://{mock}/elsewhere"),
        )])
        .build()
        .unwrap();
    let plain = http_client();
    let client = http_client().intercepted(Arc::clone(&engine));

    let url = format!("http://{upstream}/v1/ping");
    let expected = plain.get(&url).send().await.unwrap();
    let intercepted = client.send(client.get(&url)).await.unwrap();
    assert_eq!(intercepted.url(), expected.url());
    assert_eq!(intercepted.remote_addr(), expected.remote_addr());
    assert_eq!(intercepted.remote_addr(), Some(upstream));
    assert_eq!(intercepted.version(), expected.version());

    let redirected = client
        .send(client.get(format!("http://{upstream}/moved")))
        .await
        .unwrap();
    assert_eq!(redirected.url().as_str(), format!("http://{mock}/elsewhere"));
    assert_eq!(redirected.remote_addr(), Some(mock));

    let recorded = engine.recorder().snapshot();
    assert_eq!(recorded[1].dialed_url(), redirected.url());
}

#[tokio::test]
async fn test_redirect_rule_only_matches_its_request() {
    let upstream = start_server("upstream").await;
    let mock = start_server("mock").await;
    let engine = Engine::builder()
        .rules(vec![MockRule::redirect(
            "user-42",
            RuleMatcher::exact("/users/42").method(Method::Get),
            format!("http://{mock}/mocked/users/42"),
        )])
        .build()
        .unwrap();
    let client = http_client().intercepted(Arc::clone(&engine));

    let mocked = client
        .send(client.get(format!("http://{upstream}/users/42")))
        .await
        .unwrap();
    assert_eq!(mocked.text().await.unwrap(), "mock GET /mocked/users/42");

    let other_id = client
        .send(client.get(format!("http://{upstream}/users/43")))
        .await
        .unwrap();
    assert_eq!(other_id.text().await.unwrap(), "upstream GET /users/43");

    let other_method = client
        .send(client.post(format!("http://{upstream}/users/42")).body("{}"))
        .await
        .unwrap();
    assert_eq!(other_method.text().await.unwrap(), "upstream POST /users/42");

    let recorded = engine.recorder().snapshot();
    assert_eq!(recorded.len(), 3);

    // The recorded request keeps the original URL
    let first = &recorded[0];
    assert_eq!(first.request.url().port(), Some(upstream.port()));
    let applied = first.mock.as_ref().unwrap();
    assert_eq!(applied.rule_id, "user-42");
    assert_eq!(applied.kind, MockKind::Redirect);
    assert_eq!(first.dialed_url().port(), Some(mock.port()));

    assert!(recorded[1].mock.is_none());
    assert!(recorded[2].mock.is_none());
    assert_eq!(recorded[2].request.body_bytes(), b"{}");
}

#[tokio::test]
async fn test_template_redirect_fills_captures() {
    let upstream = start_server("upstream").await;
    let mock = start_server("mock").await;
    let engine = Engine::builder()
        .rules(vec![MockRule::redirect(
            "orders",
            RuleMatcher::template("/shops/{shop}/orders/{order}"),
            format!("http://{mock}/fixtures/{{shop}}-{{order}}"),
        )])
        .build()
        .unwrap();
    let client = http_client().intercepted(Arc::clone(&engine));

    let response = client
        .send(client.get(format!("http://{upstream}/shops/7/orders/99")))
        .await
        .unwrap();
    assert_eq!(response.text().await.unwrap(), "mock GET /fixtures/7-99");
}

#[tokio::test]
async fn test_literal_mock_served_and_released() {
    let upstream = start_server("upstream").await;
    let endpoint = netscope::mock_endpoint::MockEndpoint::start("127.0.0.1", 0)
        .await
        .unwrap();
    let engine = Engine::builder()
        .endpoint(Arc::clone(&endpoint))
        .rules(vec![MockRule::respond(
            "flags",
            RuleMatcher::prefix("/flags"),
            MockResponse::new(418)
                .with_header("content-type", "application/json")
                .with_body(r#"{"dark_mode":true}"#),
        )])
        .build()
        .unwrap();
    let client = http_client().intercepted(Arc::clone(&engine));

    let response = client
        .send(client.get(format!("http://{upstream}/flags/web")))
        .await
        .unwrap();
    assert_eq!(response.status(), 418);
    assert_eq!(response.headers()["content-type"], "application/json");
    assert_eq!(response.text().await.unwrap(), r#"{"dark_mode":true}"#);

    assert_eq!(endpoint.staged_count(), 0);
    let recorded = engine.recorder().snapshot();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].mock.as_ref().unwrap().kind, MockKind::Literal);
    assert_eq!(recorded[0].dialed_url().port(), Some(endpoint.addr().port()));
    assert_eq!(recorded[0].response().unwrap().status(), 418);
}

#[tokio::test]
async fn test_engine_from_yaml_config() {
    let upstream = start_server("upstream").await;
    let mock = start_server("mock").await;
    let yaml = format!(
        r#"
recorder:
  capacity: 10
rules:
  - id: health
    match:
      method: get
      path:
        exact: /health
    respond:
      status: 200
      json:
        status: ok
  - id: api
    match:
      path:
        prefix: /api
    redirect: "http://{mock}/stub"
"#
    );
    let config = NetscopeConfig::from_yaml(&yaml).unwrap();
    let engine = Engine::from_config(&config).await.unwrap();
    assert!(engine.endpoint().is_some());
    assert_eq!(engine.recorder().capacity(), 10);

    let client = http_client().intercepted(Arc::clone(&engine));
    let health = client
        .send(client.get(format!("http://{upstream}/health")))
        .await
        .unwrap();
    assert_eq!(health.headers()["content-type"], "application/json");
    let body: serde_json::Value = health.json().await.unwrap();
    assert_eq!(body["status"], "ok");

    let api = client
        .send(client.get(format!("http://{upstream}/api/v2/things")))
        .await
        .unwrap();
    assert_eq!(api.text().await.unwrap(), "mock GET /stub");
}

#[tokio::test]
async fn test_hyper_layer_end_to_end() {
    let upstream = start_server("upstream").await;
    let mock = start_server("mock").await;
    let engine = Engine::builder()
        .rules(vec![MockRule::redirect(
            "search",
            RuleMatcher::exact("/search"),
            format!("http://{mock}/canned-search"),
        )])
        .build()
        .unwrap();
    let service = InterceptLayer::new(Arc::clone(&engine))
        .with_name("hyper-e2e")
        .layer(build_http_client().unwrap());

    let request = hyper::Request::builder()
        .method("POST")
        .uri(format!("http://{upstream}/search"))
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from_static(b"{\"q\":\"rust\"}")))
        .unwrap();
    let response = service.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), 200);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"mock POST /canned-search");

    let plain = hyper::Request::builder()
        .uri(format!("http://{upstream}/other"))
        .body(Full::new(Bytes::new()))
        .unwrap();
    let response = service.oneshot(plain).await.unwrap();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"upstream GET /other");

    let recorded = engine.recorder().snapshot();
    assert_eq!(recorded.len(), 2);
    assert_eq!(recorded[0].adapter, "hyper-e2e");
    assert_eq!(recorded[0].request.body_bytes(), b"{\"q\":\"rust\"}");
    assert_eq!(
        recorded[0].request.body().and_then(|b| b.content_type.as_deref()),
        Some("application/json")
    );
    assert_eq!(recorded[0].mock.as_ref().unwrap().rule_id, "search");
    assert_eq!(
        recorded[1].response().unwrap().body_bytes(),
        b"upstream GET /other"
    );
}

/// Inner client stand-in that answers with the URI it was asked to dial.
#[derive(Clone)]
struct EchoUri;

impl tower::Service<hyper::Request<Full<Bytes>>> for EchoUri {
    type Response = hyper::Response<Full<Bytes>>;
    type Error = Infallible;
    type Future = std::future::Ready<Result<Self::Response, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: hyper::Request<Full<Bytes>>) -> Self::Future {
        std::future::ready(Ok(hyper::Response::new(Full::new(Bytes::from(
            req.uri().to_string(),
        )))))
    }
}

#[tokio::test]
async fn test_layer_pass_through_keeps_uri_verbatim() {
    let engine = Engine::builder().build().unwrap();
    let service = InterceptLayer::new(Arc::clone(&engine)).layer(EchoUri);

    let request = hyper::Request::builder()
        .uri("http://Upstream.Internal:80/a/../b?q=1")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let response = service.oneshot(request).await.unwrap();
    let dialed = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&dialed[..], b"http://Upstream.Internal:80/a/../b?q=1");

    let recorded = engine.recorder().snapshot();
    assert_eq!(recorded.len(), 1);
    assert!(recorded[0].mock.is_none());
}

#[tokio::test]
async fn test_layer_conversion_failure_passes_through() {
    let engine = Engine::builder()
        .rules(vec![MockRule::redirect(
            "all",
            RuleMatcher::any(),
            "http://mocked.internal/",
        )])
        .build()
        .unwrap();
    let service = InterceptLayer::new(Arc::clone(&engine)).layer(EchoUri);

    // No scheme or authority: cannot become a canonical URL
    let request = hyper::Request::builder()
        .uri("/relative/only")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let response = service.oneshot(request).await.unwrap();
    let dialed = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&dialed[..], b"/relative/only");

    assert!(engine.recorder().is_empty());
    assert_eq!(engine.recorder().stats().started, 0);
}

#[tokio::test]
async fn test_connect_error_reaches_caller_and_is_recorded() {
    let closed = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let engine = Engine::builder().build().unwrap();
    let client = http_client().intercepted(Arc::clone(&engine));

    let err = client
        .send(client.get(format!("http://{closed}/unreachable")))
        .await
        .unwrap_err();
    assert!(err.is_connect());

    let recorded = engine.recorder().snapshot();
    assert_eq!(recorded.len(), 1);
    let failure = recorded[0].error().unwrap();
    assert_eq!(failure.kind, TransportErrorKind::Connect);
    assert!(recorded[0].response().is_none());
}

#[tokio::test]
async fn test_hyper_connect_error_is_recorded() {
    let closed = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let engine = Engine::builder().build().unwrap();
    let service = InterceptLayer::new(Arc::clone(&engine)).layer(build_http_client().unwrap());

    let request = hyper::Request::builder()
        .uri(format!("http://{closed}/"))
        .body(Full::new(Bytes::new()))
        .unwrap();
    assert!(service.oneshot(request).await.is_err());

    let recorded = engine.recorder().snapshot();
    assert_eq!(recorded.len(), 1);
    assert!(recorded[0].error().is_some());
}

#[tokio::test]
async fn test_streaming_body_passes_through_unrecorded() {
    let upstream = start_server("upstream").await;
    let engine = Engine::builder().build().unwrap();
    let client = http_client().intercepted(Arc::clone(&engine));

    let chunks: Vec<Result<&'static str, std::io::Error>> = vec![Ok("part-1,"), Ok("part-2")];
    let response = client
        .send(
            client
                .post(format!("http://{upstream}/upload"))
                .body(reqwest::Body::wrap_stream(futures::stream::iter(chunks))),
        )
        .await
        .unwrap();
    assert_eq!(response.text().await.unwrap(), "upstream POST /upload");

    assert!(engine.recorder().is_empty());
    assert_eq!(engine.recorder().stats().started, 0);
}

#[tokio::test]
async fn test_disabled_engine_records_nothing() {
    let upstream = start_server("upstream").await;
    let mock = start_server("mock").await;
    let engine = Engine::builder()
        .enabled(false)
        .rules(vec![MockRule::redirect(
            "all",
            RuleMatcher::any(),
            format!("http://{mock}/"),
        )])
        .build()
        .unwrap();
    let client = http_client().intercepted(Arc::clone(&engine));

    let response = client
        .send(client.get(format!("http://{upstream}/a")))
        .await
        .unwrap();
    assert_eq!(response.text().await.unwrap(), "upstream GET /a");
    assert!(engine.recorder().is_empty());

    engine.set_enabled(true);
    let response = client
        .send(client.get(format!("http://{upstream}/a")))
        .await
        .unwrap();
    assert_eq!(response.text().await.unwrap(), "mock GET /");
    assert_eq!(engine.recorder().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_through_layer() {
    let engine = Engine::builder()
        .recorder_config(RecorderConfig {
            capacity: 2000,
            pending_capacity: 2000,
            ..RecorderConfig::default()
        })
        .rules(vec![MockRule::redirect(
            "odd",
            RuleMatcher::template("/items/{id}/odd"),
            "http://mocked.internal/items/{id}",
        )])
        .build()
        .unwrap();

    let service = InterceptLayer::new(Arc::clone(&engine)).layer(EchoUri);

    let mut handles = Vec::new();
    for i in 0..1000u32 {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            let path = if i % 2 == 1 {
                format!("/items/{i}/odd")
            } else {
                format!("/items/{i}/even")
            };
            let request = hyper::Request::builder()
                .uri(format!("http://upstream.internal{path}"))
                .body(Full::new(Bytes::new()))
                .unwrap();
            let response = service.oneshot(request).await.unwrap();
            let dialed = response.into_body().collect().await.unwrap().to_bytes();
            (i, String::from_utf8(dialed.to_vec()).unwrap())
        }));
    }

    for handle in handles {
        let (i, dialed) = handle.await.unwrap();
        if i % 2 == 1 {
            assert_eq!(dialed, format!("http://mocked.internal/items/{i}"));
        } else {
            assert_eq!(dialed, format!("http://upstream.internal/items/{i}/even"));
        }
    }

    let recorded = engine.recorder().snapshot();
    assert_eq!(recorded.len(), 1000);
    let mut ids: Vec<u64> = recorded.iter().map(|t| t.id.get()).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 1000);
    assert_eq!(recorded.iter().filter(|t| t.mock.is_some()).count(), 500);
    assert!(recorded.iter().all(|t| t.response().is_some()));

    let stats = engine.recorder().stats();
    assert_eq!(stats.started, 1000);
    assert_eq!(stats.completed, 1000);
    assert_eq!(stats.pending, 0);
}

#[tokio::test]
async fn test_terminal_callback_runs_once() {
    let engine = Engine::builder().build().unwrap();
    let request = Request::parse("GET", "http://localhost:1/once", "manual").unwrap();
    let decision = engine.intercept(request, InterceptOption::new("manual"));

    assert!(decision.on_response(Response::new(204)).is_ok());
    let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
    assert!(decision.on_error(&io).is_err());
    assert!(decision.on_response(Response::new(500)).is_err());

    let recorded = engine.recorder().snapshot();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].response().unwrap().status(), 204);
}

#[tokio::test]
async fn test_events_follow_transaction_lifecycle() {
    let upstream = start_server("upstream").await;
    let engine = Engine::builder().build().unwrap();
    let mut events = engine.recorder().subscribe();
    let client = http_client().intercepted(Arc::clone(&engine));

    client
        .send(client.get(format!("http://{upstream}/evented")))
        .await
        .unwrap();

    let started = match events.recv().await.unwrap() {
        TransactionEvent::Started(t) => t,
        other => panic!("expected Started, got {other:?}"),
    };
    assert!(started.outcome.is_pending());
    match events.recv().await.unwrap() {
        TransactionEvent::Completed(t) => {
            assert_eq!(t.id, started.id);
            assert_eq!(t.response().unwrap().status(), 200);
        }
        other => panic!("expected Completed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_reaper_evicts_abandoned_transactions() {
    let endpoint = netscope::mock_endpoint::MockEndpoint::start("127.0.0.1", 0)
        .await
        .unwrap();
    let engine = Engine::builder()
        .endpoint(Arc::clone(&endpoint))
        .rules(vec![MockRule::respond(
            "stub",
            RuleMatcher::any(),
            MockResponse::new(200).with_body("stub"),
        )])
        .build()
        .unwrap();
    let mut events = engine.recorder().subscribe();

    let request = Request::parse("GET", "http://localhost:1/abandoned", "manual").unwrap();
    let decision = engine.intercept(request, InterceptOption::new("manual"));
    assert!(endpoint.is_staged(decision.id()));

    let reaper = engine.spawn_reaper(Duration::from_millis(10), Duration::ZERO);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(engine.recorder().pending().is_empty());
    assert!(!endpoint.is_staged(decision.id()));
    let mut saw_eviction = false;
    while let Ok(event) = events.try_recv() {
        if let TransactionEvent::Evicted { id, reason } = event {
            assert_eq!(id, decision.id());
            assert_eq!(reason, EvictionReason::Stale);
            saw_eviction = true;
        }
    }
    assert!(saw_eviction);

    // A late answer is still recorded
    decision.on_response(Response::new(200)).unwrap();
    let stats = engine.recorder().stats();
    assert_eq!(stats.late_completions, 1);
    assert_eq!(stats.retained, 1);

    drop(engine);
    tokio::time::timeout(Duration::from_secs(1), reaper)
        .await
        .unwrap()
        .unwrap();
}
