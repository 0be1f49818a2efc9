//! End-to-end tests: a real `Server` on 127.0.0.1:0 driven by a hyper client.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Level;

use minserver::middleware::{self, LogRecord, Logging};
use minserver::{Context, ContextError, Error, Request, Response, Server, ServerConfig, Static};

type HttpClient = Client<HttpConnector, Full<Bytes>>;

fn client() -> HttpClient {
    Client::builder(TokioExecutor::new()).build_http()
}

fn local_server() -> Server {
    Server::with_config(ServerConfig::default().addr("127.0.0.1:0"))
}

/// Starts `server` in the background and waits until it is listening.
async fn spawn(server: Server) -> (Arc<Server>, JoinHandle<Result<(), Error>>, String) {
    let server = Arc::new(server);
    let handle = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.start().await }
    });
    let addr = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(addr) = server.local_addr() {
                return addr;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("server did not start listening");
    (server, handle, format!("http://{addr}"))
}

async fn send(client: &HttpClient, method: Method, url: &str) -> (StatusCode, Bytes) {
    let req = http::Request::builder()
        .method(method)
        .uri(url)
        .body(Full::default())
        .unwrap();
    let res = client.request(req).await.unwrap();
    let status = res.status();
    let body = res.into_body().collect().await.unwrap().to_bytes();
    (status, body)
}

fn timeout_ctx(d: Duration) -> (Context, minserver::CancelGuard) {
    Context::background().with_timeout(d)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_start_lets_exactly_one_through() {
    let server = Arc::new(local_server());
    let barrier = Arc::new(tokio::sync::Barrier::new(2));

    let mut starts = tokio::task::JoinSet::new();
    for _ in 0..2 {
        let server = Arc::clone(&server);
        let barrier = Arc::clone(&barrier);
        starts.spawn(async move {
            barrier.wait().await;
            server.start().await
        });
    }

    // The loser returns immediately; the winner serves until shutdown.
    let first = starts.join_next().await.unwrap().unwrap();
    assert!(matches!(first, Err(Error::AlreadyStarted)), "{first:?}");
    assert!(server.is_running());

    while server.local_addr().is_none() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let (ctx, _release) = timeout_ctx(Duration::from_secs(5));
    server.shutdown(&ctx).await.unwrap();

    let second = starts.join_next().await.unwrap().unwrap();
    assert!(second.is_ok(), "{second:?}");
}

#[tokio::test]
async fn lifecycle_errors() {
    let server = local_server();
    assert!(matches!(
        server.shutdown(&Context::background()).await,
        Err(Error::NotStarted)
    ));

    let (server, handle, _) = spawn(server).await;
    assert!(matches!(server.start().await, Err(Error::AlreadyStarted)));

    let (ctx, _release) = timeout_ctx(Duration::from_secs(5));
    server.shutdown(&ctx).await.unwrap();
    handle.await.unwrap().unwrap();
    assert!(!server.is_running());

    assert!(matches!(server.shutdown(&ctx).await, Err(Error::NotRunning)));
    // One-shot: a stopped server is never restarted.
    assert!(matches!(server.start().await, Err(Error::AlreadyStarted)));
}

#[tokio::test]
async fn bind_failure_is_surfaced() {
    let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = taken.local_addr().unwrap().to_string();

    let server = Server::with_config(ServerConfig::default().addr(addr));
    assert!(matches!(server.start().await, Err(Error::Io(_))));
}

#[tokio::test]
async fn routes_static_files_through_middleware() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("app.js"), b"console.log(1)").unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel::<LogRecord>();
    let mut server = local_server();
    server.add_middleware(Logging::new(move |record: LogRecord| {
        let _ = tx.send(record);
    }));
    server.add_route(
        "/static/{*path}",
        Static::builder().paths("/static/", dir.path()).build().unwrap(),
    );
    server.add_route_fn("GET /users/{id}", |req: Request| async move {
        Response::text(format!("user {}", req.param("id").unwrap_or("?")))
    });

    let (server, handle, base) = spawn(server).await;
    let client = client();

    let (status, body) = send(&client, Method::GET, &format!("{base}/static/app.js")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"console.log(1)");

    let (status, _) = send(&client, Method::POST, &format!("{base}/static/app.js")).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);

    let (status, _) = send(&client, Method::GET, &format!("{base}/static/../Cargo.toml")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(&client, Method::GET, &format!("{base}/users/7")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"user 7");

    let (status, _) = send(&client, Method::GET, &format!("{base}/nowhere")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let mut records = Vec::new();
    for _ in 0..5 {
        let record = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        records.push(record);
    }
    records.sort_by_key(|r| (r.path.clone(), r.method.to_string()));

    let levels: Vec<_> = records.iter().map(|r| (r.status, r.level)).collect();
    assert!(levels.contains(&(200, Level::INFO)));
    assert!(levels.contains(&(405, Level::ERROR)));
    assert!(levels.contains(&(400, Level::ERROR)));
    assert!(levels.contains(&(404, Level::ERROR)));
    assert!(records.iter().all(|r| r.ctx_error.is_none()));

    let (ctx, _release) = timeout_ctx(Duration::from_secs(5));
    server.shutdown(&ctx).await.unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn deadline_expiry_is_logged_as_error() {
    let (tx, mut rx) = mpsc::unbounded_channel::<LogRecord>();
    let mut server = local_server();
    server.add_middleware(middleware::deadline(Duration::from_millis(50)));
    server.add_middleware(Logging::new(move |record: LogRecord| {
        let _ = tx.send(record);
    }));
    // Answers long after its deadline.
    server.add_route_fn("/slow", |_req: Request| async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Response::status(StatusCode::SERVICE_UNAVAILABLE)
    });

    let (server, handle, base) = spawn(server).await;
    let (status, _) = send(&client(), Method::GET, &format!("{base}/slow")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let record = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, 0);
    assert_eq!(record.level, Level::ERROR);
    assert_eq!(record.ctx_error, Some(ContextError::DeadlineExceeded));

    let (ctx, _release) = timeout_ctx(Duration::from_secs(5));
    server.shutdown(&ctx).await.unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn shutdown_drains_in_flight_requests() {
    let mut server = local_server();
    server.add_route_fn("/work", |_req: Request| async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        "done"
    });

    let (server, handle, base) = spawn(server).await;
    let request = tokio::spawn(async move { send(&client(), Method::GET, &format!("{base}/work")).await });

    // Let the request reach the handler.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let (ctx, _release) = timeout_ctx(Duration::from_secs(5));
    server.shutdown(&ctx).await.unwrap();

    let (status, body) = request.await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"done");
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn shutdown_deadline_abandons_stuck_requests() {
    let mut server = local_server();
    server.add_route_fn("/stuck", |_req: Request| async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        "late"
    });

    let (server, handle, base) = spawn(server).await;
    let request = tokio::spawn(async move {
        let req = http::Request::get(format!("{base}/stuck")).body(Full::default()).unwrap();
        client().request(req).await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (ctx, _release) = timeout_ctx(Duration::from_millis(100));
    let err = server.shutdown(&ctx).await.unwrap_err();
    assert!(matches!(err, Error::Context(ContextError::DeadlineExceeded)), "{err:?}");

    // The transport still stops, and the stuck request is cut off.
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(request.await.unwrap().is_err());
}
