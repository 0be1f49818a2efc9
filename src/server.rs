//! HTTP server, lifecycle, and graceful shutdown.
//!
//! # Lifecycle
//!
//! A [`Server`] is a one-shot state machine:
//!
//! ```text
//!   idle ──start()──► running ──shutdown(ctx)──► stopped
//! ```
//!
//! - [`Server::start`] flips *idle → running* with a single compare-and-swap,
//!   binds the listener, and serves until shut down. A second `start`, even a
//!   concurrent one or one after shutdown, gets [`Error::AlreadyStarted`].
//! - [`Server::shutdown`] flips *running → stopped*, stops accepting, and
//!   waits for in-flight connections to drain or for `ctx` to finish,
//!   whichever comes first. Before any `start` it returns
//!   [`Error::NotStarted`]; afterwards [`Error::NotRunning`].
//!
//! # Graceful shutdown and Kubernetes
//!
//! When Kubernetes terminates a pod it sends **SIGTERM** and waits
//! `terminationGracePeriodSeconds` (default 30 s) before sending SIGKILL.
//! [`Server::run_until_signal`] maps that onto the lifecycle above: serve,
//! and on SIGTERM / Ctrl-C shut down with a grace period shorter than the
//! pod's.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use hyper_util::server::graceful::GracefulShutdown;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::context::Context;
use crate::error::Error;
use crate::handler::{BoxedHandler, Handler};
use crate::middleware::{Middleware, compose};
use crate::request::Request;
use crate::response::{IntoResponse, Response};
use crate::router::Router;

/// Default bind address: every interface, port 8000.
pub const DEFAULT_ADDR: &str = ":8000";

/// Environment variable read by [`ServerConfig::from_env`].
pub const ADDR_ENV: &str = "MINSERVER_ADDR";

/// Server settings.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// `host:port`, or `:port` for every interface.
    pub addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { addr: DEFAULT_ADDR.to_owned() }
    }
}

impl ServerConfig {
    pub fn addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = addr.into();
        self
    }

    /// Defaults, with the address overridden by `MINSERVER_ADDR` when set.
    pub fn from_env() -> Self {
        match std::env::var(ADDR_ENV) {
            Ok(addr) if !addr.trim().is_empty() => Self::default().addr(addr.trim()),
            _ => Self::default(),
        }
    }
}

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

/// What the accept loop has been asked to do. Ordered by severity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Stop {
    Serving,
    Graceful,
    Force,
}

/// The HTTP server.
///
/// Register routes and middleware, then call [`start`](Server::start).
/// Registration takes `&mut self` and must finish before `start`; the
/// lifecycle methods take `&self`, so share the server with an [`Arc`] to
/// call `shutdown` from another task.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use minserver::{Context, Request, Response, Server, ServerConfig, middleware};
///
/// # async fn run() -> Result<(), minserver::Error> {
/// let mut server = Server::with_config(ServerConfig::default().addr("127.0.0.1:3000"));
/// server.add_middleware(middleware::deadline(Duration::from_secs(3)));
/// server.add_middleware(middleware::logging());
/// server.add_route_fn("GET /hello", |_req: Request| async { Response::text("hello") });
///
/// let server = Arc::new(server);
/// let serving = tokio::spawn({
///     let server = Arc::clone(&server);
///     async move { server.start().await }
/// });
///
/// // ... later
/// let (ctx, _release) = Context::background().with_timeout(Duration::from_secs(10));
/// server.shutdown(&ctx).await?;
/// # let _ = serving.await;
/// # Ok(())
/// # }
/// ```
pub struct Server {
    config: ServerConfig,
    router: Router,
    middleware: Vec<Arc<dyn Middleware>>,
    state: AtomicU8,
    stop: watch::Sender<Stop>,
    drained: watch::Sender<bool>,
    local_addr: OnceLock<SocketAddr>,
}

impl Server {
    /// A server bound to [`DEFAULT_ADDR`] once started.
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    pub fn with_config(config: ServerConfig) -> Self {
        Self {
            config,
            router: Router::new(),
            middleware: Vec::new(),
            state: AtomicU8::new(IDLE),
            stop: watch::channel(Stop::Serving).0,
            drained: watch::channel(false).0,
            local_addr: OnceLock::new(),
        }
    }

    /// Appends a middleware. The first one added is the outermost layer.
    pub fn add_middleware(&mut self, mw: impl Middleware) {
        self.middleware.push(Arc::new(mw));
    }

    /// Registers a handler; see [`Router::route`] for the pattern syntax.
    ///
    /// # Panics
    ///
    /// Panics if the pattern is malformed or already registered.
    pub fn add_route(&mut self, pattern: &str, handler: impl Handler) {
        self.router.insert(pattern, Arc::new(handler));
    }

    /// Registers an async function or closure.
    ///
    /// # Panics
    ///
    /// Same as [`Server::add_route`].
    pub fn add_route_fn<F, Fut, R>(&mut self, pattern: &str, handler: F)
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoResponse + Send + 'static,
    {
        self.add_route(pattern, handler);
    }

    /// The router wrapped in every registered middleware.
    ///
    /// This is what the transport dispatches to; it can also be called
    /// directly, in-process. Each call runs under a child of the request's
    /// context that is cancelled once the chain has returned (or the call
    /// is dropped), so completion logging fires for in-process requests too.
    pub fn handler(&self) -> BoxedHandler {
        with_teardown(compose(&self.middleware, Arc::new(self.router.clone())))
    }

    /// The configured bind address.
    pub fn addr(&self) -> &str {
        &self.config.addr
    }

    /// The bound address, once [`start`](Server::start) has bound it.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == RUNNING
    }

    /// Binds the configured address and serves until [`shutdown`](Server::shutdown).
    ///
    /// Returns `Ok(())` once a shutdown has drained (or abandoned) every
    /// connection.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyStarted`] if this server was started before.
    /// - [`Error::Io`] if the address cannot be bound.
    pub async fn start(&self) -> Result<(), Error> {
        if self
            .state
            .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::AlreadyStarted);
        }
        let _drained = DrainedOnExit(&self.drained);

        let listener = TcpListener::bind(bind_addr(&self.config.addr)).await?;
        let local = listener.local_addr()?;
        let _ = self.local_addr.set(local);

        info!(addr = %local, "minserver: starting on {}", self.config.addr);
        serve(listener, self.handler(), self.stop.subscribe()).await;
        Ok(())
    }

    /// Stops accepting connections and waits for in-flight ones to finish,
    /// bounded by `ctx`.
    ///
    /// # Errors
    ///
    /// - [`Error::NotStarted`] before any [`start`](Server::start).
    /// - [`Error::NotRunning`] if already shut down.
    /// - [`Error::Context`] if `ctx` finished before the drain did. The
    ///   remaining connections are then dropped.
    pub async fn shutdown(&self, ctx: &Context) -> Result<(), Error> {
        match self.state.compare_exchange(RUNNING, STOPPED, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => {}
            Err(IDLE) => return Err(Error::NotStarted),
            Err(_) => return Err(Error::NotRunning),
        }

        info!("minserver: shutting down");
        self.stop.send_replace(Stop::Graceful);

        let mut drained = self.drained.subscribe();
        tokio::select! {
            biased;
            () = wait_drained(&mut drained) => Ok(()),
            reason = ctx.done() => {
                self.stop.send_replace(Stop::Force);
                Err(Error::Context(reason))
            }
        }
    }

    /// Serves until SIGTERM or Ctrl-C, then shuts down allowing `grace` for
    /// in-flight requests.
    ///
    /// # Errors
    ///
    /// Whatever [`start`](Server::start) or [`shutdown`](Server::shutdown)
    /// return; a startup error wins.
    pub async fn run_until_signal(&self, grace: Duration) -> Result<(), Error> {
        let serving = self.start();
        tokio::pin!(serving);

        tokio::select! {
            // Poll `start` first so the server is marked running before any
            // signal is handled.
            biased;
            res = &mut serving => return res,
            () = shutdown_signal() => {}
        }

        info!(grace_ms = grace.as_millis() as u64, "shutdown signal received");
        let (ctx, _release) = Context::background().with_timeout(grace);
        let (served, shut) = tokio::join!(serving, self.shutdown(&ctx));
        served?;
        shut
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

/// Marks the server drained when `start` returns, however it returns.
struct DrainedOnExit<'a>(&'a watch::Sender<bool>);

impl Drop for DrainedOnExit<'_> {
    fn drop(&mut self) {
        self.0.send_replace(true);
    }
}

/// `":8000"` means every interface.
fn bind_addr(addr: &str) -> String {
    if addr.starts_with(':') { format!("0.0.0.0{addr}") } else { addr.to_owned() }
}

async fn wait_stop(rx: &mut watch::Receiver<Stop>, at_least: Stop) {
    // A closed channel means the server is gone: stop as well.
    let _ = rx.wait_for(|stop| *stop >= at_least).await;
}

async fn wait_drained(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|drained| *drained).await;
}

// ── Accept loop ───────────────────────────────────────────────────────────────

async fn serve(listener: TcpListener, handler: BoxedHandler, mut stop: watch::Receiver<Stop>) {
    let builder = ConnBuilder::new(TokioExecutor::new());
    let graceful = GracefulShutdown::new();

    // Every connection task, so a forced shutdown can abort what is left.
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            // Check shutdown first so it wins over queued connections.
            biased;

            () = wait_stop(&mut stop, Stop::Graceful) => break,

            res = listener.accept() => {
                let (stream, remote_addr) = match res {
                    Ok(v) => v,
                    Err(e) => {
                        error!("accept error: {e}");
                        continue;
                    }
                };

                let handler = Arc::clone(&handler);
                // Called once per request on the connection.
                let svc = service_fn(move |req| dispatch(Arc::clone(&handler), req));

                // `auto::Builder` speaks HTTP/1.1 and HTTP/2, whichever the
                // client negotiates. `graceful` can ask it to finish up.
                let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), svc);
                let conn = graceful.watch(conn.into_owned());

                tasks.spawn(async move {
                    if let Err(e) = conn.await {
                        debug!(peer = %remote_addr, "connection error: {e}");
                    }
                });
            }

            // Reap finished connection tasks so the set stays small.
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
        }
    }

    drop(listener);
    info!(in_flight = tasks.len(), "minserver: draining connections");

    tokio::select! {
        () = graceful.shutdown() => {}
        () = wait_stop(&mut stop, Stop::Force) => {
            warn!(remaining = tasks.len(), "minserver: shutdown deadline elapsed, dropping connections");
            tasks.abort_all();
        }
    }
    while tasks.join_next().await.is_some() {}

    info!("minserver: stopped");
}

// ── Request dispatch ──────────────────────────────────────────────────────────

/// Gives every request its own cancellable context for the duration of the
/// call. The context finishes after the whole chain has returned, or when
/// the call is dropped because the client went away.
fn with_teardown(chain: BoxedHandler) -> BoxedHandler {
    Arc::new(move |req: Request| {
        let chain = Arc::clone(&chain);
        async move {
            let (ctx, _teardown) = req.context().with_cancel();
            chain.call(req.with_context(ctx)).await
        }
    })
}

/// Runs one request from the transport through [`Server::handler`].
async fn dispatch(
    handler: BoxedHandler,
    req: hyper::Request<Incoming>,
) -> Result<http::Response<Full<Bytes>>, Infallible> {
    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!("failed to read request body: {e}");
            return Ok(Response::status(StatusCode::BAD_REQUEST).into_inner());
        }
    };

    let req = Request::from_parts(parts, body, Context::background());
    let response = handler.call(req).await;
    Ok(response.into_inner())
}

// ── Shutdown signal ───────────────────────────────────────────────────────────

/// Resolves on the first shutdown signal the process receives.
///
/// On Unix this listens for both **SIGTERM** and **SIGINT** (Ctrl-C).
/// On Windows only Ctrl-C is available.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("cannot listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c  => {}
        () = sigterm => {}
    }
}

#[cfg(test)]
mod tests {
    use http::Method;
    use tokio::sync::mpsc;
    use tracing::Level;

    use super::*;
    use crate::context::ContextError;
    use crate::middleware::{LogRecord, Logging, deadline};

    #[test]
    fn bare_port_binds_every_interface() {
        assert_eq!(bind_addr(":8000"), "0.0.0.0:8000");
        assert_eq!(bind_addr("127.0.0.1:0"), "127.0.0.1:0");
    }

    #[test]
    fn default_config() {
        let server = Server::new();
        assert_eq!(server.addr(), ":8000");
        assert!(!server.is_running());
        assert!(server.local_addr().is_none());
    }

    #[tokio::test]
    async fn shutdown_before_start_is_not_started() {
        let server = Server::new();
        let err = server.shutdown(&Context::background()).await.unwrap_err();
        assert!(matches!(err, Error::NotStarted));
    }

    #[tokio::test]
    async fn handler_applies_middleware_around_router() {
        let mut server = Server::new();
        server.add_route_fn("GET /hi", |_req: Request| async { "hi" });
        server.add_middleware(|next: BoxedHandler| -> BoxedHandler {
            Arc::new(move |req: Request| {
                let next = Arc::clone(&next);
                async move {
                    let mut res = next.call(req).await;
                    res.headers_mut().insert("x-wrapped", http::HeaderValue::from_static("1"));
                    res
                }
            })
        });

        let handler = server.handler();
        let res = handler.call(Request::new(Method::GET, "/hi".parse().unwrap())).await;
        assert_eq!(res.status_code(), StatusCode::OK);
        assert_eq!(res.headers()["x-wrapped"], "1");

        let res = handler.call(Request::new(Method::GET, "/nope".parse().unwrap())).await;
        assert_eq!(res.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(res.headers()["x-wrapped"], "1");
    }

    fn channel_logging() -> (Logging, mpsc::UnboundedReceiver<LogRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = move |record: LogRecord| {
            let _ = tx.send(record);
        };
        (Logging::new(sink), rx)
    }

    #[tokio::test]
    async fn in_process_call_logs_exactly_one_record() {
        let (logging, mut rx) = channel_logging();
        let mut server = Server::new();
        server.add_middleware(logging);
        server.add_route_fn("GET /hi", |_req: Request| async { "hi" });

        let res = server.handler().call(Request::new(Method::GET, "/hi".parse().unwrap())).await;
        assert_eq!(res.status_code(), StatusCode::OK);

        let record = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("no record for an in-process call")
            .unwrap();
        assert_eq!(record.status, 200);
        assert_eq!(record.level, Level::INFO);
        assert_eq!(record.ctx_error, None);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn deadline_outside_logging_reports_expiry() {
        let (logging, mut rx) = channel_logging();
        let mut server = Server::new();
        server.add_middleware(deadline(Duration::from_millis(50)));
        server.add_middleware(logging);
        server.add_route_fn("/slow", |_req: Request| async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            "late"
        });

        let call = tokio::spawn({
            let handler = server.handler();
            async move { handler.call(Request::new(Method::GET, "/slow".parse().unwrap())).await }
        });

        let record = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, 0);
        assert_eq!(record.level, Level::ERROR);
        assert_eq!(record.ctx_error, Some(ContextError::DeadlineExceeded));
        assert_eq!(call.await.unwrap().status_code(), StatusCode::OK);
    }
}
