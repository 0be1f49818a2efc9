//! Request completion logging.
//!
//! For every request the middleware spawns a detached task that waits for
//! the request's [`Context`] to finish and then emits exactly one
//! [`LogRecord`]. The response path never waits for it.
//!
//! The final status is captured by a [`LoggingWriter`] when the wrapped
//! handler hands its response back. The server finishes the request context
//! only after the whole middleware chain has returned, so the task always
//! reads the status after the handler's write. If the context finishes
//! first (deadline, client disconnect) or the handler never answers, the
//! record carries status `0`.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};

use http::{Method, StatusCode};
use tracing::Level;

use crate::context::{Context, ContextError};
use crate::handler::BoxedHandler;
use crate::middleware::Middleware;
use crate::request::Request;

/// One completed request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRecord {
    pub level: Level,
    /// `[<status>] <METHOD> <path>`
    pub message: String,
    /// `0` when the handler never produced a response.
    pub status: u16,
    pub method: Method,
    pub path: String,
    /// Set only when the context finished for a reason other than ordinary
    /// cancellation.
    pub ctx_error: Option<ContextError>,
}

/// Destination for [`LogRecord`]s. Emission is fire-and-forget.
pub trait LogSink: Send + Sync + 'static {
    fn emit(&self, record: LogRecord);
}

impl<F> LogSink for F
where
    F: Fn(LogRecord) + Send + Sync + 'static,
{
    fn emit(&self, record: LogRecord) {
        (self)(record)
    }
}

/// Forwards records to [`tracing`] with `status`, `method`, `path` and
/// `ctx_error` fields.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn emit(&self, record: LogRecord) {
        let ctx_error = record.ctx_error.map(tracing::field::display);
        if record.level == Level::ERROR {
            tracing::error!(
                status = record.status,
                method = %record.method,
                path = %record.path,
                ctx_error,
                "{}", record.message
            );
        } else {
            tracing::info!(
                status = record.status,
                method = %record.method,
                path = %record.path,
                ctx_error,
                "{}", record.message
            );
        }
    }
}

/// Per-request status capture.
///
/// Holds what the record needs from the request (method, path, context)
/// and the first status written through it. Clones share the status.
#[derive(Clone)]
pub struct LoggingWriter {
    method: Method,
    path: String,
    ctx: Context,
    status: Arc<AtomicU16>,
}

impl LoggingWriter {
    pub fn new(req: &Request) -> Self {
        Self {
            method: req.method().clone(),
            path: req.path().to_owned(),
            ctx: req.context().clone(),
            status: Arc::new(AtomicU16::new(0)),
        }
    }

    /// Captures `status` if nothing was captured yet. Returns `true` if this
    /// write was the one captured.
    pub fn write_status(&self, status: StatusCode) -> bool {
        self.status
            .compare_exchange(0, status.as_u16(), Ordering::Release, Ordering::Relaxed)
            .is_ok()
    }

    /// The captured status, `0` if none.
    pub fn status(&self) -> u16 {
        self.status.load(Ordering::Acquire)
    }

    /// Waits for the request context to finish, then builds the record.
    pub async fn finish(self) -> LogRecord {
        let reason = self.ctx.done().await;
        let status = self.status();
        LogRecord {
            level: level_for(status, reason),
            message: format!("[{status}] {} {}", self.method, self.path),
            status,
            method: self.method,
            path: self.path,
            ctx_error: (reason != ContextError::Canceled).then_some(reason),
        }
    }
}

impl fmt::Debug for LoggingWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoggingWriter")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("status", &self.status())
            .finish()
    }
}

/// Info only for a response below 400 on a request that finished by
/// ordinary cancellation. Everything else, including no response at all
/// and deadline expiry, is an error.
fn level_for(status: u16, reason: ContextError) -> Level {
    if status == 0 || status >= 400 || reason != ContextError::Canceled {
        Level::ERROR
    } else {
        Level::INFO
    }
}

/// Completion-logging middleware. See the [module docs](self).
#[derive(Clone)]
pub struct Logging {
    sink: Arc<dyn LogSink>,
}

/// [`Logging`] writing to [`TracingSink`].
pub fn logging() -> Logging {
    Logging::new(TracingSink)
}

impl Logging {
    pub fn new(sink: impl LogSink) -> Self {
        Self { sink: Arc::new(sink) }
    }
}

impl Default for Logging {
    fn default() -> Self {
        logging()
    }
}

impl Middleware for Logging {
    fn wrap(&self, next: BoxedHandler) -> BoxedHandler {
        let sink = Arc::clone(&self.sink);
        Arc::new(move |req: Request| {
            let next = Arc::clone(&next);
            let sink = Arc::clone(&sink);
            async move {
                let writer = LoggingWriter::new(&req);
                let pending = writer.clone();
                tokio::spawn(async move { sink.emit(pending.finish().await) });

                let res = next.call(req).await;
                writer.write_status(res.status_code());
                res
            }
        })
    }
}
