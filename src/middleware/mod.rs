//! Middleware layer.
//!
//! A middleware turns one [`BoxedHandler`] into another. It is the place for
//! cross-cutting concerns: completion logging, request deadlines, header
//! inspection.
//!
//! Middleware registered first is the **outermost** layer: it sees the
//! request first and the response last.
//!
//! ```text
//! compose([a, b, c], router)  ==  a(b(c(router)))
//!
//!   request ──► a ──► b ──► c ──► router
//!   response ◄── a ◄── b ◄── c ◄──┘
//! ```
//!
//! Composition has no side effects; everything a middleware does happens
//! when the composed handler is called.
//!
//! Built-in middleware:
//! - [`Deadline`]: default per-request deadline
//! - [`Logging`]: one structured record per request, emitted once the
//!   request's context finishes
//!
//! Add [`Deadline`] before [`Logging`]. Logging waits on the context it is
//! handed, so only a deadline layered outside it shows up in the record as
//! status `0` with `ctx_error = DeadlineExceeded`.

mod deadline;
mod logging;

use std::sync::Arc;

use crate::handler::BoxedHandler;

pub use deadline::{Deadline, deadline};
pub use logging::{LogRecord, LogSink, Logging, LoggingWriter, TracingSink, logging};

/// Transforms a handler into another handler.
///
/// Implemented for any `Fn(BoxedHandler) -> BoxedHandler` closure:
///
/// ```rust
/// use std::sync::Arc;
/// use minserver::{BoxedHandler, Request};
///
/// let add_header = |next: BoxedHandler| -> BoxedHandler {
///     Arc::new(move |req: Request| {
///         let next = Arc::clone(&next);
///         async move {
///             let mut res = next.call(req).await;
///             res.headers_mut().insert("x-served-by", "minserver".parse().unwrap());
///             res
///         }
///     })
/// };
/// # let _: &dyn minserver::middleware::Middleware = &add_header;
/// ```
pub trait Middleware: Send + Sync + 'static {
    fn wrap(&self, next: BoxedHandler) -> BoxedHandler;
}

impl<F> Middleware for F
where
    F: Fn(BoxedHandler) -> BoxedHandler + Send + Sync + 'static,
{
    fn wrap(&self, next: BoxedHandler) -> BoxedHandler {
        (self)(next)
    }
}

/// Wraps `terminal` in `middleware`, first element outermost.
pub fn compose(middleware: &[Arc<dyn Middleware>], terminal: BoxedHandler) -> BoxedHandler {
    middleware.iter().rev().fold(terminal, |next, mw| mw.wrap(next))
}
