//! Handler trait and type erasure.
//!
//! # How async handlers are stored
//!
//! The router and the middleware chain need to hold handlers of *different*
//! types uniformly, so every handler is erased into a [`BoxedHandler`]
//! (`Arc<dyn Handler>`). Middleware consumes one `BoxedHandler` and produces
//! another.
//!
//! ```text
//! async fn hello(req: Request) -> Response { … }   ← user writes this
//!        ↓ server.add_route("/", hello)
//! Arc::new(hello)                                  ← BoxedHandler
//!        ↓  wrapped by each middleware, outermost first
//! handler.call(req)  at request time               ← one vtable dispatch per layer
//!        ↓
//! Box::pin(async { hello(req).await.into_response() })  ← BoxFuture
//! ```
//!
//! Types can implement [`Handler`] directly; [`Static`](crate::Static) and
//! the [`Router`](crate::Router) both do.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::request::Request;
use crate::response::{IntoResponse, Response};

/// A heap-allocated, type-erased future that resolves to a [`Response`].
///
/// `Send + 'static` lets tokio move the future across worker threads.
pub type BoxFuture = Pin<Box<dyn Future<Output = Response> + Send + 'static>>;

/// A request handler: route handlers, the router itself, and every layer a
/// middleware produces.
///
/// Implemented automatically for any `async fn` (or closure) with the shape:
///
/// ```text
/// async fn name(req: Request) -> impl IntoResponse
/// ```
///
/// A handler is shared by every request it serves, so it must be
/// `Send + Sync` and must not assume exclusive access to captured state.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, req: Request) -> BoxFuture;
}

/// A type-erased handler shared across concurrent requests.
pub type BoxedHandler = Arc<dyn Handler>;

impl<F, Fut, R> Handler for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
    fn call(&self, req: Request) -> BoxFuture {
        let fut = (self)(req);
        Box::pin(async move { fut.await.into_response() })
    }
}

/// Erases a handler.
pub fn boxed(handler: impl Handler) -> BoxedHandler {
    Arc::new(handler)
}
