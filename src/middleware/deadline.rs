//! Default request deadline.

use std::sync::Arc;
use std::time::Duration;

use crate::handler::BoxedHandler;
use crate::middleware::Middleware;
use crate::request::Request;

/// Gives every request without a deadline one `timeout` from now.
///
/// Requests that already carry a deadline pass through untouched, so this
/// never shortens an existing deadline. The derived context is released
/// when the wrapped handler returns, is dropped, or panics.
#[derive(Clone, Copy, Debug)]
pub struct Deadline {
    timeout: Duration,
}

/// Shorthand for [`Deadline::new`].
///
/// ```rust
/// use std::time::Duration;
/// use minserver::{Server, middleware};
///
/// let mut server = Server::new();
/// server.add_middleware(middleware::deadline(Duration::from_secs(3)));
/// ```
pub fn deadline(timeout: Duration) -> Deadline {
    Deadline::new(timeout)
}

impl Deadline {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Middleware for Deadline {
    fn wrap(&self, next: BoxedHandler) -> BoxedHandler {
        let timeout = self.timeout;
        Arc::new(move |req: Request| {
            let next = Arc::clone(&next);
            async move {
                if req.context().deadline().is_some() {
                    return next.call(req).await;
                }
                let (ctx, _release) = req.context().with_timeout(timeout);
                next.call(req.with_context(ctx)).await
            }
        })
    }
}
