//! Radix-tree request router.
//!
//! One tree for method-agnostic patterns plus one tree per HTTP method.
//! O(path-length) lookup via [`matchit`]. You register a pattern, you get a
//! handler.
//!
//! Pattern syntax:
//!
//! | Pattern                | Matches                           |
//! |------------------------|-----------------------------------|
//! | `/healthz`             | any method, exact path            |
//! | `GET /users/{id}`      | `GET` only, `id` captured         |
//! | `/static/{*path}`      | any method, everything below      |
//!
//! A method-specific route wins over a method-agnostic one for the same path.

use std::collections::HashMap;
use std::sync::Arc;

use http::{Method, StatusCode};
use matchit::Router as MatchitRouter;

use crate::handler::{BoxFuture, BoxedHandler, Handler};
use crate::request::Request;
use crate::response::{IntoResponse, Response};

/// The application router.
///
/// Build it once at startup. Registration is not synchronised: it must
/// finish before the router starts serving.
#[derive(Clone, Default)]
pub struct Router {
    any: MatchitRouter<BoxedHandler>,
    by_method: HashMap<Method, MatchitRouter<BoxedHandler>>,
}

/// The outcome of a lookup.
enum Lookup {
    Found(BoxedHandler, HashMap<String, String>),
    MethodNotAllowed(Vec<Method>),
    NotFound,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `pattern`. Returns `self` for chaining.
    ///
    /// ```rust
    /// # use minserver::{Request, Response, Router};
    /// # async fn get_user(_: Request) -> Response { Response::text("") }
    /// # async fn health(_: Request) -> Response { Response::text("") }
    /// let router = Router::new()
    ///     .route("GET /users/{id}", get_user)
    ///     .route("/healthz", health);
    /// ```
    ///
    /// # Panics
    ///
    /// Panics if the pattern is malformed or conflicts with one already
    /// registered for the same method.
    pub fn route(mut self, pattern: &str, handler: impl Handler) -> Self {
        self.insert(pattern, Arc::new(handler));
        self
    }

    /// Registers an already-erased handler. See [`Router::route`].
    ///
    /// # Panics
    ///
    /// Same as [`Router::route`].
    pub fn insert(&mut self, pattern: &str, handler: BoxedHandler) {
        let (method, path) = split_pattern(pattern);
        let tree = match method {
            Some(method) => self.by_method.entry(method).or_default(),
            None => &mut self.any,
        };
        tree.insert(path, handler)
            .unwrap_or_else(|e| panic!("invalid route `{pattern}`: {e}"));
    }

    fn lookup(&self, method: &Method, path: &str) -> Lookup {
        let matched = self.by_method.get(method)
            .and_then(|tree| tree.at(path).ok())
            .or_else(|| self.any.at(path).ok());

        if let Some(matched) = matched {
            let handler = Arc::clone(matched.value);
            let params = matched.params.iter()
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .collect();
            return Lookup::Found(handler, params);
        }

        let mut allowed: Vec<Method> = self.by_method.iter()
            .filter(|(_, tree)| tree.at(path).is_ok())
            .map(|(m, _)| m.clone())
            .collect();
        if allowed.is_empty() {
            return Lookup::NotFound;
        }
        allowed.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Lookup::MethodNotAllowed(allowed)
    }
}

impl Handler for Router {
    fn call(&self, mut req: Request) -> BoxFuture {
        match self.lookup(req.method(), req.path()) {
            Lookup::Found(handler, params) => {
                req.set_params(params);
                handler.call(req)
            }
            Lookup::MethodNotAllowed(allowed) => {
                let allow = allowed.iter().map(Method::as_str).collect::<Vec<_>>().join(", ");
                let res = Response::builder()
                    .status(StatusCode::METHOD_NOT_ALLOWED)
                    .header("allow", &allow)
                    .text("405 method not allowed");
                Box::pin(async move { res })
            }
            Lookup::NotFound => {
                Box::pin(async { (StatusCode::NOT_FOUND, "404 page not found").into_response() })
            }
        }
    }
}

/// Splits `"GET /path"` into its method and path. Patterns without a
/// recognisable method prefix are method-agnostic.
fn split_pattern(pattern: &str) -> (Option<Method>, &str) {
    match pattern.split_once(' ') {
        Some((method, path)) if path.starts_with('/') => {
            match Method::from_bytes(method.as_bytes()) {
                Ok(method) => (Some(method), path.trim_start()),
                Err(_) => (None, pattern),
            }
        }
        _ => (None, pattern),
    }
}
