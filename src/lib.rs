//! # minserver
//!
//! A minimal HTTP server toolkit: a router, a composable middleware chain,
//! a lifecycle-managed server, and a guarded static-file handler.
//!
//! ## The contract
//!
//! - **Routing**: radix-tree lookup via [`matchit`], optional method prefix
//!   (`"GET /users/{id}"`).
//! - **Middleware**: `handler → handler` functions. The first one added is
//!   the outermost layer.
//! - **Lifecycle**: [`Server::start`] / [`Server::shutdown`] are a one-shot
//!   state machine guarded by a compare-and-swap; shutdown drains in-flight
//!   connections within a deadline.
//! - **Cancellation**: every request carries a [`Context`] that finishes
//!   when the request is torn down, its deadline passes, or its parent
//!   finishes.
//!
//! Not here: templating, sessions, cookies, body parsing.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use minserver::{Request, Response, Server, Static, middleware};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), minserver::Error> {
//!     let mut server = Server::new();
//!     server.add_middleware(middleware::deadline(Duration::from_secs(3)));
//!     server.add_middleware(middleware::logging());
//!
//!     server.add_route_fn("GET /users/{id}", get_user);
//!     server.add_route("/static/{*path}", Static::builder().paths("/static/", "./public").build()?);
//!
//!     server.run_until_signal(Duration::from_secs(20)).await
//! }
//!
//! async fn get_user(req: Request) -> Response {
//!     let id = req.param("id").unwrap_or("unknown");
//!     Response::json(format!(r#"{{"id":"{id}"}}"#))
//! }
//! ```

mod error;
mod handler;
mod request;
mod response;
mod router;
mod server;

pub mod context;
pub mod middleware;
pub mod static_files;

pub use context::{CancelGuard, Context, ContextError};
pub use error::Error;
pub use handler::{BoxFuture, BoxedHandler, Handler, boxed};
pub use request::Request;
pub use response::{IntoResponse, Response, ResponseBuilder};
pub use router::Router;
pub use server::{ADDR_ENV, DEFAULT_ADDR, Server, ServerConfig};
pub use static_files::{Static, StaticBuilder};
