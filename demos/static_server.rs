//! Static file server with request logging and a per-request deadline.
//!
//! Run with:
//!   RUST_LOG=info cargo run --example static_server -- ./public
//!
//! Try:
//!   curl -i http://localhost:8000/static/index.html
//!   curl -i http://localhost:8000/static/../Cargo.toml    # 400
//!   curl -i http://localhost:8000/hello/world
//!
//! The bind address comes from `MINSERVER_ADDR` (default `:8000`).

use std::time::Duration;

use minserver::{Request, Response, Server, ServerConfig, Static, middleware};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), minserver::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let root = std::env::args().nth(1).unwrap_or_else(|| ".".to_owned());

    let mut server = Server::with_config(ServerConfig::from_env());
    server.add_middleware(middleware::deadline(Duration::from_secs(3)));
    server.add_middleware(middleware::logging());

    server.add_route("/static/{*path}", Static::builder().paths("/static/", root).build()?);
    server.add_route_fn("GET /hello/{name}", hello);

    server.run_until_signal(Duration::from_secs(20)).await
}

// GET /hello/{name}
async fn hello(req: Request) -> Response {
    let name = req.param("name").unwrap_or("stranger");
    Response::text(format!("hello, {name}\n"))
}
