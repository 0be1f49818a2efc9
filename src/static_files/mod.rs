//! Static file handler.
//!
//! ```rust,no_run
//! use minserver::{Server, Static};
//!
//! let assets = Static::builder()
//!     .paths("/static/", "./public")
//!     .build()
//!     .unwrap();
//!
//! let mut server = Server::new();
//! server.add_route("/static/{*path}", assets);
//! ```
//!
//! Only `GET` and `OPTIONS` are served. Any URL path containing `..` is
//! rejected with `400 Bad Request` before the filesystem is consulted.

mod fs;
mod serve;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use http::{Method, StatusCode};
use tracing::warn;

use crate::error::Error;
use crate::handler::{BoxFuture, Handler};
use crate::request::Request;
use crate::response::{IntoResponse, Response};

pub use fs::{DirFs, FileSystem, Metadata};
pub use serve::serve_file;

/// Serves files from a root under a URL prefix.
///
/// The prefix and filesystem are fixed at construction.
#[derive(Clone)]
pub struct Static {
    prefix: String,
    base_path: PathBuf,
    fs: Arc<dyn FileSystem>,
}

impl Static {
    pub fn builder() -> StaticBuilder {
        StaticBuilder::default()
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

impl Handler for Static {
    fn call(&self, req: Request) -> BoxFuture {
        if req.method() != Method::GET && req.method() != Method::OPTIONS {
            return Box::pin(async { Response::status(StatusCode::METHOD_NOT_ALLOWED) });
        }

        let path = match urlencoding::decode(req.path()) {
            Ok(path) => path.into_owned(),
            Err(_) => {
                return Box::pin(async {
                    (StatusCode::BAD_REQUEST, "400 Bad Request").into_response()
                });
            }
        };
        if path.contains("..") {
            warn!(path = %path, "minserver: static file request with ..");
            return Box::pin(async { Response::status(StatusCode::BAD_REQUEST) });
        }

        let relative = path.strip_prefix(self.prefix.as_str()).unwrap_or(path.as_str()).to_owned();
        let fs = Arc::clone(&self.fs);
        Box::pin(async move { serve_file(fs.as_ref(), &req, &relative).await })
    }
}

/// Options for [`Static`], applied in call order.
#[derive(Default)]
pub struct StaticBuilder {
    prefix: Option<String>,
    base_path: Option<PathBuf>,
    fs: Option<Arc<dyn FileSystem>>,
}

impl StaticBuilder {
    /// URL prefix stripped before lookup. Default `/`.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Filesystem root. Default: the current working directory.
    pub fn base_path(mut self, base_path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(base_path.into());
        self
    }

    /// Sets both the prefix and the filesystem root.
    pub fn paths(self, prefix: impl Into<String>, base_path: impl Into<PathBuf>) -> Self {
        self.prefix(prefix).base_path(base_path)
    }

    /// Serves from `fs` instead of a [`DirFs`] at the base path.
    pub fn filesystem(mut self, fs: impl FileSystem) -> Self {
        self.fs = Some(Arc::new(fs));
        self
    }

    /// # Errors
    ///
    /// [`Error::BasePath`] if no base path was given and the current working
    /// directory cannot be resolved.
    pub fn build(self) -> Result<Static, Error> {
        let base_path = match self.base_path.filter(|p| !p.as_os_str().is_empty()) {
            Some(path) => path,
            None => std::env::current_dir().map_err(Error::BasePath)?,
        };
        let prefix = self.prefix.filter(|p| !p.is_empty()).unwrap_or_else(|| "/".to_owned());
        let fs = self.fs.unwrap_or_else(|| Arc::new(DirFs::new(&base_path)));
        Ok(Static { prefix, base_path, fs })
    }
}
