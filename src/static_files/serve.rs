//! Serving one file out of a [`FileSystem`].
//!
//! Handles what a browser expects from a plain file server: content type by
//! extension, `Last-Modified` / `If-Modified-Since`, single byte ranges,
//! `index.html` for directories, and 404 / 403 for missing or unreadable
//! entries. Multi-range requests are answered with the whole file.

use std::io;
use std::time::{SystemTime, UNIX_EPOCH};

use http::{Method, StatusCode};

use crate::request::Request;
use crate::response::{IntoResponse, Response};
use crate::static_files::fs::{FileSystem, Metadata};

const INDEX: &str = "index.html";

/// Serves `name` (slash-separated, relative to the filesystem root) in
/// answer to `req`.
///
/// `HEAD` is answered with headers only. [`Static`](crate::Static) never
/// passes `HEAD` through; this is for callers building their own handler
/// on top of `serve_file`.
pub async fn serve_file(fs: &dyn FileSystem, req: &Request, name: &str) -> Response {
    // `/dir/index.html` is served as `/dir/`.
    if let Some(dir) = req.path().strip_suffix(INDEX).filter(|d| d.ends_with('/')) {
        return redirect(dir);
    }

    let mut name = clean(name);
    let mut meta = match fs.stat(&name).await {
        Ok(meta) => meta,
        Err(e) => return error_response(&e),
    };

    if meta.is_dir {
        if !req.path().ends_with('/') {
            return redirect(&format!("{}/", req.path()));
        }
        let index = if name == "." { INDEX.to_owned() } else { format!("{name}/{INDEX}") };
        match fs.stat(&index).await {
            Ok(index_meta) if !index_meta.is_dir => {
                name = index;
                meta = index_meta;
            }
            // No directory listings.
            _ => return (StatusCode::NOT_FOUND, "404 page not found").into_response(),
        }
    }

    if is_not_modified(req, &meta) {
        return Response::builder()
            .status(StatusCode::NOT_MODIFIED)
            .header("last-modified", &last_modified(&meta).unwrap_or_default())
            .no_body();
    }

    let body = match fs.read(&name).await {
        Ok(body) => body,
        Err(e) => return error_response(&e),
    };
    let len = body.len() as u64;
    let content_type = mime_guess::from_path(&name).first_or_octet_stream();

    let mut builder = Response::builder().header("accept-ranges", "bytes");
    if let Some(modified) = last_modified(&meta) {
        builder = builder.header("last-modified", &modified);
    }

    let (builder, body) = match parse_range(req.header("range"), len) {
        ByteRange::Full => (builder, body),
        ByteRange::Partial(start, end) => (
            builder
                .status(StatusCode::PARTIAL_CONTENT)
                .header("content-range", &format!("bytes {start}-{end}/{len}")),
            body.slice(start as usize..=end as usize),
        ),
        ByteRange::Unsatisfiable => {
            return Response::builder()
                .status(StatusCode::RANGE_NOT_SATISFIABLE)
                .header("content-range", &format!("bytes */{len}"))
                .text("invalid range");
        }
    };

    if req.method() == Method::HEAD {
        return builder.header("content-type", content_type.as_ref()).no_body();
    }
    builder.bytes(content_type.as_ref(), body)
}

/// Strips leading slashes; the root is `"."`.
fn clean(name: &str) -> String {
    let name = name.trim_start_matches('/').trim_end_matches('/');
    if name.is_empty() { ".".to_owned() } else { name.to_owned() }
}

fn redirect(location: &str) -> Response {
    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header("location", location)
        .no_body()
}

fn error_response(err: &io::Error) -> Response {
    match err.kind() {
        io::ErrorKind::NotFound => (StatusCode::NOT_FOUND, "404 page not found").into_response(),
        io::ErrorKind::PermissionDenied => (StatusCode::FORBIDDEN, "403 Forbidden").into_response(),
        io::ErrorKind::InvalidInput => (StatusCode::BAD_REQUEST, "400 Bad Request").into_response(),
        _ => {
            tracing::error!(error = %err, "minserver: static file error");
            (StatusCode::INTERNAL_SERVER_ERROR, "500 Internal Server Error").into_response()
        }
    }
}

fn last_modified(meta: &Metadata) -> Option<String> {
    meta.modified
        .filter(|m| *m > UNIX_EPOCH)
        .map(httpdate::fmt_http_date)
}

fn is_not_modified(req: &Request, meta: &Metadata) -> bool {
    if req.method() != Method::GET && req.method() != Method::HEAD {
        return false;
    }
    let (Some(modified), Some(since)) = (
        meta.modified,
        req.header("if-modified-since").and_then(|v| httpdate::parse_http_date(v).ok()),
    ) else {
        return false;
    };
    // HTTP dates have one-second resolution.
    secs(modified) <= secs(since)
}

fn secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

#[derive(Debug, PartialEq, Eq)]
enum ByteRange {
    Full,
    /// Inclusive bounds.
    Partial(u64, u64),
    Unsatisfiable,
}

fn parse_range(header: Option<&str>, len: u64) -> ByteRange {
    let Some(ranges) = header.and_then(|h| h.trim().strip_prefix("bytes=")) else {
        return ByteRange::Full;
    };
    if ranges.contains(',') {
        return ByteRange::Full;
    }
    let Some((start, end)) = ranges.split_once('-') else {
        return ByteRange::Unsatisfiable;
    };

    let range = match (start.trim(), end.trim()) {
        ("", suffix) => suffix.parse::<u64>().ok()
            .filter(|n| *n > 0 && len > 0)
            .map(|n| (len.saturating_sub(n), len - 1)),
        (start, "") => start.parse::<u64>().ok()
            .filter(|s| *s < len)
            .map(|s| (s, len - 1)),
        (start, end) => match (start.parse::<u64>(), end.parse::<u64>()) {
            (Ok(s), Ok(e)) if s <= e && s < len => Some((s, e.min(len - 1))),
            _ => None,
        },
    };

    match range {
        Some((start, end)) => ByteRange::Partial(start, end),
        None => ByteRange::Unsatisfiable,
    }
}
