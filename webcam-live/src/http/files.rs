//! Serving files from a directory on disk.

use std::fmt::Write;
use std::io::{self, ErrorKind, SeekFrom};
use std::ops::RangeInclusive;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hyper::header::{
    ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, IF_MODIFIED_SINCE, LAST_MODIFIED,
    LOCATION, RANGE,
};
use hyper::{Body, Request, Response, StatusCode};
use mime_guess::mime;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use super::{finish, status};

/// Serves `path` relative to `root`. `path` is the request path with the route prefix already
/// removed; `req` is the full request.
pub async fn serve(root: &Path, path: &str, req: &Request<Body>) -> Response<Body> {
    let file_path = match resolve(root, path) {
        Some(file_path) => file_path,
        None => return status(StatusCode::BAD_REQUEST),
    };

    let metadata = match tokio::fs::metadata(&file_path).await {
        Ok(metadata) => metadata,
        Err(err) => return io_error(err),
    };

    if metadata.is_dir() {
        // Relative links in the listing only resolve correctly with a trailing slash.
        if !path.ends_with('/') {
            let location = format!("{}/", req.uri().path());
            return finish(
                Response::builder()
                    .status(StatusCode::MOVED_PERMANENTLY)
                    .header(LOCATION, location),
                Body::empty(),
            );
        }

        return match list_dir(&file_path).await {
            Ok(listing) => finish(
                Response::builder()
                    .header(CONTENT_TYPE, "text/html; charset=utf-8")
                    .header(CONTENT_LENGTH, listing.len()),
                Body::from(listing),
            ),
            Err(err) => io_error(err),
        };
    }

    match serve_file(&file_path, req).await {
        Ok(resp) => resp,
        Err(err) => io_error(err),
    }
}

async fn serve_file(path: &Path, req: &Request<Body>) -> io::Result<Response<Body>> {
    let mut file = File::open(path).await?;

    // ffmpeg replaces the playlist while it is being served. Everything below describes the
    // opened handle, not the path.
    let metadata = file.metadata().await?;
    let len = metadata.len();
    let modified = metadata.modified().ok().map(truncate_secs);

    if let Some(modified) = modified {
        if !is_modified_since(req, modified) {
            return Ok(finish(
                Response::builder()
                    .status(StatusCode::NOT_MODIFIED)
                    .header(LAST_MODIFIED, httpdate::fmt_http_date(modified)),
                Body::empty(),
            ));
        }
    }

    let mut builder = Response::builder()
        .header(CONTENT_TYPE, content_type(path))
        .header(ACCEPT_RANGES, "bytes");

    if let Some(modified) = modified {
        builder = builder.header(LAST_MODIFIED, httpdate::fmt_http_date(modified));
    }

    let range = req
        .headers()
        .get(RANGE)
        .and_then(|value| value.to_str().ok())
        .map(|value| ByteRange::parse(value, len))
        .unwrap_or(ByteRange::Full);

    let resp = match range {
        ByteRange::Full => finish(
            builder.header(CONTENT_LENGTH, len),
            stream_body(file.take(len)),
        ),
        ByteRange::Partial(range) => {
            let (start, end) = range.into_inner();
            let count = end - start + 1;
            file.seek(SeekFrom::Start(start)).await?;

            finish(
                builder
                    .status(StatusCode::PARTIAL_CONTENT)
                    .header(CONTENT_RANGE, format!("bytes {}-{}/{}", start, end, len))
                    .header(CONTENT_LENGTH, count),
                stream_body(file.take(count)),
            )
        }
        ByteRange::Unsatisfiable => finish(
            builder
                .status(StatusCode::RANGE_NOT_SATISFIABLE)
                .header(CONTENT_RANGE, format!("bytes */{}", len)),
            Body::empty(),
        ),
    };

    Ok(resp)
}

fn stream_body<R>(reader: R) -> Body
where
    R: AsyncRead + Send + 'static,
{
    Body::wrap_stream(ReaderStream::new(reader))
}

/// Resolves the url path `path` to a path inside `root`. Returns `None` if the path is not
/// valid or would leave `root`.
fn resolve(root: &Path, path: &str) -> Option<PathBuf> {
    let path = urlencoding::decode(path).ok()?;

    let mut file_path = root.to_owned();
    for segment in path.split('/') {
        match segment {
            "" | "." => (),
            ".." => return None,
            segment => {
                // Reject anything that is not a plain name on this platform, e.g. `C:` or
                // segments containing a backslash.
                let mut components = Path::new(segment).components();
                match (components.next(), components.next()) {
                    (Some(Component::Normal(name)), None) => file_path.push(name),
                    _ => return None,
                }
            }
        }
    }

    Some(file_path)
}

async fn list_dir(path: &Path) -> io::Result<String> {
    let mut names = Vec::new();

    let mut entries = tokio::fs::read_dir(path).await?;
    while let Some(entry) = entries.next_entry().await? {
        let mut name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type().await?.is_dir() {
            name.push('/');
        }

        names.push(name);
    }

    names.sort();

    let mut html = String::from(
        "<!doctype html>\n<meta name=\"viewport\" content=\"width=device-width\">\n<pre>\n",
    );
    for name in names {
        let _ = writeln!(
            html,
            "<a href=\"{}\">{}</a>",
            urlencoding::encode(&name).replace("%2F", "/"),
            html_escape::encode_text(&name)
        );
    }
    html.push_str("</pre>\n");

    Ok(html)
}

/// HTTP dates have a resolution of one second.
fn truncate_secs(time: SystemTime) -> SystemTime {
    match time.duration_since(UNIX_EPOCH) {
        Ok(since) => UNIX_EPOCH + Duration::from_secs(since.as_secs()),
        Err(_) => time,
    }
}

fn is_modified_since(req: &Request<Body>, modified: SystemTime) -> bool {
    let since = req
        .headers()
        .get(IF_MODIFIED_SINCE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| httpdate::parse_http_date(value).ok());

    match since {
        Some(since) => modified > since,
        None => true,
    }
}

fn io_error(err: io::Error) -> Response<Body> {
    match err.kind() {
        // A path through a regular file, e.g. `stream.m3u8/x`, does not exist either.
        ErrorKind::NotFound | ErrorKind::NotADirectory | ErrorKind::IsADirectory => {
            status(StatusCode::NOT_FOUND)
        }
        ErrorKind::PermissionDenied => status(StatusCode::FORBIDDEN),
        ErrorKind::InvalidInput => status(StatusCode::BAD_REQUEST),
        _ => {
            tracing::error!("Failed to read file: {}", err);
            status(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Returns the content type for a file based on its extension. Text types are served as UTF-8.
pub fn content_type(path: &Path) -> String {
    let mime = mime_guess::from_path(path).first_or_octet_stream();

    if mime.type_() == mime::TEXT && mime.get_param(mime::CHARSET).is_none() {
        format!("{}; charset=utf-8", mime)
    } else {
        mime.to_string()
    }
}

/// A single byte range requested through the `Range` header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ByteRange {
    /// No usable range was requested; serve the full content.
    Full,
    Partial(RangeInclusive<u64>),
    Unsatisfiable,
}

impl ByteRange {
    /// Parses the value of a `Range` header for content of length `len`. Multiple ranges and
    /// malformed values are ignored.
    pub fn parse(value: &str, len: u64) -> Self {
        let ranges = match http_range_header::parse_range_header(value) {
            Ok(ranges) => ranges,
            Err(_) => return Self::Full,
        };

        if ranges.ranges.len() != 1 {
            return Self::Full;
        }

        match ranges.validate(len) {
            Ok(mut ranges) if len > 0 => match ranges.pop() {
                Some(range) => Self::Partial(range),
                None => Self::Full,
            },
            _ => Self::Unsatisfiable,
        }
    }
}
