pub mod assets;
pub mod files;

use std::convert::Infallible;
use std::io::{self, ErrorKind};
use std::time::Duration;

use hyper::header::{ALLOW, LOCATION};
use hyper::http::response::Builder;
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Method, Request, Response, StatusCode};
use tokio::net::{TcpListener, TcpStream};

use crate::signal::{Shutdown, ShutdownListener};
use crate::state::State;

/// Requests below this prefix are served from the workspace.
pub const STREAM_PREFIX: &str = "/stream";

/// Serves HTTP on `listener` until `shutdown` is triggered.
///
/// Once triggered no new connections are accepted and every open connection is closed after
/// its in-flight request completes. Returns once all connections are closed, or `timeout`
/// elapsed.
pub async fn serve(
    listener: TcpListener,
    state: State,
    shutdown: Shutdown,
    timeout: Option<Duration>,
) -> io::Result<()> {
    let accept_shutdown = shutdown.listen();

    loop {
        let (stream, addr) = tokio::select! {
            res = listener.accept() => match res {
                Ok(conn) => conn,
                Err(err) if is_connection_error(&err) => {
                    tracing::debug!("Failed to accept connection: {}", err);
                    continue;
                }
                Err(err) => return Err(err),
            },
            _ = accept_shutdown.recv() => break,
        };

        tracing::debug!("Accepted connection from {}", addr);

        let state = state.clone();
        let conn_shutdown = shutdown.listen();
        tokio::task::spawn(async move {
            serve_connection(stream, state, conn_shutdown).await;
        });
    }

    drop(listener);
    drop(accept_shutdown);

    match timeout {
        Some(timeout) => {
            if tokio::time::timeout(timeout, shutdown.wait()).await.is_err() {
                tracing::warn!(
                    "Gave up waiting on {} connections after {:?}",
                    shutdown.listeners(),
                    timeout
                );
            }
        }
        None => shutdown.wait().await,
    }

    Ok(())
}

async fn serve_connection(stream: TcpStream, state: State, shutdown: ShutdownListener) {
    let service = service_fn(move |req| {
        let state = state.clone();
        async move { Ok::<_, Infallible>(handle(req, &state).await) }
    });

    let conn = Http::new().serve_connection(stream, service);
    tokio::pin!(conn);

    let res = tokio::select! {
        res = conn.as_mut() => res,
        _ = shutdown.recv() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };

    if let Err(err) = res {
        tracing::debug!("Failed to serve connection: {}", err);
    }
}

async fn handle(req: Request<Body>, state: &State) -> Response<Body> {
    tracing::debug!("{} {}", req.method(), req.uri());

    let mut resp = match *req.method() {
        Method::GET | Method::HEAD => route(&req, state).await,
        _ => {
            return finish(
                Response::builder()
                    .status(StatusCode::METHOD_NOT_ALLOWED)
                    .header(ALLOW, "GET, HEAD"),
                Body::empty(),
            )
        }
    };

    if req.method() == Method::HEAD {
        *resp.body_mut() = Body::empty();
    }

    resp
}

async fn route(req: &Request<Body>, state: &State) -> Response<Body> {
    let path = req.uri().path();

    match path.strip_prefix(STREAM_PREFIX) {
        Some("") => finish(
            Response::builder()
                .status(StatusCode::MOVED_PERMANENTLY)
                .header(LOCATION, format!("{}/", STREAM_PREFIX)),
            Body::empty(),
        ),
        Some(file) if file.starts_with('/') => files::serve(state.workspace(), file, req).await,
        _ => assets::serve(path),
    }
}

fn is_connection_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::ConnectionRefused | ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset
    )
}

/// Returns a response with the given status code and its reason phrase as the body.
pub(crate) fn status(status: StatusCode) -> Response<Body> {
    let mut resp = Response::new(Body::from(status.canonical_reason().unwrap_or_default()));
    *resp.status_mut() = status;
    resp
}

/// Builds the response, falling back to a 500 if the builder contains an invalid part.
pub(crate) fn finish(builder: Builder, body: Body) -> Response<Body> {
    match builder.body(body) {
        Ok(resp) => resp,
        Err(err) => {
            tracing::error!("Failed to build response: {}", err);
            status(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
