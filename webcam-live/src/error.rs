use std::io;

use thiserror::Error;

use crate::config;

/// An error that stops the service.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] config::Error),
    #[error("failed to create workspace: {0}")]
    Workspace(#[source] io::Error),
    #[error("failed to start {program}: {source}")]
    Capture {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to register signal handlers: {0}")]
    Signal(#[source] io::Error),
    #[error("http server failed: {0}")]
    Serve(#[source] io::Error),
    #[error("failed to remove workspace: {0}")]
    Cleanup(#[source] io::Error),
}
