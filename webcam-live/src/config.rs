use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_ADDR: &str = ":5000";
pub const DEFAULT_CAMERA: &str = "HP Truevision HD";
pub const DEFAULT_FFMPEG: &str = "ffmpeg";
pub const DEFAULT_CLEANUP_DELAY: Duration = Duration::from_secs(1);

/// Returns the ffmpeg input format used to capture from a camera on the host platform.
pub fn default_driver() -> &'static str {
    if cfg!(target_os = "linux") {
        "v4l2"
    } else if cfg!(target_os = "macos") {
        "avfoundation"
    } else {
        "dshow"
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read config file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid config file: {0}")]
    Toml(#[from] toml::de::Error),
}

#[derive(Clone, Debug, Default, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Address to serve on (host:port) [default: :5000]
    #[arg(long)]
    pub addr: Option<String>,
    /// Camera driver, passed to ffmpeg as the input format [default: platform dependent]
    #[arg(long, visible_alias = "format")]
    pub driver: Option<String>,
    /// Camera name [default: HP Truevision HD]
    #[arg(long)]
    pub camera: Option<String>,
    /// The ffmpeg executable [default: ffmpeg]
    #[arg(long)]
    pub ffmpeg: Option<String>,
    /// Read defaults from a TOML config file. Flags take precedence.
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,
    /// Give up waiting on open connections after this many seconds when shutting down.
    #[arg(long, value_name = "SECS")]
    pub shutdown_timeout: Option<u64>,
}

/// The on-disk config file. Every key is optional.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ConfigFile {
    pub http: Http,
    pub capture: Capture,
    pub workspace: Workspace,
}

impl ConfigFile {
    pub fn from_file<P>(path: P) -> Result<Self, Error>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let map_err = |source| Error::Io {
            path: path.to_owned(),
            source,
        };

        let mut file = File::open(path).map_err(map_err)?;

        let mut buf = Vec::new();
        file.read_to_end(&mut buf).map_err(map_err)?;

        Ok(toml::from_slice(&buf)?)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Http {
    pub addr: Option<String>,
    pub shutdown_timeout: Option<u64>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Capture {
    pub driver: Option<String>,
    pub camera: Option<String>,
    pub ffmpeg: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Workspace {
    pub cleanup_delay_ms: Option<u64>,
}

/// The resolved service configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub addr: String,
    pub driver: String,
    pub camera: String,
    pub ffmpeg: String,
    /// How long to wait before removing the workspace on shutdown.
    pub cleanup_delay: Duration,
    pub shutdown_timeout: Option<Duration>,
}

impl Config {
    /// Resolves the final config from the command line, reading the config file if one was
    /// given. Command line flags override values from the file.
    pub fn resolve(args: Args) -> Result<Self, Error> {
        let file = match &args.config {
            Some(path) => ConfigFile::from_file(path)?,
            None => ConfigFile::default(),
        };

        Ok(Self::merge(args, file))
    }

    fn merge(args: Args, file: ConfigFile) -> Self {
        Self {
            addr: args
                .addr
                .or(file.http.addr)
                .unwrap_or_else(|| DEFAULT_ADDR.to_owned()),
            driver: args
                .driver
                .or(file.capture.driver)
                .unwrap_or_else(|| default_driver().to_owned()),
            camera: args
                .camera
                .or(file.capture.camera)
                .unwrap_or_else(|| DEFAULT_CAMERA.to_owned()),
            ffmpeg: args
                .ffmpeg
                .or(file.capture.ffmpeg)
                .unwrap_or_else(|| DEFAULT_FFMPEG.to_owned()),
            cleanup_delay: file
                .workspace
                .cleanup_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_CLEANUP_DELAY),
            shutdown_timeout: args
                .shutdown_timeout
                .or(file.http.shutdown_timeout)
                .map(Duration::from_secs),
        }
    }

    /// Returns the address to bind the listener to. An empty host (e.g. `:5000`) binds to all
    /// interfaces.
    pub fn bind_addr(&self) -> String {
        match self.addr.strip_prefix(':') {
            Some(port) => format!("0.0.0.0:{}", port),
            None => self.addr.clone(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(Args::default(), ConfigFile::default())
    }
}
