use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use tokio::net::TcpListener;

use crate::capture::CaptureProcess;
use crate::config::Config;
use crate::error::Error;
use crate::http;
use crate::signal::Shutdown;
use crate::state::State;
use crate::workspace::Workspace;

/// A started service: the workspace exists, ffmpeg is running and the listener is bound.
///
/// Dropping a `Service` kills the capture process and then removes the workspace.
#[derive(Debug)]
pub struct Service {
    config: Config,
    listener: TcpListener,
    // Fields drop in declaration order. The capture process must be gone before its working
    // directory is removed.
    capture: CaptureProcess,
    workspace: Workspace,
}

impl Service {
    /// Starts the service with a workspace in the system temp directory.
    pub async fn start(config: Config) -> Result<Self, Error> {
        let workspace = Workspace::create().map_err(Error::Workspace)?;
        Self::start_with(config, workspace).await
    }

    /// Starts the service with a workspace created in `parent`.
    pub async fn start_in<P>(config: Config, parent: P) -> Result<Self, Error>
    where
        P: AsRef<Path>,
    {
        let workspace = Workspace::create_in(parent).map_err(Error::Workspace)?;
        Self::start_with(config, workspace).await
    }

    async fn start_with(config: Config, workspace: Workspace) -> Result<Self, Error> {
        tracing::info!("Workspace {}", workspace.path().display());

        // On any error below the locals are dropped before `workspace`, so the process is
        // killed first and the directory is removed right away.
        let capture = CaptureProcess::start(&config, workspace.path()).map_err(|source| {
            Error::Capture {
                program: config.ffmpeg.clone(),
                source,
            }
        })?;

        let addr = config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| Error::Bind {
                addr: addr.clone(),
                source,
            })?;

        Ok(Self {
            config,
            listener,
            capture,
            workspace,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn workspace(&self) -> &Path {
        self.workspace.path()
    }

    /// Serves until `shutdown` is triggered, then kills the capture process and removes the
    /// workspace after the configured delay. A forced shutdown removes the workspace right away.
    pub async fn run(self, shutdown: Shutdown) -> Result<(), Error> {
        match self.local_addr() {
            Ok(addr) => tracing::info!("Serving on {}", addr),
            Err(_) => tracing::info!("Serving on {}", self.config.addr),
        }

        let state = State::new(self.workspace());
        let res = http::serve(
            self.listener,
            state,
            shutdown.clone(),
            self.config.shutdown_timeout,
        )
        .await;

        self.capture.kill().await;

        let delay = if shutdown.is_forced() {
            Duration::ZERO
        } else {
            self.config.cleanup_delay
        };
        let cleanup = self.workspace.close(delay).await;

        res.map_err(Error::Serve)?;
        cleanup.map_err(Error::Cleanup)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::time::Duration;

    use hyper::{Client, StatusCode};
    use tokio::net::TcpListener;

    use super::Service;
    use crate::config::Config;
    use crate::error::Error;
    use crate::signal::Shutdown;

    const TXTBSY: i32 = 26;

    fn config(ffmpeg: &str) -> Config {
        Config {
            addr: "127.0.0.1:0".to_owned(),
            driver: "fake".to_owned(),
            camera: "test0".to_owned(),
            ffmpeg: ffmpeg.to_owned(),
            cleanup_delay: Duration::ZERO,
            ..Default::default()
        }
    }

    fn is_empty(dir: &Path) -> bool {
        fs::read_dir(dir).unwrap().next().is_none()
    }

    /// Writes a fake ffmpeg that records its arguments into its working directory.
    fn fake_ffmpeg(dir: &Path) -> String {
        let path = dir.join("ffmpeg");
        fs::write(&path, "#!/bin/sh\nprintf '%s\\n' \"$@\" > args.txt\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path.to_str().unwrap().to_owned()
    }

    async fn start(config: Config, parent: &Path) -> Service {
        // Another test may be forking while the script is still open for writing.
        for _ in 0..10 {
            match Service::start_in(config.clone(), parent).await {
                Err(Error::Capture { source, .. }) if source.raw_os_error() == Some(TXTBSY) => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                res => return res.unwrap(),
            }
        }

        panic!("failed to start service");
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let bin = tempfile::tempdir().unwrap();
        let parent = tempfile::tempdir().unwrap();

        let service = start(config(&fake_ffmpeg(bin.path())), parent.path()).await;
        let addr = service.local_addr().unwrap();
        let workspace = service.workspace().to_owned();
        assert!(workspace.is_dir());

        let shutdown = Shutdown::new();
        let handle = tokio::task::spawn(service.run(shutdown.clone()));

        // ffmpeg is started inside the workspace with the capture arguments.
        let args = workspace.join("args.txt");
        for _ in 0..100 {
            if fs::metadata(&args).map(|m| m.len() > 0).unwrap_or(false) {
                break;
            }

            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let args = fs::read_to_string(args).unwrap();
        assert!(args.starts_with("-f\nfake\n"));
        assert!(args.contains("\nvideo=test0\n"));
        assert!(args.ends_with("stream%05d.ts\n"));

        let client = Client::new();
        let uri = |path: &str| -> hyper::Uri {
            format!("http://{}{}", addr, path).parse().unwrap()
        };

        let resp = client.get(uri("/")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = client.get(uri("/stream/stream.m3u8")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        fs::write(workspace.join("stream.m3u8"), b"#EXTM3U\n").unwrap();
        let resp = client.get(uri("/stream/stream.m3u8")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        assert_eq!(&body[..], b"#EXTM3U\n");

        assert!(workspace.is_dir());
        shutdown.terminate();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert!(!workspace.exists());
        assert!(is_empty(parent.path()));
    }

    #[tokio::test]
    async fn test_cleanup_delay() {
        let parent = tempfile::tempdir().unwrap();
        let config = Config {
            cleanup_delay: Duration::from_millis(300),
            ..config("true")
        };

        let service = start(config, parent.path()).await;
        let workspace = service.workspace().to_owned();

        let shutdown = Shutdown::new();
        shutdown.terminate();
        let handle = tokio::task::spawn(service.run(shutdown));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(workspace.exists());

        handle.await.unwrap().unwrap();
        assert!(!workspace.exists());
    }

    #[tokio::test]
    async fn test_forced_shutdown() {
        let bin = tempfile::tempdir().unwrap();
        let parent = tempfile::tempdir().unwrap();

        // A capture process that keeps running until it is killed.
        let ffmpeg = bin.path().join("ffmpeg");
        fs::write(&ffmpeg, "#!/bin/sh\necho $$ > pid.txt\nexec sleep 60\n").unwrap();
        fs::set_permissions(&ffmpeg, fs::Permissions::from_mode(0o755)).unwrap();

        let config = Config {
            cleanup_delay: Duration::from_secs(60),
            ..config(ffmpeg.to_str().unwrap())
        };
        let service = start(config, parent.path()).await;
        let workspace = service.workspace().to_owned();

        let shutdown = Shutdown::new();
        // Stands in for a connection that never finishes its request.
        let stuck = shutdown.listen();
        let handle = tokio::task::spawn(service.run(shutdown.clone()));

        let pid_file = workspace.join("pid.txt");
        let mut pid = String::new();
        for _ in 0..100 {
            pid = fs::read_to_string(&pid_file).unwrap_or_default();
            if pid.ends_with('\n') {
                break;
            }

            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let pid = pid.trim().to_owned();
        assert!(!pid.is_empty());

        assert!(shutdown.terminate());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!handle.is_finished());
        assert!(workspace.exists());

        assert!(!shutdown.terminate());
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert!(!workspace.exists());
        assert!(is_empty(parent.path()));

        let alive = std::process::Command::new("sh")
            .arg("-c")
            .arg(format!("kill -0 {}", pid))
            .status()
            .unwrap();
        assert!(!alive.success());

        drop(stuck);
    }

    #[tokio::test]
    async fn test_workspace_failure() {
        let parent = tempfile::tempdir().unwrap();
        let missing = parent.path().join("missing");

        let res = Service::start_in(config("true"), &missing).await;
        assert!(matches!(res, Err(Error::Workspace(_))));
    }

    #[tokio::test]
    async fn test_capture_failure() {
        let parent = tempfile::tempdir().unwrap();

        let res = Service::start_in(config("webcam-live-no-such-program"), parent.path()).await;
        assert!(matches!(res, Err(Error::Capture { .. })));
        assert!(is_empty(parent.path()));
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let parent = tempfile::tempdir().unwrap();
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let config = Config {
            addr: taken.local_addr().unwrap().to_string(),
            ..config("true")
        };

        let res = Service::start_in(config, parent.path()).await;
        assert!(matches!(res, Err(Error::Bind { .. })));
        assert!(is_empty(parent.path()));
    }
}
