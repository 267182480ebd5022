use std::ffi::OsStr;
use std::io;
use std::path::Path;

use tokio::process::{Child, Command};

use crate::config::Config;

pub const PLAYLIST: &str = "stream.m3u8";
pub const SEGMENT_PATTERN: &str = "stream%05d.ts";

/// Returns the ffmpeg arguments used to capture `camera` through `driver` and write a live HLS
/// stream into the current directory.
pub fn ffmpeg_args(driver: &str, camera: &str, threads: usize) -> Vec<String> {
    let threads = threads.to_string();
    let input = format!("video={}", camera);

    #[rustfmt::skip]
    let args = [
        "-f", driver,
        "-s", "320x240",
        "-r", "30",
        "-vcodec", "mjpeg",
        "-i", input.as_str(),
        "-threads", threads.as_str(),
        "-codec:v", "libx264",
        "-map", "0",
        "-codec:v", "libx264",
        "-codec:a", "libfaac",
        "-f", "segment",
        "-segment_format", "mpegts",
        "-segment_list_size", "8",
        "-segment_list_type", "m3u8",
        "-segment_time", "4",
        "-segment_list", PLAYLIST,
        "-segment_list_flags", "+live",
        SEGMENT_PATTERN,
    ];

    args.iter().map(|arg| arg.to_string()).collect()
}

fn available_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// The running capture process.
///
/// The process is killed exactly once: either by [`CaptureProcess::kill`] or, if that never
/// happens, when the handle is dropped.
#[derive(Debug)]
pub struct CaptureProcess {
    child: Child,
}

impl CaptureProcess {
    /// Starts ffmpeg as configured in `config`, writing into `dir`.
    pub fn start(config: &Config, dir: &Path) -> io::Result<Self> {
        let args = ffmpeg_args(&config.driver, &config.camera, available_threads());
        Self::spawn(&config.ffmpeg, &args, dir)
    }

    /// Spawns `program` with `args` in the working directory `dir` without waiting for it.
    pub fn spawn<P, I, S>(program: P, args: I, dir: &Path) -> io::Result<Self>
    where
        P: AsRef<OsStr>,
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let child = Command::new(program)
            .args(args)
            .current_dir(dir)
            .kill_on_drop(true)
            .spawn()?;

        tracing::info!("Started capture process (pid {:?})", child.id());

        Ok(Self { child })
    }

    /// Returns the OS process id, or `None` if the process was already reaped.
    #[inline]
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Kills the process and waits for it to be reaped.
    pub async fn kill(mut self) {
        let id = self.id();

        match self.child.kill().await {
            Ok(()) => tracing::info!("Stopped capture process (pid {:?})", id),
            Err(err) => tracing::debug!("Failed to kill capture process: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{ffmpeg_args, CaptureProcess};
    use crate::config::Config;

    #[test]
    fn test_ffmpeg_args() {
        let args = ffmpeg_args("fake", "test0", 4);

        assert_eq!(&args[..2], ["-f", "fake"]);
        assert_eq!(
            args,
            [
                "-f",
                "fake",
                "-s",
                "320x240",
                "-r",
                "30",
                "-vcodec",
                "mjpeg",
                "-i",
                "video=test0",
                "-threads",
                "4",
                "-codec:v",
                "libx264",
                "-map",
                "0",
                "-codec:v",
                "libx264",
                "-codec:a",
                "libfaac",
                "-f",
                "segment",
                "-segment_format",
                "mpegts",
                "-segment_list_size",
                "8",
                "-segment_list_type",
                "m3u8",
                "-segment_time",
                "4",
                "-segment_list",
                "stream.m3u8",
                "-segment_list_flags",
                "+live",
                "stream%05d.ts",
            ]
        );
    }

    #[test]
    fn test_ffmpeg_args_camera_verbatim() {
        let args = ffmpeg_args("dshow", "HP Truevision HD", 1);
        assert!(args.contains(&"video=HP Truevision HD".to_owned()));
    }

    #[tokio::test]
    async fn test_start_missing_program() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            ffmpeg: "webcam-live-no-such-program".to_owned(),
            ..Default::default()
        };

        assert!(CaptureProcess::start(&config, dir.path()).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_in_workspace() {
        let dir = tempfile::tempdir().unwrap();

        let process =
            CaptureProcess::spawn("sh", ["-c", "echo ok > started; sleep 30"], dir.path())
                .unwrap();
        assert!(process.id().is_some());

        let marker = dir.path().join("started");
        for _ in 0..100 {
            if marker.exists() {
                break;
            }

            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(marker.exists());

        tokio::time::timeout(Duration::from_secs(5), process.kill())
            .await
            .unwrap();
    }
}
