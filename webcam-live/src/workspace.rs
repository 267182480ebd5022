use std::io;
use std::path::Path;
use std::time::Duration;

use tempfile::TempDir;

pub const PREFIX: &str = "webcam-live-";

/// The directory ffmpeg writes the stream into and the HTTP server serves it from.
///
/// The directory is removed when the `Workspace` is dropped. Use [`Workspace::close`] on the
/// normal shutdown path to give in-flight reads some time to finish first.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    /// Creates a new uniquely named workspace in the system temp directory.
    pub fn create() -> io::Result<Self> {
        Self::create_in(std::env::temp_dir())
    }

    pub fn create_in<P>(parent: P) -> io::Result<Self>
    where
        P: AsRef<Path>,
    {
        let dir = tempfile::Builder::new().prefix(PREFIX).tempdir_in(parent)?;

        tracing::debug!("Created workspace {}", dir.path().display());

        Ok(Self { dir })
    }

    #[inline]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Removes the workspace after waiting for `delay`.
    pub async fn close(self, delay: Duration) -> io::Result<()> {
        tokio::time::sleep(delay).await;

        let path = self.path().to_owned();
        self.dir.close()?;

        tracing::debug!("Removed workspace {}", path.display());
        Ok(())
    }
}
