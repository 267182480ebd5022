use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// A handle used to trigger and observe a graceful shutdown.
///
/// Cloning a `Shutdown` returns a handle to the same shutdown state. Every task that needs to
/// finish its work before the service stops holds a [`ShutdownListener`]; [`Shutdown::wait`]
/// completes once shutdown was triggered and all listeners have been dropped, or the shutdown
/// was forced.
#[derive(Clone, Debug, Default)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    in_progress: AtomicBool,
    forced: AtomicBool,
    counter: AtomicUsize,
    notify_shutdown: Notify,
    notify_done: Notify,
}

impl Shutdown {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn in_progress(&self) -> bool {
        self.inner.in_progress.load(Ordering::Acquire)
    }

    /// Returns `true` if the shutdown was forced and no longer waits on listeners.
    #[inline]
    pub fn is_forced(&self) -> bool {
        self.inner.forced.load(Ordering::Acquire)
    }

    /// Returns the number of live listeners.
    #[inline]
    pub fn listeners(&self) -> usize {
        self.inner.counter.load(Ordering::Acquire)
    }

    pub fn listen(&self) -> ShutdownListener {
        self.inner.counter.fetch_add(1, Ordering::AcqRel);

        ShutdownListener {
            inner: self.inner.clone(),
        }
    }

    /// Starts the shutdown. Returns `false` if a shutdown was already in progress, in which case
    /// the shutdown is forced.
    pub fn terminate(&self) -> bool {
        if self.inner.in_progress.swap(true, Ordering::AcqRel) {
            self.force();
            return false;
        }

        self.inner.notify_shutdown.notify_waiters();

        if self.listeners() == 0 {
            self.inner.notify_done.notify_waiters();
        }

        tracing::info!("Waiting on {} listeners", self.listeners());
        true
    }

    /// Stops waiting on the remaining listeners. [`Shutdown::wait`] returns immediately.
    fn force(&self) {
        if self.inner.forced.swap(true, Ordering::AcqRel) {
            return;
        }

        tracing::warn!("Forcing shutdown with {} listeners left", self.listeners());
        self.inner.notify_done.notify_waiters();
    }

    /// Waits until shutdown was triggered and all listeners are dropped, or the shutdown was
    /// forced.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify_done.notified();

            if self.in_progress() && (self.listeners() == 0 || self.is_forced()) {
                return;
            }

            notified.await;
        }
    }
}

/// Resolves once shutdown was triggered. Dropping the listener tells the [`Shutdown`] that the
/// owning task is done.
#[derive(Debug)]
pub struct ShutdownListener {
    inner: Arc<Inner>,
}

impl ShutdownListener {
    #[inline]
    pub fn in_progress(&self) -> bool {
        self.inner.in_progress.load(Ordering::Acquire)
    }

    pub async fn recv(&self) {
        // The future must exist before the flag is checked, otherwise a concurrent
        // `terminate` can slip between the check and the await.
        let notified = self.inner.notify_shutdown.notified();

        if self.in_progress() {
            return;
        }

        notified.await;
    }
}

impl Drop for ShutdownListener {
    fn drop(&mut self) {
        self.inner.counter.fetch_sub(1, Ordering::AcqRel);

        if self.in_progress() && self.inner.counter.load(Ordering::Acquire) == 0 {
            self.inner.notify_done.notify_waiters();
        }
    }
}

/// Registers for SIGINT and SIGTERM and spawns a task that triggers `shutdown` once one is
/// received. A second signal received while the shutdown is in progress forces it, so open
/// connections are no longer waited on.
pub fn init(shutdown: Shutdown) -> io::Result<JoinHandle<()>> {
    let mut signals = Signals::new()?;

    Ok(tokio::task::spawn(async move {
        loop {
            if let Err(err) = signals.recv().await {
                tracing::error!("Failed to listen for signals: {}", err);
                return;
            }

            if !shutdown.terminate() {
                tracing::info!("Received second signal, forcing shutdown");
            }
        }
    }))
}

#[cfg(unix)]
struct Signals {
    sigint: tokio::signal::unix::Signal,
    sigterm: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn new() -> io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
        })
    }

    async fn recv(&mut self) -> io::Result<()> {
        tokio::select! {
            _ = self.sigint.recv() => tracing::info!("SIGINT"),
            _ = self.sigterm.recv() => tracing::info!("SIGTERM"),
        }

        Ok(())
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn new() -> io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> io::Result<()> {
        tokio::signal::ctrl_c().await?;
        tracing::info!("Ctrl-C");
        Ok(())
    }
}
