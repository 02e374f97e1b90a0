//! The silence watchdog: re-armed on every line of job output, emits
//! `> still running...` when a job goes quiet for too long.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::timeout;

/// Default silence window before the watchdog speaks up.
pub const DEFAULT_SILENCE_WINDOW: Duration = Duration::from_secs(10);

/// Shared handle: call [`SilenceWatchdog::kick`] on every output line,
/// [`SilenceWatchdog::stop`] once the job is done.
pub struct SilenceWatchdog {
    notify: Notify,
    stopped: AtomicBool,
    window: Duration,
}

impl SilenceWatchdog {
    #[must_use]
    pub fn new(window: Duration) -> Arc<Self> {
        Arc::new(Self { notify: Notify::new(), stopped: AtomicBool::new(false), window })
    }

    /// Re-arms the timer — call on every line of output or progress event.
    pub fn kick(&self) {
        self.notify.notify_one();
    }

    /// Stops the watchdog loop permanently.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Runs until [`Self::stop`] is called, invoking `on_silence` every
    /// time `window` elapses without a `kick`.
    pub async fn watch(self: Arc<Self>, on_silence: impl Fn() + Send + Sync) {
        loop {
            match timeout(self.window, self.notify.notified()).await {
                Ok(()) => {
                    if self.stopped.load(Ordering::SeqCst) {
                        return;
                    }
                }
                Err(_elapsed) => {
                    if self.stopped.load(Ordering::SeqCst) {
                        return;
                    }
                    on_silence();
                }
            }
        }
    }
}
