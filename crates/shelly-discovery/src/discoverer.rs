//! Common shape shared by every protocol discoverer

use async_trait::async_trait;
use shelly_core::{DiscoveredDevice, Protocol};
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::trace;

use crate::error::Result;

/// Capacity of the channel returned by `start_discovery`
pub const DEVICE_CHANNEL_CAPACITY: usize = 100;

/// A single discovery mechanism
///
/// One-shot discovery collects unique devices until a timeout or
/// cancellation. Continuous discovery delivers observations on a bounded
/// channel until `stop_discovery`; if the consumer falls behind, devices are
/// dropped (the next announcement repeats them).
#[async_trait]
pub trait Discoverer: Send + Sync {
    /// Which protocol this discoverer produces records for
    fn protocol(&self) -> Protocol;

    /// Discover devices until `timeout` elapses
    async fn discover(&self, timeout: Duration) -> Result<Vec<DiscoveredDevice>> {
        let (cancel, _guard) = cancel_after(timeout);
        self.discover_with_cancel(cancel).await
    }

    /// Discover devices until `cancel` fires
    async fn discover_with_cancel(&self, cancel: CancellationToken)
        -> Result<Vec<DiscoveredDevice>>;

    /// Start continuous discovery in the background
    async fn start_discovery(&self) -> Result<mpsc::Receiver<DiscoveredDevice>>;

    /// Stop continuous discovery; a no-op when not running
    async fn stop_discovery(&self) -> Result<()>;

    /// Release everything this discoverer holds
    async fn stop(&self) -> Result<()> {
        self.stop_discovery().await
    }
}

/// A token that fires after `timeout`, or when the guard is dropped
///
/// Dropping the guard also ends the timer task, so nothing outlives the
/// caller.
pub(crate) fn cancel_after(timeout: Duration) -> (CancellationToken, DropGuard) {
    let cancel = CancellationToken::new();
    let timer = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(timeout) => timer.cancel(),
            _ = timer.cancelled() => {}
        }
    });
    let guard = cancel.clone().drop_guard();
    (cancel, guard)
}

/// A cancellable background task owned by a discoverer
pub(crate) struct BackgroundTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    pub(crate) fn spawn<F, Fut>(f: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(f(cancel.clone()));
        Self { cancel, handle }
    }

    /// Whether the task body has returned on its own
    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel the task and wait for it to exit
    pub(crate) async fn shutdown(mut self) {
        self.cancel.cancel();
        let _ = (&mut self.handle).await;
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Clear a continuous-mode slot whose task already exited
///
/// A task ends by itself when its consumer drops the receiver. Returns true
/// when a finished task was removed, so the caller can release what that
/// task was using.
pub(crate) async fn reap_finished(slot: &RwLock<Option<BackgroundTask>>) -> bool {
    let mut slot = slot.write().await;
    if slot.as_ref().is_some_and(BackgroundTask::is_finished) {
        slot.take();
        true
    } else {
        false
    }
}

/// Best-effort send to a continuous-mode consumer
pub(crate) fn forward(tx: &mpsc::Sender<DiscoveredDevice>, device: DiscoveredDevice) {
    if let Err(mpsc::error::TrySendError::Full(device)) = tx.try_send(device) {
        trace!(id = %device.id, "Device channel full, dropping observation");
    }
}
