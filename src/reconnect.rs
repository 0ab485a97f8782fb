use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};
use tokio::{
    sync::broadcast::error::RecvError,
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, info, warn};

use crate::{session::DeviceSession, types::ConnectionState};

/// Linear reconnect delay
///
/// Every disconnect adds one step to the delay; a successful connect brings it
/// back to zero. There is no cap.
#[derive(Debug)]
pub struct Backoff {
    step_ms: u64,
    delay_ms: AtomicU64,
}

impl Backoff {
    /// Create a backoff growing by `step_ms`
    #[must_use]
    pub const fn new(step_ms: u64) -> Self {
        Self {
            step_ms,
            delay_ms: AtomicU64::new(0),
        }
    }

    /// Grow the delay by one step and return it
    pub fn next_delay(&self) -> Duration {
        let previous = self.delay_ms.fetch_add(self.step_ms, Ordering::SeqCst);
        Duration::from_millis(previous.saturating_add(self.step_ms))
    }

    /// Back to zero
    pub fn reset(&self) {
        self.delay_ms.store(0, Ordering::SeqCst);
    }

    /// Delay handed out last, zero after a reset
    #[must_use]
    pub fn current(&self) -> Duration {
        Duration::from_millis(self.delay_ms.load(Ordering::SeqCst))
    }
}

/// Automatic reconnection for one session
///
/// While enabled, every `Disconnected` transition schedules one connect
/// attempt after the next backoff delay. A failed attempt is itself reported
/// as a disconnect by the link, which schedules the following attempt.
pub struct ReconnectSupervisor {
    session: Arc<DeviceSession>,
    backoff: Arc<Backoff>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReconnectSupervisor {
    /// Create a disabled supervisor
    #[must_use]
    pub fn new(session: Arc<DeviceSession>) -> Self {
        let backoff = Arc::new(Backoff::new(session.config().reconnect_step_ms));
        Self {
            session,
            backoff,
            task: Mutex::new(None),
        }
    }

    /// Shared backoff, reset by whoever observes a successful connect
    #[must_use]
    pub fn backoff(&self) -> Arc<Backoff> {
        Arc::clone(&self.backoff)
    }

    /// Whether reconnection is currently enabled
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Start watching for disconnects; no-op if already enabled
    pub fn enable(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        info!("Auto-reconnect enabled for {}", self.session.address());
        let mut events = self.session.connection_events();
        let session = Arc::clone(&self.session);
        let backoff = Arc::clone(&self.backoff);

        *task = Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ConnectionState::Disconnected(reason)) => {
                        let delay = backoff.next_delay();
                        info!(
                            "Disconnected ({}), reconnecting in {}ms",
                            reason.as_deref().unwrap_or("no reason"),
                            delay.as_millis()
                        );
                        sleep(delay).await;

                        match session.connect().await {
                            Ok(()) => {
                                info!("Reconnected to {}", session.address());
                                backoff.reset();
                            }
                            Err(e) => warn!("Reconnect attempt failed: {e}"),
                        }
                    }
                    Ok(ConnectionState::Connected) => backoff.reset(),
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Missed {skipped} connection events");
                    }
                    Err(RecvError::Closed) => {
                        debug!("Connection events closed, supervisor exiting");
                        break;
                    }
                }
            }
        }));
    }

    /// Stop reconnecting; idempotent
    pub fn cancel(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            info!("Auto-reconnect disabled for {}", self.session.address());
            task.abort();
        }
    }
}

impl Drop for ReconnectSupervisor {
    fn drop(&mut self) {
        self.cancel();
    }
}
