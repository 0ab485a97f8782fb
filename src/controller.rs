use futures::{stream::BoxStream, StreamExt};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, PoisonError,
};
use tokio::{
    sync::{broadcast, broadcast::error::RecvError, mpsc, oneshot, watch},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, error, info, warn};

use crate::{
    error::{DemagError, Result},
    protocol::DeviceEvent,
    reconnect::{Backoff, ReconnectSupervisor},
    run::{CycleAggregator, RunPhase},
    session::DeviceSession,
    types::{ConnectionState, Cycle, CycleStat, DeviceCycleStat, DeviceState, RunSummary},
};

/// Everything a run screen needs to render, published as one value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSnapshot {
    /// Link is up
    pub connected: bool,
    /// Latest transport lifecycle state
    pub connection: ConnectionState,
    /// Last known device name, kept across failed reconnects
    pub device_name: Option<String>,
    /// Starting current read from the device
    pub start_current: Option<f32>,
    /// Latest device state
    pub state: Option<DeviceState>,
    /// Cycle currently running
    pub cycle: Option<Cycle>,
    /// Latest measured current
    pub current: Option<f32>,
    /// Run phase derived from the device state
    pub phase: RunPhase,
    /// Cycles closed so far in this run
    pub results: Vec<CycleStat>,
    /// Finalized client-side summary
    pub summary: Option<RunSummary>,
    /// Records from the device's statistics characteristic, read when the run ends
    pub device_stats: Vec<DeviceCycleStat>,
    /// Sum of `device_stats` durations, in device units
    pub device_stats_duration: u64,
    /// Start control is enabled
    pub start_enabled: bool,
    /// Stop control is enabled
    pub stop_enabled: bool,
    /// Last operation error, cleared by the next success
    pub error: Option<String>,
}

enum ControlRequest {
    Start(oneshot::Sender<Result<()>>),
    Stop(oneshot::Sender<Result<()>>),
}

/// Drives one demagnetization run on a session
///
/// A single worker task owns the [`CycleAggregator`] and consumes the merged
/// notification stream, connection transitions and start/stop requests, so
/// updates are applied in the order the device emitted them. Automatic
/// reconnection is enabled for the lifetime of the controller.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use demag_ble::{BleManager, DeviceSession, LinkFactory, RunController, SessionConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let manager = BleManager::new(SessionConfig::default()).await?;
///     let session = Arc::new(DeviceSession::new(
///         manager.open("AA:BB:CC:DD:EE:FF"),
///         SessionConfig::default(),
///     ));
///
///     let controller = RunController::spawn(session);
///     controller.start().await?;
///
///     let mut snapshot = controller.subscribe();
///     let done = snapshot.wait_for(|s| s.summary.is_some()).await?;
///     println!("{:?}", done.summary);
///     drop(done);
///
///     controller.shutdown().await?;
///     Ok(())
/// }
/// ```
pub struct RunController {
    session: Arc<DeviceSession>,
    commands: mpsc::Sender<ControlRequest>,
    snapshot: watch::Receiver<RunSnapshot>,
    supervisor: ReconnectSupervisor,
    worker: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl RunController {
    /// Start the worker and the reconnect supervisor
    ///
    /// Connects if the session is not connected yet. Must be called inside a
    /// tokio runtime.
    #[must_use]
    pub fn spawn(session: Arc<DeviceSession>) -> Self {
        let supervisor = ReconnectSupervisor::new(Arc::clone(&session));
        supervisor.enable();

        let (commands, requests) = mpsc::channel(8);
        let (snapshot_tx, snapshot) = watch::channel(RunSnapshot {
            connection: session.connection_state(),
            ..RunSnapshot::default()
        });

        let worker = Worker {
            session: Arc::clone(&session),
            backoff: supervisor.backoff(),
            aggregator: CycleAggregator::new(),
            snapshot: snapshot_tx,
        };
        let connection = session.connection_events();
        let events = session.events();
        let handle = tokio::spawn(worker.run(requests, connection, events));

        Self {
            session,
            commands,
            snapshot,
            supervisor,
            worker: Mutex::new(Some(handle)),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Session this controller drives
    #[must_use]
    pub const fn session(&self) -> &Arc<DeviceSession> {
        &self.session
    }

    /// Latest snapshot
    #[must_use]
    pub fn snapshot(&self) -> RunSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver of every snapshot update
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<RunSnapshot> {
        self.snapshot.clone()
    }

    /// Clear the previous run and send the start command
    ///
    /// # Errors
    ///
    /// Returns connection errors, or [`DemagError::Closed`] after shutdown.
    pub async fn start(&self) -> Result<()> {
        self.request(ControlRequest::Start).await
    }

    /// Send the stop command
    ///
    /// # Errors
    ///
    /// Returns connection errors, or [`DemagError::Closed`] after shutdown.
    pub async fn stop(&self) -> Result<()> {
        self.request(ControlRequest::Stop).await
    }

    async fn request(
        &self,
        build: fn(oneshot::Sender<Result<()>>) -> ControlRequest,
    ) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| DemagError::Closed)?;
        response.await.map_err(|_| DemagError::Closed)?
    }

    /// Stop every task and disconnect; later calls do nothing
    ///
    /// # Errors
    ///
    /// Returns transport errors from the disconnect.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!("Shutting down run controller for {}", self.session.address());
        self.supervisor.cancel();
        self.abort_worker();
        self.session.disconnect().await
    }

    fn abort_worker(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            worker.abort();
        }
    }
}

impl Drop for RunController {
    fn drop(&mut self) {
        self.supervisor.cancel();
        self.abort_worker();
    }
}

struct Worker {
    session: Arc<DeviceSession>,
    backoff: Arc<Backoff>,
    aggregator: CycleAggregator,
    snapshot: watch::Sender<RunSnapshot>,
}

impl Worker {
    async fn run(
        mut self,
        mut requests: mpsc::Receiver<ControlRequest>,
        mut connection: broadcast::Receiver<ConnectionState>,
        mut events: BoxStream<'static, Result<DeviceEvent>>,
    ) {
        if self.session.is_connected().await {
            self.refresh().await;
        } else if let Err(e) = self.session.connect().await {
            warn!("Initial connect failed: {e}");
            self.report(&e);
        }

        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => self.handle(request).await,
                    None => break,
                },
                event = events.next() => match event {
                    Some(Ok(event)) => self.on_event(event).await,
                    Some(Err(DemagError::ConnectionLost)) => debug!("Notifications interrupted"),
                    Some(Err(e)) => self.report(&e),
                    None => break,
                },
                state = connection.recv() => match state {
                    Ok(state) => self.on_connection(state).await,
                    Err(RecvError::Lagged(skipped)) => warn!("Missed {skipped} connection events"),
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!("Run controller worker exiting");
    }

    fn report(&self, e: &DemagError) {
        let message = e.to_string();
        self.snapshot.send_modify(|s| s.error = Some(message));
    }

    async fn handle(&mut self, request: ControlRequest) {
        match request {
            ControlRequest::Start(reply) => {
                info!("Starting run");
                self.aggregator.reset();
                self.snapshot.send_modify(|s| {
                    s.results.clear();
                    s.summary = None;
                    s.device_stats.clear();
                    s.device_stats_duration = 0;
                    s.phase = RunPhase::Idle;
                    s.start_enabled = false;
                    s.stop_enabled = true;
                    s.error = None;
                });

                let result = self.start_device().await;
                if let Err(e) = &result {
                    error!("Start failed: {e}");
                    let message = e.to_string();
                    self.snapshot.send_modify(|s| {
                        s.start_enabled = true;
                        s.stop_enabled = false;
                        s.error = Some(message);
                    });
                }
                let _ = reply.send(result);
            }
            ControlRequest::Stop(reply) => {
                info!("Stopping run");
                self.snapshot.send_modify(|s| {
                    s.start_enabled = false;
                    s.stop_enabled = false;
                });

                let result = self.stop_device().await;
                if let Err(e) = &result {
                    error!("Stop failed: {e}");
                    let message = e.to_string();
                    self.snapshot.send_modify(|s| {
                        s.stop_enabled = true;
                        s.error = Some(message);
                    });
                }
                let _ = reply.send(result);
            }
        }
    }

    async fn start_device(&self) -> Result<()> {
        self.session.connect().await?;
        self.session.start().await
    }

    async fn stop_device(&self) -> Result<()> {
        self.session.connect().await?;
        self.session.stop().await
    }

    async fn on_event(&mut self, event: DeviceEvent) {
        let summary = self.aggregator.apply(event, Instant::now());
        let phase = self.aggregator.phase();
        let results = self.aggregator.results().to_vec();

        self.snapshot.send_modify(|s| {
            match event {
                DeviceEvent::State(state) => {
                    s.state = Some(state);
                    s.start_enabled = state.is_idle();
                    s.stop_enabled = state.is_active();
                }
                DeviceEvent::Cycle(cycle) => s.cycle = Some(cycle),
                DeviceEvent::Current(current) => s.current = Some(current),
            }
            s.phase = phase;
            s.results = results;
            if summary.is_some() {
                s.summary.clone_from(&summary);
            }
        });

        if summary.is_some() {
            self.read_device_stats().await;
        }
    }

    async fn read_device_stats(&self) {
        match self.session.get_cycles_stat().await {
            Ok(stats) => {
                let total: u64 = stats.iter().map(|stat| stat.duration).sum();
                debug!("Device reported {} cycle records", stats.len());
                self.snapshot.send_modify(|s| {
                    s.device_stats = stats;
                    s.device_stats_duration = total;
                });
            }
            Err(e) => {
                warn!("Reading device statistics failed: {e}");
                self.report(&e);
            }
        }
    }

    async fn on_connection(&mut self, state: ConnectionState) {
        let connected = state.is_connected();
        self.snapshot.send_modify(|s| {
            s.connected = connected;
            s.connection = state;
        });

        if connected {
            self.refresh().await;
        }
    }

    /// Pull the values notifications would have delivered while disconnected
    async fn refresh(&self) {
        let name = self.session.name().await;
        if let Some(name) = name {
            self.snapshot.send_modify(|s| s.device_name = Some(name));
        }

        match self.read_status().await {
            Ok((start_current, state, live)) => {
                info!("Device state: {state}");
                self.backoff.reset();
                self.snapshot.send_modify(|s| {
                    s.connected = true;
                    s.start_current = Some(start_current);
                    s.state = Some(state);
                    if let Some((cycle, current)) = live {
                        s.cycle = Some(cycle);
                        s.current = Some(current);
                    }
                    s.start_enabled = state.is_idle();
                    s.stop_enabled = state.is_active();
                    s.error = None;
                });
            }
            Err(e) => {
                warn!("Refreshing device status failed: {e}");
                self.report(&e);
            }
        }
    }

    async fn read_status(&self) -> Result<(f32, DeviceState, Option<(Cycle, f32)>)> {
        let start_current = self.session.get_start_current().await?;
        let state = self.session.get_state().await?;
        let live = if state.is_active() {
            Some((
                self.session.get_cycle().await?,
                self.session.get_current().await?,
            ))
        } else {
            None
        };
        Ok((start_current, state, live))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        protocol::{Characteristic, Command, Payload},
        transport::{fake::FakeLink, PeripheralLink},
        types::SessionConfig,
    };
    use std::time::Duration;
    use tokio::time::timeout;

    fn controller_for(link: &Arc<FakeLink>) -> RunController {
        let session = Arc::new(DeviceSession::new(link.clone(), SessionConfig::default()));
        RunController::spawn(session)
    }

    async fn wait_until(
        controller: &RunController,
        predicate: impl FnMut(&RunSnapshot) -> bool,
    ) -> RunSnapshot {
        let mut rx = controller.subscribe();
        let snapshot = timeout(Duration::from_secs(5), rx.wait_for(predicate))
            .await
            .expect("snapshot condition not reached")
            .expect("controller gone");
        snapshot.clone()
    }

    async fn wait_for_subscriber(link: &FakeLink) {
        while link.subscriber_count() == 0 {
            tokio::task::yield_now().await;
        }
    }

    fn cycle(num: u32) -> Cycle {
        Cycle {
            num,
            target_current: 8.0,
            polarity: num % 2 == 1,
        }
    }

    #[tokio::test]
    async fn test_connects_and_refreshes() {
        let link = FakeLink::new("AA");
        link.set_value(Characteristic::StartCurrent, &3.0f32.to_le_bytes());
        link.set_value(Characteristic::State, &[DeviceState::InMain.ordinal()]);
        link.set_value(Characteristic::Cycle, &cycle(4).encode());
        link.set_value(Characteristic::Current, &2.5f32.to_le_bytes());

        let controller = controller_for(&link);
        let snapshot = wait_until(&controller, |s| s.state.is_some()).await;

        assert!(snapshot.connected);
        assert_eq!(snapshot.connection, ConnectionState::Connected);
        assert_eq!(snapshot.device_name.as_deref(), Some("Demag AA"));
        assert_eq!(snapshot.start_current, Some(3.0));
        assert_eq!(snapshot.cycle, Some(cycle(4)));
        assert_eq!(snapshot.current, Some(2.5));
        assert!(!snapshot.start_enabled);
        assert!(snapshot.stop_enabled);
        assert!(snapshot.error.is_none());
    }

    #[tokio::test]
    async fn test_run_to_completion() {
        let link = FakeLink::new("AA");
        link.set_value(Characteristic::State, &[DeviceState::MakeSchema.ordinal()]);
        let controller = controller_for(&link);
        wait_until(&controller, |s| s.start_enabled).await;

        controller.start().await.unwrap();
        assert!(link
            .writes()
            .contains(&(Characteristic::Command, vec![Command::Start as u8])));
        let snapshot = controller.snapshot();
        assert!(!snapshot.start_enabled);
        assert!(snapshot.stop_enabled);

        let device_stats = vec![DeviceCycleStat {
            num: 1,
            target_current: 8.0,
            measured_current: 5.0,
            duration: 1_200,
        }];
        link.set_value(Characteristic::CyclesStat, &device_stats.encode());

        wait_for_subscriber(&link).await;
        link.notify(Characteristic::State, &[DeviceState::InMain.ordinal()]);
        link.notify(Characteristic::Cycle, &cycle(1).encode());
        link.notify(Characteristic::Current, &2.0f32.to_le_bytes());
        link.notify(Characteristic::Current, &5.0f32.to_le_bytes());
        link.notify(Characteristic::Cycle, &cycle(2).encode());
        link.notify(Characteristic::Current, &1.0f32.to_le_bytes());
        link.notify(Characteristic::State, &[DeviceState::CyclesEnded.ordinal()]);

        let snapshot = wait_until(&controller, |s| !s.device_stats.is_empty()).await;
        let summary = snapshot.summary.unwrap();
        assert_eq!(summary.results.len(), 1);
        assert_eq!(summary.results[0].cycle, cycle(1));
        assert!((summary.results[0].peak_current - 5.0).abs() < f32::EPSILON);
        assert_eq!(snapshot.phase, RunPhase::Ended);
        assert_eq!(snapshot.device_stats, device_stats);
        assert_eq!(snapshot.device_stats_duration, 1_200);
        assert!(snapshot.start_enabled);
        assert!(!snapshot.stop_enabled);
    }

    #[tokio::test]
    async fn test_start_clears_previous_summary() {
        let link = FakeLink::new("AA");
        link.set_value(Characteristic::State, &[DeviceState::MakeSchema.ordinal()]);
        let controller = controller_for(&link);
        wait_until(&controller, |s| s.start_enabled).await;

        wait_for_subscriber(&link).await;
        link.notify(Characteristic::Cycle, &cycle(1).encode());
        link.notify(Characteristic::Cycle, &cycle(2).encode());
        link.notify(Characteristic::State, &[DeviceState::CyclesEnded.ordinal()]);
        wait_until(&controller, |s| s.summary.is_some()).await;

        controller.start().await.unwrap();
        let snapshot = controller.snapshot();
        assert!(snapshot.summary.is_none());
        assert!(snapshot.results.is_empty());
        assert_eq!(snapshot.phase, RunPhase::Idle);
    }

    #[tokio::test]
    async fn test_start_failure_restores_controls() {
        let link = FakeLink::new("AA");
        link.set_fail_connect(true);
        let controller = controller_for(&link);

        let result = controller.start().await;
        assert!(result.unwrap_err().is_connection_error());

        let snapshot = controller.snapshot();
        assert!(snapshot.start_enabled);
        assert!(!snapshot.stop_enabled);
        assert!(snapshot.error.is_some());
        assert!(link.writes().is_empty());
    }

    #[tokio::test]
    async fn test_stop_failure_reenables_stop() {
        let link = FakeLink::new("AA");
        link.set_fail_connect(true);
        let controller = controller_for(&link);

        assert!(controller.stop().await.is_err());
        let snapshot = controller.snapshot();
        assert!(!snapshot.start_enabled);
        assert!(snapshot.stop_enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_refreshes_and_keeps_name() {
        let link = FakeLink::new("AA");
        link.set_value(Characteristic::State, &[DeviceState::MakeSchema.ordinal()]);
        let controller = controller_for(&link);
        wait_until(&controller, |s| s.state == Some(DeviceState::MakeSchema)).await;

        link.set_value(Characteristic::State, &[DeviceState::InTest.ordinal()]);
        link.drop_link("out of range");
        let snapshot = wait_until(&controller, |s| !s.connected).await;
        assert_eq!(snapshot.device_name.as_deref(), Some("Demag AA"));

        let snapshot = wait_until(&controller, |s| s.state == Some(DeviceState::InTest)).await;
        assert!(snapshot.connected);
        assert!(snapshot.stop_enabled);
        assert_eq!(link.connect_calls(), 2);
        assert_eq!(controller.supervisor.backoff().current(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let link = FakeLink::new("AA");
        link.set_value(Characteristic::State, &[DeviceState::MakeSchema.ordinal()]);
        let controller = controller_for(&link);
        wait_until(&controller, |s| s.connected).await;

        controller.shutdown().await.unwrap();
        controller.shutdown().await.unwrap();

        assert_eq!(link.disconnect_calls(), 1);
        assert!(!link.is_connected().await);
        assert_eq!(link.subscriber_count(), 0);
        assert!(!controller.supervisor.is_active());
        assert!(matches!(controller.start().await, Err(DemagError::Closed)));
    }
}
