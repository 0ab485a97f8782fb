use futures::stream::{self, BoxStream, StreamExt};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{broadcast, broadcast::error::RecvError, Mutex},
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    error::{DemagError, Result},
    protocol::{Characteristic, Command, DeviceEvent, Payload},
    settings::{self, KeyValueStore},
    transport::{LinkFactory, NotificationStream, PeripheralLink},
    types::{Conf, ConnectionState, Cycle, DeviceCycleStat, DeviceState, SessionConfig},
};

/// Request/response and subscription access to one demagnetizer
///
/// A session owns exactly one peripheral handle for its whole lifetime.
/// Switching devices means building a new session, see [`SessionSlot`].
///
/// # Examples
///
/// ```no_run
/// use demag_ble::{BleManager, Conf, DeviceSession, LinkFactory, SessionConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let manager = BleManager::new(SessionConfig::default()).await?;
///     let session = DeviceSession::new(manager.open("AA:BB:CC:DD:EE:FF"), SessionConfig::default());
///
///     session.connect().await?;
///     session.set_config(Conf::new(1.0, 0.1, 0.0)).await?;
///     println!("state: {}", session.get_state().await?);
///
///     session.disconnect().await?;
///     Ok(())
/// }
/// ```
pub struct DeviceSession {
    link: Arc<dyn PeripheralLink>,
    config: SessionConfig,
    connect_lock: Mutex<()>,
}

impl DeviceSession {
    /// Wrap a peripheral handle
    #[must_use]
    pub fn new(link: Arc<dyn PeripheralLink>, config: SessionConfig) -> Self {
        Self {
            link,
            config,
            connect_lock: Mutex::new(()),
        }
    }

    /// Address of the peripheral
    #[must_use]
    pub fn address(&self) -> &str {
        self.link.address()
    }

    /// Session configuration
    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Advertised device name
    pub async fn name(&self) -> Option<String> {
        self.link.name().await
    }

    /// Check if the link is up
    pub async fn is_connected(&self) -> bool {
        self.link.is_connected().await
    }

    /// Latest transport lifecycle state
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.link.connection_state()
    }

    /// Every transport lifecycle transition from now on
    #[must_use]
    pub fn connection_events(&self) -> broadcast::Receiver<ConnectionState> {
        self.link.connection_events()
    }

    /// Establish the link unless it is already up
    ///
    /// Concurrent callers are serialized; whoever comes second finds the link
    /// up and returns immediately.
    ///
    /// # Errors
    ///
    /// Returns [`DemagError::ConnectionFailed`] if the link is rejected or
    /// does not come up within the configured timeout. Either way the link
    /// reports a `Disconnected` transition.
    pub async fn connect(&self) -> Result<()> {
        let _guard = self.connect_lock.lock().await;
        if self.link.is_connected().await {
            return Ok(());
        }

        let timeout_ms = self.config.connect_timeout_ms;
        match timeout(Duration::from_millis(timeout_ms), self.link.connect()).await {
            Ok(result) => result,
            Err(_) => {
                let reason = format!("connect timed out after {timeout_ms}ms");
                self.link.abandon_connect(&reason);
                Err(DemagError::ConnectionFailed(reason))
            }
        }
    }

    /// Tear the link down, waiting at most the configured disconnect timeout
    ///
    /// A timeout is logged and swallowed so teardown never blocks the caller
    /// past the bound.
    ///
    /// # Errors
    ///
    /// Returns transport errors other than the timeout.
    pub async fn disconnect(&self) -> Result<()> {
        let timeout_ms = self.config.disconnect_timeout_ms;
        match timeout(Duration::from_millis(timeout_ms), self.link.disconnect()).await {
            Ok(result) => result,
            Err(_) => {
                let e = DemagError::Timeout { timeout_ms };
                warn!("Disconnect from {}: {e}, giving up", self.address());
                Ok(())
            }
        }
    }

    async fn read_value<T: Payload>(&self, characteristic: Characteristic) -> Result<T> {
        let raw = self.link.read(characteristic).await?;
        T::decode_read(&raw).inspect_err(|e| warn!("Bad {characteristic:?} payload: {e}"))
    }

    async fn write_value<T: Payload>(&self, characteristic: Characteristic, value: &T) -> Result<()> {
        self.link.write(characteristic, &value.encode()).await
    }

    /// Read the PID configuration
    ///
    /// # Errors
    ///
    /// Returns connection or decode errors.
    pub async fn get_config(&self) -> Result<Conf> {
        self.read_value(Characteristic::Config).await
    }

    /// Write the PID configuration
    ///
    /// # Errors
    ///
    /// Returns connection errors.
    pub async fn set_config(&self, conf: Conf) -> Result<()> {
        info!(
            "Writing config kp={} ki={} kd={}",
            conf.kp, conf.ki, conf.kd
        );
        self.write_value(Characteristic::Config, &conf).await
    }

    /// Read the starting current
    ///
    /// # Errors
    ///
    /// Returns connection or decode errors.
    pub async fn get_start_current(&self) -> Result<f32> {
        self.read_value(Characteristic::StartCurrent).await
    }

    /// Write the starting current
    ///
    /// # Errors
    ///
    /// Returns connection errors.
    pub async fn set_start_current(&self, start_current: f32) -> Result<()> {
        info!("Writing start current {start_current}");
        self.write_value(Characteristic::StartCurrent, &start_current)
            .await
    }

    /// Send the start command
    ///
    /// # Errors
    ///
    /// Returns connection errors.
    pub async fn start(&self) -> Result<()> {
        info!("Sending start command");
        self.write_value(Characteristic::Command, &Command::Start)
            .await
    }

    /// Send the stop command
    ///
    /// # Errors
    ///
    /// Returns connection errors.
    pub async fn stop(&self) -> Result<()> {
        info!("Sending stop command");
        self.write_value(Characteristic::Command, &Command::Stop).await
    }

    /// Read the device state
    ///
    /// # Errors
    ///
    /// Returns connection errors, or a decode error for an empty or unknown state.
    pub async fn get_state(&self) -> Result<DeviceState> {
        self.read_value(Characteristic::State).await
    }

    /// Read the current cycle
    ///
    /// # Errors
    ///
    /// Returns connection or decode errors.
    pub async fn get_cycle(&self) -> Result<Cycle> {
        self.read_value(Characteristic::Cycle).await
    }

    /// Read the measured current
    ///
    /// # Errors
    ///
    /// Returns connection or decode errors.
    pub async fn get_current(&self) -> Result<f32> {
        self.read_value(Characteristic::Current).await
    }

    /// Read the device-side cycle statistics
    ///
    /// # Errors
    ///
    /// Returns connection or decode errors.
    pub async fn get_cycles_stat(&self) -> Result<Vec<DeviceCycleStat>> {
        self.read_value(Characteristic::CyclesStat).await
    }

    /// Merged state, cycle and current notifications in device emission order
    ///
    /// The stream survives reconnects: when the link drops it yields
    /// [`DemagError::ConnectionLost`] once, then resubscribes after the next
    /// `Connected` transition. It only ends when the link itself goes away.
    #[must_use]
    pub fn events(&self) -> BoxStream<'static, Result<DeviceEvent>> {
        self.feed(&Characteristic::NOTIFYING)
    }

    /// Live device state
    #[must_use]
    pub fn state(&self) -> BoxStream<'static, Result<DeviceState>> {
        self.feed(&[Characteristic::State])
            .filter_map(|event| {
                futures::future::ready(match event {
                    Ok(DeviceEvent::State(state)) => Some(Ok(state)),
                    Ok(_) => None,
                    Err(e) => Some(Err(e)),
                })
            })
            .boxed()
    }

    /// Live cycle announcements
    #[must_use]
    pub fn cycle(&self) -> BoxStream<'static, Result<Cycle>> {
        self.feed(&[Characteristic::Cycle])
            .filter_map(|event| {
                futures::future::ready(match event {
                    Ok(DeviceEvent::Cycle(cycle)) => Some(Ok(cycle)),
                    Ok(_) => None,
                    Err(e) => Some(Err(e)),
                })
            })
            .boxed()
    }

    /// Live current measurements
    #[must_use]
    pub fn current(&self) -> BoxStream<'static, Result<f32>> {
        self.feed(&[Characteristic::Current])
            .filter_map(|event| {
                futures::future::ready(match event {
                    Ok(DeviceEvent::Current(current)) => Some(Ok(current)),
                    Ok(_) => None,
                    Err(e) => Some(Err(e)),
                })
            })
            .boxed()
    }

    fn feed(&self, characteristics: &[Characteristic]) -> BoxStream<'static, Result<DeviceEvent>> {
        let feed = EventFeed {
            link: Arc::clone(&self.link),
            characteristics: characteristics.to_vec(),
            connection: self.link.connection_events(),
            inner: None,
            wait_for_connect: false,
        };

        stream::unfold(feed, |mut feed| async move {
            let item = feed.next_event().await?;
            Some((item, feed))
        })
        .boxed()
    }
}

/// Subscription that follows the link across reconnects
struct EventFeed {
    link: Arc<dyn PeripheralLink>,
    characteristics: Vec<Characteristic>,
    connection: broadcast::Receiver<ConnectionState>,
    inner: Option<NotificationStream>,
    wait_for_connect: bool,
}

impl EventFeed {
    async fn next_event(&mut self) -> Option<Result<DeviceEvent>> {
        loop {
            if let Some(inner) = self.inner.as_mut() {
                return match inner.next().await {
                    Some((characteristic, raw)) => Some(
                        DeviceEvent::decode(characteristic, &raw).inspect_err(|e| {
                            warn!("Bad {characteristic:?} notification: {e}");
                        }),
                    ),
                    None => {
                        debug!("Notification stream for {:?} ended", self.characteristics);
                        self.inner = None;
                        Some(Err(DemagError::ConnectionLost))
                    }
                };
            }

            // follow transitions from here on, then look at the link, so a
            // connect racing with us is seen either way
            self.connection = self.connection.resubscribe();
            if self.wait_for_connect || !self.link.is_connected().await {
                self.wait_connected().await?;
            }
            self.wait_for_connect = false;

            match self.link.subscribe(&self.characteristics).await {
                Ok(inner) => {
                    debug!("Subscribed to {:?}", self.characteristics);
                    self.inner = Some(inner);
                }
                Err(e) => {
                    warn!("Subscribing to {:?} failed: {e}", self.characteristics);
                    self.wait_for_connect = true;
                    return Some(Err(e));
                }
            }
        }
    }

    async fn wait_connected(&mut self) -> Option<()> {
        loop {
            match self.connection.recv().await {
                Ok(ConnectionState::Connected) => return Some(()),
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => {
                    if self.link.is_connected().await {
                        return Some(());
                    }
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// Holds the session for the currently selected device
///
/// The peripheral handle is replaced rather than mutated when the selection
/// changes, and the selected address is remembered through the settings store.
pub struct SessionSlot {
    factory: Arc<dyn LinkFactory>,
    store: Arc<dyn KeyValueStore>,
    config: SessionConfig,
    current: Option<Arc<DeviceSession>>,
}

impl SessionSlot {
    /// Create an empty slot
    #[must_use]
    pub fn new(
        factory: Arc<dyn LinkFactory>,
        store: Arc<dyn KeyValueStore>,
        config: SessionConfig,
    ) -> Self {
        Self {
            factory,
            store,
            config,
            current: None,
        }
    }

    /// Address selected in a previous run, if any
    ///
    /// # Errors
    ///
    /// Returns settings store errors.
    pub fn last_device(&self) -> Result<Option<String>> {
        settings::load_last_device(self.store.as_ref())
    }

    /// Session for the current selection
    #[must_use]
    pub fn current(&self) -> Option<Arc<DeviceSession>> {
        self.current.clone()
    }

    /// Return a session for `address`, replacing the current one if it targets another device
    ///
    /// # Errors
    ///
    /// Returns settings store errors when persisting the selection.
    pub async fn ensure_device(&mut self, address: &str) -> Result<Arc<DeviceSession>> {
        if let Some(session) = &self.current {
            if session.address() == address {
                return Ok(Arc::clone(session));
            }

            info!("Switching device {} -> {address}", session.address());
            if let Err(e) = session.disconnect().await {
                warn!("Disconnecting {} failed: {e}", session.address());
            }
        }

        let session = Arc::new(DeviceSession::new(
            self.factory.open(address),
            self.config.clone(),
        ));
        settings::save_last_device(self.store.as_ref(), address)?;
        self.current = Some(Arc::clone(&session));
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        settings::MemoryStore,
        transport::fake::{FakeFactory, FakeLink},
    };
    use tokio_test::{assert_err, assert_ok};

    fn session_with(link: &Arc<FakeLink>) -> DeviceSession {
        DeviceSession::new(link.clone(), SessionConfig::default())
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let link = FakeLink::new("AA");
        let session = session_with(&link);

        assert_ok!(session.connect().await);
        assert_ok!(session.connect().await);
        assert_eq!(link.connect_calls(), 1);
        assert!(session.is_connected().await);
        assert_eq!(session.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_concurrent_connects_are_tolerated() {
        let link = FakeLink::new("AA");
        let session = Arc::new(session_with(&link));

        let (a, b) = tokio::join!(session.connect(), session.connect());
        assert_ok!(a);
        assert_ok!(b);
        assert_eq!(link.connect_calls(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_surfaces() {
        let link = FakeLink::new("AA");
        link.set_fail_connect(true);
        let session = session_with(&link);

        let error = assert_err!(session.connect().await);
        assert!(error.is_connection_error());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_reports_disconnect() {
        let link = FakeLink::new("AA");
        link.set_hang_connect(true);
        let session = session_with(&link);
        let mut events = session.connection_events();

        let error = assert_err!(session.connect().await);
        assert!(matches!(error, DemagError::ConnectionFailed(_)));
        assert!(!session.is_connected().await);

        assert_eq!(events.recv().await.unwrap(), ConnectionState::Connecting);
        assert!(matches!(
            events.recv().await.unwrap(),
            ConnectionState::Disconnected(Some(_))
        ));
        assert!(matches!(
            session.connection_state(),
            ConnectionState::Disconnected(Some(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_timeout_is_swallowed() {
        let link = FakeLink::new("AA");
        let session = session_with(&link);
        session.connect().await.unwrap();
        link.set_hang_disconnect(true);

        let started = tokio::time::Instant::now();
        assert_ok!(session.disconnect().await);
        assert!(started.elapsed() >= Duration::from_millis(5_000));
    }

    #[tokio::test]
    async fn test_requests_round_trip_through_the_link() {
        let link = FakeLink::new("AA");
        let session = session_with(&link);
        session.connect().await.unwrap();

        let conf = Conf::new(2.0, 0.5, 0.125);
        session.set_config(conf).await.unwrap();
        assert_eq!(session.get_config().await.unwrap(), conf);

        session.set_start_current(3.5).await.unwrap();
        assert!((session.get_start_current().await.unwrap() - 3.5).abs() < f32::EPSILON);

        session.start().await.unwrap();
        session.stop().await.unwrap();
        let commands: Vec<_> = link
            .writes()
            .into_iter()
            .filter(|(c, _)| *c == Characteristic::Command)
            .map(|(_, raw)| raw)
            .collect();
        assert_eq!(commands, vec![vec![1], vec![2]]);
    }

    #[tokio::test]
    async fn test_uninitialized_reads() {
        let link = FakeLink::new("AA");
        let session = session_with(&link);
        session.connect().await.unwrap();

        assert_eq!(session.get_config().await.unwrap(), Conf::default());
        assert_eq!(session.get_cycle().await.unwrap(), Cycle::default());
        assert!(session.get_current().await.unwrap().abs() < f32::EPSILON);
        assert!(session.get_cycles_stat().await.unwrap().is_empty());
        assert!(matches!(
            session.get_state().await,
            Err(DemagError::EmptyState)
        ));

        link.set_value(Characteristic::State, &[5]);
        assert_eq!(session.get_state().await.unwrap(), DeviceState::InTest);
    }

    #[tokio::test]
    async fn test_requests_fail_when_disconnected() {
        let link = FakeLink::new("AA");
        let session = session_with(&link);

        assert!(matches!(
            session.get_current().await,
            Err(DemagError::ConnectionLost)
        ));
        assert!(session.start().await.is_err());
    }

    #[tokio::test]
    async fn test_events_preserve_emission_order() {
        let link = FakeLink::new("AA");
        let session = session_with(&link);
        session.connect().await.unwrap();

        let mut events = session.events();
        let cycle = Cycle {
            num: 1,
            target_current: 4.0,
            polarity: true,
        };

        let pushing = async {
            while link.subscriber_count() == 0 {
                tokio::task::yield_now().await;
            }
            link.notify(Characteristic::Cycle, &cycle.encode());
            link.notify(Characteristic::Current, &2.0f32.to_le_bytes());
            link.notify(Characteristic::State, &[3]);
        };
        let collecting = async {
            let mut seen = Vec::new();
            for _ in 0..3 {
                seen.push(events.next().await.unwrap().unwrap());
            }
            seen
        };

        let ((), seen) = tokio::join!(pushing, collecting);
        assert_eq!(
            seen,
            vec![
                DeviceEvent::Cycle(cycle),
                DeviceEvent::Current(2.0),
                DeviceEvent::State(DeviceState::CyclesEnded),
            ]
        );
    }

    #[tokio::test]
    async fn test_subscription_survives_reconnect() {
        let link = FakeLink::new("AA");
        let session = session_with(&link);
        session.connect().await.unwrap();

        let mut currents = session.current();
        let first = async {
            while link.subscriber_count() == 0 {
                tokio::task::yield_now().await;
            }
            link.notify(Characteristic::Current, &1.0f32.to_le_bytes());
        };
        let (item, ()) = tokio::join!(currents.next(), first);
        assert!((item.unwrap().unwrap() - 1.0).abs() < f32::EPSILON);

        link.drop_link("out of range");
        assert!(matches!(
            currents.next().await,
            Some(Err(DemagError::ConnectionLost))
        ));

        let again = async {
            session.connect().await.unwrap();
            while link.subscriber_count() == 0 {
                tokio::task::yield_now().await;
            }
            link.notify(Characteristic::Current, &7.5f32.to_le_bytes());
        };
        let (item, ()) = tokio::join!(currents.next(), again);
        assert!((item.unwrap().unwrap() - 7.5).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn test_dropping_stream_releases_subscription() {
        let link = FakeLink::new("AA");
        let session = session_with(&link);
        session.connect().await.unwrap();

        let mut states = session.state();
        let pushing = async {
            while link.subscriber_count() == 0 {
                tokio::task::yield_now().await;
            }
            link.notify(Characteristic::State, &[6]);
        };
        let (item, ()) = tokio::join!(states.next(), pushing);
        assert_eq!(item.unwrap().unwrap(), DeviceState::InMain);

        drop(states);
        assert_eq!(link.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_notification_is_reported() {
        let link = FakeLink::new("AA");
        let session = session_with(&link);
        session.connect().await.unwrap();

        let mut cycles = session.cycle();
        let pushing = async {
            while link.subscriber_count() == 0 {
                tokio::task::yield_now().await;
            }
            link.notify(Characteristic::Cycle, &[1, 2, 3]);
        };
        let (item, ()) = tokio::join!(cycles.next(), pushing);
        assert!(item.unwrap().unwrap_err().is_decode_error());
    }

    #[tokio::test]
    async fn test_slot_replaces_handle_on_device_change() {
        let factory = Arc::new(FakeFactory::default());
        let store = Arc::new(MemoryStore::default());
        let mut slot = SessionSlot::new(factory.clone(), store.clone(), SessionConfig::default());
        assert_eq!(slot.last_device().unwrap(), None);

        let first = slot.ensure_device("AA").await.unwrap();
        first.connect().await.unwrap();
        let same = slot.ensure_device("AA").await.unwrap();
        assert!(Arc::ptr_eq(&first, &same));
        assert_eq!(factory.opened(), vec!["AA".to_string()]);

        let second = slot.ensure_device("BB").await.unwrap();
        assert_eq!(second.address(), "BB");
        assert_eq!(factory.link("AA").disconnect_calls(), 1);
        assert!(!first.is_connected().await);
        assert_eq!(slot.last_device().unwrap().as_deref(), Some("BB"));
        assert!(Arc::ptr_eq(&slot.current().unwrap(), &second));
    }
}
