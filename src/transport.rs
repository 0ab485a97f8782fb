use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::{
    error::Result,
    protocol::Characteristic,
    types::{Advertisement, ConnectionState},
};

/// Raw notifications tagged with their source characteristic, in emission order
pub type NotificationStream = BoxStream<'static, (Characteristic, Vec<u8>)>;

/// Advertisements delivered by a running scan
pub type AdvertisementStream = BoxStream<'static, Advertisement>;

/// Narrow view of one BLE peripheral
///
/// Writes are always acknowledged (write-with-response). Operations fail with
/// [`crate::DemagError::ConnectionLost`] when the link drops underneath them.
#[async_trait]
pub trait PeripheralLink: Send + Sync {
    /// Stable address of the peripheral
    fn address(&self) -> &str;

    /// Advertised name, when known
    async fn name(&self) -> Option<String>;

    /// Whether the link is currently up
    async fn is_connected(&self) -> bool;

    /// Establish the link and discover the service
    async fn connect(&self) -> Result<()>;

    /// Tear the link down
    async fn disconnect(&self) -> Result<()>;

    /// Report a connect attempt the caller stopped waiting for as a disconnect
    fn abandon_connect(&self, reason: &str);

    /// Read the current value of a characteristic
    async fn read(&self, characteristic: Characteristic) -> Result<Vec<u8>>;

    /// Write a value with response
    async fn write(&self, characteristic: Characteristic, payload: &[u8]) -> Result<()>;

    /// Enable notifications and return their merged stream
    ///
    /// The stream ends when the link drops.
    async fn subscribe(&self, characteristics: &[Characteristic]) -> Result<NotificationStream>;

    /// Receiver for every connection state transition from now on
    fn connection_events(&self) -> broadcast::Receiver<ConnectionState>;

    /// Latest connection state
    fn connection_state(&self) -> ConnectionState;
}

/// Source of advertisements for device discovery
#[async_trait]
pub trait AdvertisementSource: Send + Sync {
    /// Start scanning for advertisements carrying `service`
    async fn advertisements(&self, service: Uuid) -> Result<AdvertisementStream>;

    /// Stop the underlying scan
    async fn stop(&self) -> Result<()>;
}

/// Creates peripheral handles by address
pub trait LinkFactory: Send + Sync {
    /// Acquire a fresh handle for the peripheral at `address`
    fn open(&self, address: &str) -> Arc<dyn PeripheralLink>;
}

/// Current connection state plus a broadcast of its transitions
///
/// Repeated publications of the same state are dropped so one physical
/// disconnect yields one `Disconnected` event.
#[derive(Debug)]
pub struct ConnectionStateCell {
    current: Mutex<ConnectionState>,
    events: broadcast::Sender<ConnectionState>,
}

impl ConnectionStateCell {
    /// Create a cell in the disconnected state
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            current: Mutex::new(ConnectionState::default()),
            events,
        }
    }

    /// Record a transition and broadcast it if it differs from the current state
    pub fn publish(&self, state: ConnectionState) {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if *current == state {
            return;
        }
        debug!("Connection state: {} -> {}", *current, state);
        *current = state.clone();
        // no receivers is fine
        let _ = self.events.send(state);
    }

    /// Latest state
    pub fn current(&self) -> ConnectionState {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Subscribe to future transitions
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionState> {
        self.events.subscribe()
    }
}

impl Default for ConnectionStateCell {
    fn default() -> Self {
        Self::new()
    }
}
