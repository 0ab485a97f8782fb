use async_trait::async_trait;
use btleplug::{
    api::{
        Central, CentralEvent, Characteristic as GattCharacteristic, Manager as _,
        Peripheral as _, ScanFilter, WriteType,
    },
    platform::{Adapter, Manager, Peripheral},
};
use futures::stream::StreamExt;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex, PoisonError},
    time::Duration,
};
use tokio::{
    sync::{broadcast, broadcast::error::RecvError, Mutex, RwLock},
    task::JoinHandle,
    time::{sleep, timeout, Instant},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{DemagError, Result},
    protocol::{Characteristic, SERVICE_UUID},
    transport::{
        AdvertisementSource, AdvertisementStream, ConnectionStateCell, LinkFactory,
        NotificationStream, PeripheralLink,
    },
    types::{Advertisement, ConnectionState, SessionConfig},
};

const LOCATE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// BLE manager bound to the first Bluetooth adapter of the host
pub struct BleManager {
    #[allow(dead_code)]
    manager: Manager,
    adapter: Adapter,
    config: SessionConfig,
}

impl BleManager {
    /// Create a new BLE manager
    ///
    /// # Errors
    ///
    /// Returns [`DemagError::AdapterNotFound`] if no Bluetooth adapters are available,
    /// or [`DemagError::Ble`] if the Bluetooth stack cannot be initialized.
    pub async fn new(config: SessionConfig) -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(DemagError::AdapterNotFound)?;

        Ok(Self {
            manager,
            adapter,
            config,
        })
    }

    /// Advertisement source backed by this adapter
    #[must_use]
    pub fn scanner(&self) -> BleScanner {
        BleScanner {
            adapter: self.adapter.clone(),
        }
    }
}

impl LinkFactory for BleManager {
    fn open(&self, address: &str) -> Arc<dyn PeripheralLink> {
        Arc::new(BleLink::new(
            self.adapter.clone(),
            address,
            self.config.clone(),
        ))
    }
}

/// Scans the adapter for demagnetizer advertisements
pub struct BleScanner {
    adapter: Adapter,
}

#[async_trait]
impl AdvertisementSource for BleScanner {
    async fn advertisements(&self, service: Uuid) -> Result<AdvertisementStream> {
        let events = self.adapter.events().await?;
        self.adapter
            .start_scan(ScanFilter {
                services: vec![service],
            })
            .await?;
        info!("Scanning for devices advertising {service}");

        let adapter = self.adapter.clone();
        let stream = events.filter_map(move |event| {
            let adapter = adapter.clone();
            async move {
                match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        let peripheral = adapter.peripheral(&id).await.ok()?;
                        advertisement_of(&peripheral).await
                    }
                    _ => None,
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn stop(&self) -> Result<()> {
        self.adapter.stop_scan().await?;
        info!("Scan stopped");
        Ok(())
    }
}

/// Extract advertisement data from BLE properties
async fn advertisement_of(peripheral: &Peripheral) -> Option<Advertisement> {
    let properties = peripheral.properties().await.ok()??;
    Some(Advertisement {
        address: properties.address.to_string(),
        name: properties.local_name,
        rssi: properties.rssi.unwrap_or(0),
        services: properties.services,
    })
}

/// Link to one demagnetizer peripheral through btleplug
pub struct BleLink {
    adapter: Adapter,
    address: String,
    config: SessionConfig,
    peripheral: Mutex<Option<Peripheral>>,
    characteristics: RwLock<HashMap<Characteristic, GattCharacteristic>>,
    state: Arc<ConnectionStateCell>,
    watcher: StdMutex<Option<JoinHandle<()>>>,
}

impl BleLink {
    fn new(adapter: Adapter, address: &str, config: SessionConfig) -> Self {
        Self {
            adapter,
            address: address.to_string(),
            config,
            peripheral: Mutex::new(None),
            characteristics: RwLock::new(HashMap::new()),
            state: Arc::new(ConnectionStateCell::new()),
            watcher: StdMutex::new(None),
        }
    }

    async fn find_known(&self) -> Result<Option<Peripheral>> {
        for peripheral in self.adapter.peripherals().await? {
            if peripheral.address().to_string() == self.address {
                return Ok(Some(peripheral));
            }
        }
        Ok(None)
    }

    /// Find the peripheral among the adapter's known devices, scanning briefly if needed
    async fn locate(&self) -> Result<Peripheral> {
        if let Some(peripheral) = self.peripheral.lock().await.clone() {
            return Ok(peripheral);
        }

        let peripheral = if let Some(peripheral) = self.find_known().await? {
            peripheral
        } else {
            debug!("{} not known to the adapter yet, scanning", self.address);
            self.adapter
                .start_scan(ScanFilter {
                    services: vec![SERVICE_UUID],
                })
                .await?;
            let deadline = Instant::now() + Duration::from_millis(self.config.locate_timeout_ms);
            let found = loop {
                if let Some(peripheral) = self.find_known().await? {
                    break Some(peripheral);
                }
                if Instant::now() >= deadline {
                    break None;
                }
                sleep(LOCATE_POLL_INTERVAL).await;
            };
            if let Err(e) = self.adapter.stop_scan().await {
                debug!("Failed to stop locate scan: {e}");
            }
            found.ok_or_else(|| DemagError::DeviceNotFound {
                address: self.address.clone(),
            })?
        };

        *self.peripheral.lock().await = Some(peripheral.clone());
        Ok(peripheral)
    }

    async fn establish(&self) -> Result<()> {
        let peripheral = self.locate().await?;

        if !peripheral.is_connected().await? {
            timeout(
                Duration::from_millis(self.config.connect_timeout_ms),
                peripheral.connect(),
            )
            .await
            .map_err(|_| {
                DemagError::ConnectionFailed(format!(
                    "timed out after {}ms",
                    self.config.connect_timeout_ms
                ))
            })?
            .map_err(|e| DemagError::ConnectionFailed(e.to_string()))?;
        }

        peripheral.discover_services().await?;

        let discovered = peripheral.characteristics();
        let mut characteristics = HashMap::new();
        for characteristic in Characteristic::ALL {
            let uuid = characteristic.uuid();
            let gatt = discovered
                .iter()
                .find(|c| c.uuid == uuid)
                .ok_or(DemagError::MissingCharacteristic(uuid))?
                .clone();
            characteristics.insert(characteristic, gatt);
        }
        *self.characteristics.write().await = characteristics;

        self.start_watcher(&peripheral).await;
        Ok(())
    }

    /// Follow adapter events and publish a disconnect of our peripheral
    async fn start_watcher(&self, peripheral: &Peripheral) {
        {
            let watcher = self.watcher.lock().unwrap_or_else(PoisonError::into_inner);
            if watcher.as_ref().is_some_and(|task| !task.is_finished()) {
                return;
            }
        }

        let mut events = match self.adapter.events().await {
            Ok(events) => events,
            Err(e) => {
                warn!("Disconnect watcher: could not subscribe to adapter events: {e}");
                return;
            }
        };

        let id = peripheral.id();
        let state = Arc::clone(&self.state);
        let address = self.address.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(disconnected) = event {
                    if disconnected == id {
                        info!("{address} disconnected");
                        state.publish(ConnectionState::Disconnected(None));
                    }
                }
            }
        });

        *self.watcher.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    async fn connected_peripheral(&self) -> Result<Peripheral> {
        let peripheral = self
            .peripheral
            .lock()
            .await
            .clone()
            .ok_or(DemagError::ConnectionLost)?;
        if !peripheral.is_connected().await.unwrap_or(false) {
            return Err(DemagError::ConnectionLost);
        }
        Ok(peripheral)
    }

    async fn gatt(&self, characteristic: Characteristic) -> Result<GattCharacteristic> {
        self.characteristics
            .read()
            .await
            .get(&characteristic)
            .cloned()
            .ok_or(DemagError::ConnectionLost)
    }

    /// Report transport failures on a dropped link as a lost connection
    async fn classify(&self, peripheral: &Peripheral, error: btleplug::Error) -> DemagError {
        if peripheral.is_connected().await.unwrap_or(false) {
            DemagError::Ble(error)
        } else {
            DemagError::ConnectionLost
        }
    }
}

#[async_trait]
impl PeripheralLink for BleLink {
    fn address(&self) -> &str {
        &self.address
    }

    async fn name(&self) -> Option<String> {
        let peripheral = self.peripheral.lock().await.clone()?;
        peripheral.properties().await.ok()??.local_name
    }

    async fn is_connected(&self) -> bool {
        match self.peripheral.lock().await.as_ref() {
            Some(peripheral) => peripheral.is_connected().await.unwrap_or(false),
            None => false,
        }
    }

    async fn connect(&self) -> Result<()> {
        info!("Connecting to {}", self.address);
        self.state.publish(ConnectionState::Connecting);

        match self.establish().await {
            Ok(()) => {
                info!("Connected to {}", self.address);
                self.state.publish(ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                warn!("Connection to {} failed: {e}", self.address);
                self.state
                    .publish(ConnectionState::Disconnected(Some(e.to_string())));
                Err(match e {
                    DemagError::Ble(e) => DemagError::ConnectionFailed(e.to_string()),
                    other => other,
                })
            }
        }
    }

    async fn disconnect(&self) -> Result<()> {
        let Some(peripheral) = self.peripheral.lock().await.clone() else {
            return Ok(());
        };

        self.state.publish(ConnectionState::Disconnecting);
        let result = peripheral.disconnect().await;
        self.state.publish(ConnectionState::Disconnected(None));
        result?;
        Ok(())
    }

    fn abandon_connect(&self, reason: &str) {
        warn!("Connection to {} abandoned: {reason}", self.address);
        self.state
            .publish(ConnectionState::Disconnected(Some(reason.to_string())));
    }

    async fn read(&self, characteristic: Characteristic) -> Result<Vec<u8>> {
        let peripheral = self.connected_peripheral().await?;
        let gatt = self.gatt(characteristic).await?;

        match peripheral.read(&gatt).await {
            Ok(raw) => {
                debug!("Read {characteristic:?}: {raw:02X?}");
                Ok(raw)
            }
            Err(e) => Err(self.classify(&peripheral, e).await),
        }
    }

    async fn write(&self, characteristic: Characteristic, payload: &[u8]) -> Result<()> {
        let peripheral = self.connected_peripheral().await?;
        let gatt = self.gatt(characteristic).await?;
        debug!("Writing {characteristic:?}: {payload:02X?}");

        match peripheral
            .write(&gatt, payload, WriteType::WithResponse)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => Err(self.classify(&peripheral, e).await),
        }
    }

    async fn subscribe(&self, characteristics: &[Characteristic]) -> Result<NotificationStream> {
        let peripheral = self.connected_peripheral().await?;
        let mut states = self.state.subscribe();

        // open the stream first so nothing emitted right after subscribing is lost
        let notifications = peripheral.notifications().await?;
        for characteristic in characteristics {
            let gatt = self.gatt(*characteristic).await?;
            if let Err(e) = peripheral.subscribe(&gatt).await {
                return Err(self.classify(&peripheral, e).await);
            }
        }

        let wanted = characteristics.to_vec();
        let stream = notifications.filter_map(move |notification| {
            let source = Characteristic::from_uuid(notification.uuid)
                .filter(|characteristic| wanted.contains(characteristic))
                .map(|characteristic| (characteristic, notification.value));
            futures::future::ready(source)
        });

        // btleplug keeps the stream open across disconnects on some platforms
        let dropped = async move {
            loop {
                match states.recv().await {
                    Ok(ConnectionState::Disconnected(_)) | Err(RecvError::Closed) => break,
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                }
            }
        };

        Ok(stream.take_until(dropped).boxed())
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn connection_state(&self) -> ConnectionState {
        self.state.current()
    }
}

impl Drop for BleLink {
    fn drop(&mut self) {
        if let Some(task) = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_characteristics_share_service_prefix() {
        let service = SERVICE_UUID.as_bytes();
        for characteristic in Characteristic::ALL {
            let uuid = characteristic.uuid();
            assert_eq!(&uuid.as_bytes()[..15], &service[..15]);
            assert_ne!(uuid, SERVICE_UUID);
        }
    }
}
