use futures::StreamExt;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex, PoisonError},
    time::Duration,
};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
    time::{interval, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::Result,
    protocol::SERVICE_UUID,
    transport::AdvertisementSource,
    types::{Advertisement, DeviceInfo, DiscoveryConfig},
};

/// How often a running scan drops devices that went quiet
const PRUNE_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
struct Seen {
    advertisement: Advertisement,
    last_seen: Instant,
}

/// Time-windowed set of recently advertised devices
#[derive(Debug)]
pub struct DeviceRegistry {
    entries: HashMap<String, Seen>,
    ttl: Duration,
    service: Uuid,
}

impl DeviceRegistry {
    /// Registry accepting advertisements of `service`
    #[must_use]
    pub fn new(service: Uuid, config: &DiscoveryConfig) -> Self {
        Self {
            entries: HashMap::new(),
            ttl: Duration::from_millis(config.advertisement_ttl_ms),
            service,
        }
    }

    /// Record an advertisement; ones without the expected service are ignored
    ///
    /// Returns whether the advertisement was accepted.
    pub fn upsert(&mut self, advertisement: Advertisement, now: Instant) -> bool {
        if !advertisement.services.contains(&self.service) {
            return false;
        }

        if !self.entries.contains_key(&advertisement.address) {
            debug!(
                "New device {} ({})",
                advertisement.address,
                advertisement.name.as_deref().unwrap_or("unnamed")
            );
        }
        self.entries.insert(
            advertisement.address.clone(),
            Seen {
                advertisement,
                last_seen: now,
            },
        );
        true
    }

    /// Mark every known device as just seen
    pub fn refresh_all(&mut self, now: Instant) {
        for seen in self.entries.values_mut() {
            seen.last_seen = now;
        }
    }

    /// Drop stale entries and return the rest, strongest signal first
    pub fn visible(&mut self, now: Instant) -> Vec<DeviceInfo> {
        let ttl = self.ttl;
        self.entries.retain(|_, seen| seen.last_seen + ttl > now);

        let mut devices: Vec<DeviceInfo> = self
            .entries
            .values()
            .map(|seen| DeviceInfo::from(&seen.advertisement))
            .collect();
        devices.sort_by(|a, b| b.rssi.cmp(&a.rssi).then_with(|| a.address.cmp(&b.address)));
        devices
    }

    /// Number of tracked entries, stale ones included
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Scans for demagnetizers and publishes the visible device list
///
/// Every publication replaces the whole list.
pub struct Discovery {
    registry: Arc<Mutex<DeviceRegistry>>,
    devices: watch::Sender<Vec<DeviceInfo>>,
    source: Arc<dyn AdvertisementSource>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl Discovery {
    /// Create a stopped discovery over `source`
    #[must_use]
    pub fn new(source: Arc<dyn AdvertisementSource>, config: &DiscoveryConfig) -> Self {
        let (devices, _) = watch::channel(Vec::new());
        Self {
            registry: Arc::new(Mutex::new(DeviceRegistry::new(SERVICE_UUID, config))),
            devices,
            source,
            task: StdMutex::new(None),
        }
    }

    /// Receiver of the visible device list
    #[must_use]
    pub fn devices(&self) -> watch::Receiver<Vec<DeviceInfo>> {
        self.devices.subscribe()
    }

    /// Whether a scan is running
    #[must_use]
    pub fn is_scanning(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Start scanning; no-op if a scan is already running
    ///
    /// Devices seen by an earlier scan get a fresh timestamp so they are not
    /// pruned just because the scan restarted.
    ///
    /// # Errors
    ///
    /// Returns an error if the scan cannot be started.
    pub async fn start_scan(&self) -> Result<()> {
        if self.is_scanning() {
            return Ok(());
        }

        {
            let mut registry = self.registry.lock().await;
            let now = Instant::now();
            registry.refresh_all(now);
            let visible = registry.visible(now);
            self.devices.send_replace(visible);
        }

        let mut advertisements = self.source.advertisements(SERVICE_UUID).await?;
        info!("Scanning for devices");

        let registry = Arc::clone(&self.registry);
        let devices = self.devices.clone();
        let handle = tokio::spawn(async move {
            let mut prune = interval(PRUNE_INTERVAL);
            prune.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    advertisement = advertisements.next() => {
                        let Some(advertisement) = advertisement else {
                            break;
                        };
                        let mut registry = registry.lock().await;
                        let now = Instant::now();
                        if registry.upsert(advertisement, now) {
                            devices.send_replace(registry.visible(now));
                        }
                    }
                    _ = prune.tick() => {
                        let mut registry = registry.lock().await;
                        publish_if_changed(&devices, registry.visible(Instant::now()));
                    }
                }
            }
            debug!("Advertisement stream ended");
        });

        let previous = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(())
    }

    /// Stop scanning; no-op if no scan is running
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying scan cannot be stopped.
    pub async fn stop_scan(&self) -> Result<()> {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(task) = task else {
            return Ok(());
        };

        task.abort();
        info!("Scan stopped");
        self.source.stop().await.inspect_err(|e| warn!("Stopping scan failed: {e}"))
    }

    /// Re-prune the visible list without waiting for the next scheduled prune
    pub async fn prune(&self) {
        let mut registry = self.registry.lock().await;
        publish_if_changed(&self.devices, registry.visible(Instant::now()));
    }
}

fn publish_if_changed(devices: &watch::Sender<Vec<DeviceInfo>>, visible: Vec<DeviceInfo>) {
    devices.send_if_modified(|current| {
        if *current == visible {
            false
        } else {
            *current = visible;
            true
        }
    });
}

impl Drop for Discovery {
    fn drop(&mut self) {
        if let Some(task) = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}
