use std::{sync::Arc, time::Duration};
use tokio::time::timeout;
use tracing::{error, info};
use demag_ble::{BleManager, Discovery, DiscoveryConfig, Result, SessionConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🧲 Demagnetizer Scan Example");

    let manager = match BleManager::new(SessionConfig::default()).await {
        Ok(manager) => manager,
        Err(e) => {
            error!("❌ Bluetooth unavailable: {}", e);
            return Err(e);
        }
    };

    let discovery = Discovery::new(Arc::new(manager.scanner()), &DiscoveryConfig::default());
    let mut devices = discovery.devices();
    discovery.start_scan().await?;
    info!("🔍 Scanning for 15 seconds...");

    let scan = async {
        while devices.changed().await.is_ok() {
            let list = devices.borrow_and_update().clone();
            info!("📡 {} device(s) visible", list.len());
            for device in list {
                info!(
                    "  {} {:>4} dBm  {}",
                    device.address,
                    device.rssi,
                    device.name.as_deref().unwrap_or("(unnamed)")
                );
            }
        }
    };
    let _ = timeout(Duration::from_secs(15), scan).await;

    discovery.stop_scan().await?;
    info!("✅ Scan finished");
    Ok(())
}
