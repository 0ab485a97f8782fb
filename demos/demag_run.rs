use std::{env, sync::Arc};
use tracing::{error, info, warn};
use demag_ble::{
    calc_start_current, BleManager, Conf, DemagError, JsonFileStore, Result, RunController,
    SessionConfig, SessionSlot,
};

const SETTINGS_FILE: &str = "demag-settings.json";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🧲 Demagnetization Run Example");
    info!("Usage: demag_run [ADDRESS] [NOMINAL_CURRENT_A] [NO_LOAD_PERCENT]");

    let args: Vec<String> = env::args().skip(1).collect();
    let nominal_current: f32 = args.get(1).and_then(|v| v.parse().ok()).unwrap_or(381.7);
    let no_load_percent: f32 = args.get(2).and_then(|v| v.parse().ok()).unwrap_or(0.45);

    let config = SessionConfig::default();
    let manager = Arc::new(BleManager::new(config.clone()).await?);
    let store = Arc::new(JsonFileStore::open(SETTINGS_FILE)?);
    let mut slot = SessionSlot::new(manager, store, config);

    let address = match args.first().cloned().or(slot.last_device()?) {
        Some(address) => address,
        None => {
            error!("❌ No device address given and none remembered, run scan_devices first");
            return Err(DemagError::DeviceNotFound {
                address: String::new(),
            });
        }
    };

    let session = slot.ensure_device(&address).await?;
    info!("🔌 Connecting to {}...", address);
    session.connect().await?;

    let start_current = calc_start_current(nominal_current, no_load_percent);
    info!(
        "⚙️  Start current {:.3} A ({} A nominal, {}% no-load)",
        start_current, nominal_current, no_load_percent
    );
    session.set_config(Conf::new(1.0, 0.1, 0.0)).await?;
    session.set_start_current(start_current).await?;

    let controller = RunController::spawn(session);
    let mut snapshots = controller.subscribe();

    info!("▶️  Starting run (Ctrl-C to stop)");
    controller.start().await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("🛑 Stopping run");
                if let Err(e) = controller.stop().await {
                    error!("❌ Failed to stop: {}", e);
                }
                break;
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                if let Some(state) = snapshot.state {
                    info!("📊 {} | {}", state, snapshot.connection);
                }
                if let (Some(cycle), Some(current)) = (snapshot.cycle, snapshot.current) {
                    info!(
                        "  cycle {} target {:.2} A measured {:.2} A",
                        cycle.num, cycle.target_current, current
                    );
                }
                if let Some(error) = &snapshot.error {
                    warn!("  ⚠️  {}", error);
                }
                if let Some(summary) = &snapshot.summary {
                    info!("✅ Run finished in {} ms", summary.total_duration_ms);
                    for stat in &summary.results {
                        info!(
                            "  cycle {}: peak {:.2} A over {} ms",
                            stat.cycle.num, stat.peak_current, stat.duration_ms
                        );
                    }
                    if !snapshot.device_stats.is_empty() {
                        info!(
                            "  device reports {} cycles, total duration {}",
                            snapshot.device_stats.len(),
                            snapshot.device_stats_duration
                        );
                    }
                    if !snapshot.device_stats.is_empty() || snapshot.error.is_some() {
                        break;
                    }
                }
            }
        }
    }

    controller.shutdown().await?;
    info!("👋 Disconnected");
    Ok(())
}
