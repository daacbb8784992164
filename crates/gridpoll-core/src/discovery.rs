//! ---
//! gridpoll_section: "01-core-functionality"
//! gridpoll_subsection: "module"
//! gridpoll_type: "source"
//! gridpoll_scope: "code"
//! gridpoll_description: "Adaptive polling core wiring discovery, sessions, dispatch and aggregation."
//! gridpoll_version: "v0.1.0"
//! gridpoll_owner: "tbd"
//! ---
use anyhow::Result;
use tracing::{info, warn};
use url::Url;

use gridpoll_wire::{DeviceDiscovery, WakeProbe};

/// One startup discovery pass with the wake-and-retry policy.
///
/// Round one is a full broadcast scan. If required devices are still
/// missing afterwards, every pre-registered address that has not answered
/// gets one best-effort HTTP wake probe (some devices keep their telemetry
/// stack asleep until their web interface is touched), followed by a
/// single narrower round. No further retries; a meter-only install runs
/// fine without any inverter.
pub async fn run_discovery(
    discovery: &dyn DeviceDiscovery,
    probe: &dyn WakeProbe,
) -> Result<usize> {
    info!("starting device discovery");
    let mut registered = discovery.discover_devices(true).await?;

    if discovery.missing_count() > 0 {
        info!(
            missing = discovery.missing_count(),
            "required devices missing after full scan, probing silent addresses"
        );
        for device in discovery.devices() {
            if !device.has_address_only() {
                continue;
            }
            let Some(address) = device.address else {
                continue;
            };
            let url = Url::parse(&format!("http://{address}/"))?;
            match probe.probe(&url).await {
                Ok(status) => info!(%address, status, "wake probe answered"),
                Err(err) => warn!(%address, error = %err, "wake probe failed"),
            }
        }
        registered = discovery.discover_devices(false).await?;
    }

    if registered == 0 {
        warn!("no devices registered, polling loop will idle");
    } else {
        info!(
            registered,
            missing = discovery.missing_count(),
            "device discovery finished"
        );
    }
    Ok(registered)
}
