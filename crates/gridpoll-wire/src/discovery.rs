//! ---
//! gridpoll_section: "02-wire-protocol-data-model"
//! gridpoll_subsection: "module"
//! gridpoll_type: "source"
//! gridpoll_scope: "code"
//! gridpoll_description: "Gridwire protocol codec and device collaborators."
//! gridpoll_version: "v0.1.0"
//! gridpoll_owner: "tbd"
//! ---
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::codec::{decode_frame, encode_discovery_ping, DiscoveryPong, InboundPayload};
use crate::device::{Device, RegistrationState, GRIDWIRE_PORT};
use crate::Result;

const RESPONSE_WINDOW: Duration = Duration::from_secs(2);
const MAX_DATAGRAM: usize = 512;

/// Device registry and discovery rounds, as consumed by the discovery
/// coordinator in `gridpoll-core`.
#[async_trait]
pub trait DeviceDiscovery: Send + Sync {
    /// Register a device by address before discovery; its identity is
    /// confirmed once it answers a ping.
    fn pre_register_device(&self, address: IpAddr);

    /// Require a device by serial; it stays missing until an answer maps
    /// the serial to an address.
    fn require_device(&self, serial: u32);

    /// Run one discovery pass and return the fully registered count.
    async fn discover_devices(&self, full_scan: bool) -> Result<usize>;

    /// Snapshot of all registry entries, missing ones included.
    fn devices(&self) -> Vec<Device>;

    /// Required serials without a confirmed address.
    fn missing_count(&self) -> usize;

    /// Devices with both identity and address confirmed.
    fn fully_registered_count(&self) -> usize;
}

#[derive(Default)]
struct Registry {
    devices: Vec<Device>,
}

impl Registry {
    fn pre_register(&mut self, address: IpAddr) {
        if self.devices.iter().any(|d| d.address == Some(address)) {
            return;
        }
        self.devices.push(Device::address_only(address));
    }

    fn require(&mut self, serial: u32) {
        if self.devices.iter().any(|d| d.serial() == Some(serial)) {
            return;
        }
        self.devices.push(Device::missing(serial));
    }

    /// Fold one pong into the registry. Entries are promoted, never
    /// removed; a pre-registered address answering for a required serial
    /// collapses into a single fully registered entry.
    fn correlate(&mut self, address: IpAddr, pong: DiscoveryPong) {
        if let Some(entry) = self
            .devices
            .iter_mut()
            .find(|d| d.serial() == Some(pong.identity.serial))
        {
            entry.address = Some(address);
            entry.identity = Some(pong.identity);
            entry.class = Some(pong.class);
            entry.state = RegistrationState::FullyRegistered;
            self.devices
                .retain(|d| !(d.has_address_only() && d.address == Some(address)));
            return;
        }
        if let Some(entry) = self
            .devices
            .iter_mut()
            .find(|d| d.address == Some(address))
        {
            if entry.state != RegistrationState::FullyRegistered {
                entry.identity = Some(pong.identity);
                entry.class = Some(pong.class);
                entry.state = RegistrationState::FullyRegistered;
            }
            return;
        }
        self.devices.push(Device::fully_registered(
            address,
            pong.identity,
            pong.class,
        ));
    }

    fn missing_count(&self) -> usize {
        self.devices
            .iter()
            .filter(|d| d.state == RegistrationState::Missing)
            .count()
    }

    fn fully_registered_count(&self) -> usize {
        self.devices
            .iter()
            .filter(|d| d.state == RegistrationState::FullyRegistered)
            .count()
    }
}

/// Concrete discovery collaborator speaking the Gridwire discovery
/// ping/pong exchange over its own ephemeral socket.
pub struct GridwireDiscovery {
    socket: Arc<UdpSocket>,
    registry: Mutex<Registry>,
}

impl GridwireDiscovery {
    /// Bind the discovery socket with broadcast enabled.
    pub async fn bind() -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.set_broadcast(true)?;
        Ok(Self {
            socket: Arc::new(socket),
            registry: Mutex::new(Registry::default()),
        })
    }

    async fn send_pings(&self, full_scan: bool) -> Result<usize> {
        let ping = encode_discovery_ping();
        let mut sent = 0usize;
        if full_scan {
            let broadcast = SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), GRIDWIRE_PORT);
            self.socket.send_to(&ping, broadcast).await?;
            sent += 1;
        }
        // Narrow rounds (and full rounds, for good measure) ping every
        // address we already know about directly.
        let addresses: Vec<IpAddr> = {
            let registry = self.registry.lock();
            registry.devices.iter().filter_map(|d| d.address).collect()
        };
        for address in addresses {
            let target = SocketAddr::new(address, GRIDWIRE_PORT);
            if let Err(err) = self.socket.send_to(&ping, target).await {
                warn!(%address, error = %err, "discovery ping failed");
                continue;
            }
            sent += 1;
        }
        Ok(sent)
    }

    async fn collect_responses(&self) {
        let deadline = Instant::now() + RESPONSE_WINDOW;
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let received =
                match tokio::time::timeout(remaining, self.socket.recv_from(&mut buf)).await {
                    Err(_) => break,
                    Ok(Err(err)) => {
                        warn!(error = %err, "discovery socket read error");
                        break;
                    }
                    Ok(Ok(received)) => received,
                };
            let (len, source) = received;
            match decode_frame(&buf[..len]) {
                Ok(InboundPayload::Discovery(pong)) => {
                    info!(
                        address = %source.ip(),
                        susy_id = pong.identity.susy_id,
                        serial = pong.identity.serial,
                        class = %pong.class,
                        "device answered discovery"
                    );
                    self.registry.lock().correlate(source.ip(), pong);
                }
                Ok(_) => debug!(%source, "ignoring non-discovery frame on discovery socket"),
                Err(err) => debug!(%source, error = %err, "dropping undecodable discovery reply"),
            }
        }
    }
}

#[async_trait]
impl DeviceDiscovery for GridwireDiscovery {
    fn pre_register_device(&self, address: IpAddr) {
        self.registry.lock().pre_register(address);
    }

    fn require_device(&self, serial: u32) {
        self.registry.lock().require(serial);
    }

    async fn discover_devices(&self, full_scan: bool) -> Result<usize> {
        let sent = self.send_pings(full_scan).await?;
        debug!(full_scan, pings = sent, "discovery pings sent");
        self.collect_responses().await;
        Ok(self.fully_registered_count())
    }

    fn devices(&self) -> Vec<Device> {
        self.registry.lock().devices.clone()
    }

    fn missing_count(&self) -> usize {
        self.registry.lock().missing_count()
    }

    fn fully_registered_count(&self) -> usize {
        self.registry.lock().fully_registered_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceClass, DeviceIdentity};

    fn pong(susy_id: u16, serial: u32, class: DeviceClass) -> DiscoveryPong {
        DiscoveryPong {
            identity: DeviceIdentity::new(susy_id, serial),
            class,
        }
    }

    #[test]
    fn required_serial_is_missing_until_correlated() {
        let mut registry = Registry::default();
        registry.require(1901431377);
        assert_eq!(registry.missing_count(), 1);
        assert_eq!(registry.fully_registered_count(), 0);

        registry.correlate(
            IpAddr::V4(Ipv4Addr::new(192, 168, 178, 20)),
            pong(349, 1901431377, DeviceClass::Meter),
        );
        assert_eq!(registry.missing_count(), 0);
        assert_eq!(registry.fully_registered_count(), 1);
        assert_eq!(registry.devices[0].class, Some(DeviceClass::Meter));
    }

    #[test]
    fn address_only_entry_is_promoted_in_place() {
        let addr = IpAddr::V4(Ipv4Addr::new(192, 168, 182, 18));
        let mut registry = Registry::default();
        registry.pre_register(addr);
        assert!(registry.devices[0].has_address_only());

        registry.correlate(addr, pong(378, 3010538116, DeviceClass::PvInverter));
        assert_eq!(registry.devices.len(), 1);
        assert_eq!(
            registry.devices[0].state,
            RegistrationState::FullyRegistered
        );
        assert_eq!(registry.devices[0].serial(), Some(3010538116));
    }

    #[test]
    fn required_serial_answering_from_preregistered_address_collapses() {
        let addr = IpAddr::V4(Ipv4Addr::new(192, 168, 178, 22));
        let mut registry = Registry::default();
        registry.pre_register(addr);
        registry.require(1901026885);
        assert_eq!(registry.devices.len(), 2);

        registry.correlate(addr, pong(372, 1901026885, DeviceClass::BatteryInverter));
        assert_eq!(registry.devices.len(), 1);
        assert_eq!(registry.missing_count(), 0);
        assert_eq!(registry.fully_registered_count(), 1);
    }

    #[test]
    fn unsolicited_answer_is_registered() {
        let mut registry = Registry::default();
        registry.correlate(
            IpAddr::V4(Ipv4Addr::new(192, 168, 178, 99)),
            pong(371, 3012345678, DeviceClass::Inverter),
        );
        assert_eq!(registry.fully_registered_count(), 1);
    }

    #[test]
    fn duplicate_registrations_are_ignored() {
        let addr = IpAddr::V4(Ipv4Addr::new(192, 168, 182, 18));
        let mut registry = Registry::default();
        registry.pre_register(addr);
        registry.pre_register(addr);
        registry.require(42);
        registry.require(42);
        assert_eq!(registry.devices.len(), 2);
    }
}
