//! ---
//! gridpoll_section: "02-wire-protocol-data-model"
//! gridpoll_subsection: "module"
//! gridpoll_type: "source"
//! gridpoll_scope: "code"
//! gridpoll_description: "Gridwire protocol codec and device collaborators."
//! gridpoll_version: "v0.1.0"
//! gridpoll_owner: "tbd"
//! ---
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::{Result, WireError};

/// Default UDP port Gridwire devices listen and answer on.
pub const GRIDWIRE_PORT: u16 = 9560;

/// Class tag a device reports during discovery.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
pub enum DeviceClass {
    /// Energy meter at the grid connection point; pushes a multicast stream.
    Meter,
    /// Generic inverter.
    Inverter,
    /// Photovoltaic inverter.
    #[strum(serialize = "PV-Inverter")]
    PvInverter,
    /// Battery inverter.
    #[strum(serialize = "Battery-Inverter")]
    BatteryInverter,
}

impl DeviceClass {
    /// True for the classes that hold login sessions and answer queries.
    pub fn is_inverter(self) -> bool {
        matches!(
            self,
            DeviceClass::Inverter | DeviceClass::PvInverter | DeviceClass::BatteryInverter
        )
    }

    /// Wire code used in discovery pongs and command responses.
    pub fn wire_code(self) -> u8 {
        match self {
            DeviceClass::Meter => 1,
            DeviceClass::Inverter => 2,
            DeviceClass::PvInverter => 3,
            DeviceClass::BatteryInverter => 4,
        }
    }

    /// Reverse of [`wire_code`](Self::wire_code).
    pub fn from_wire(code: u8) -> Result<Self> {
        match code {
            1 => Ok(DeviceClass::Meter),
            2 => Ok(DeviceClass::Inverter),
            3 => Ok(DeviceClass::PvInverter),
            4 => Ok(DeviceClass::BatteryInverter),
            other => Err(WireError::UnknownDeviceClass(other)),
        }
    }
}

/// Identity a device confirms during discovery: the sub-system ("susy") id
/// and the numeric serial printed on the type plate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Sub-system id; distinguishes components behind one serial.
    pub susy_id: u16,
    /// Device serial number.
    pub serial: u32,
}

impl DeviceIdentity {
    /// Construct an identity from its two parts.
    pub fn new(susy_id: u16, serial: u32) -> Self {
        Self { susy_id, serial }
    }
}

/// Discovery status of a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationState {
    /// Address known (pre-registered) but identity unconfirmed.
    AddressOnly,
    /// Identity required but no address learned yet.
    Missing,
    /// Identity and address both confirmed; never demoted afterwards.
    FullyRegistered,
}

/// A Gridwire device as the registry knows it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Network address, if known.
    pub address: Option<IpAddr>,
    /// Confirmed identity, if any.
    pub identity: Option<DeviceIdentity>,
    /// Class tag reported by the device, if any.
    pub class: Option<DeviceClass>,
    /// Discovery status.
    pub state: RegistrationState,
}

impl Device {
    /// Entry for a pre-registered address whose identity is still unknown.
    pub fn address_only(address: IpAddr) -> Self {
        Self {
            address: Some(address),
            identity: None,
            class: None,
            state: RegistrationState::AddressOnly,
        }
    }

    /// Placeholder for a required serial with no learned address.
    pub fn missing(serial: u32) -> Self {
        Self {
            address: None,
            identity: Some(DeviceIdentity::new(0, serial)),
            class: None,
            state: RegistrationState::Missing,
        }
    }

    /// Entry for a device whose identity and address are both confirmed.
    pub fn fully_registered(address: IpAddr, identity: DeviceIdentity, class: DeviceClass) -> Self {
        Self {
            address: Some(address),
            identity: Some(identity),
            class: Some(class),
            state: RegistrationState::FullyRegistered,
        }
    }

    /// True when the entry only carries a pre-registered address.
    pub fn has_address_only(&self) -> bool {
        self.state == RegistrationState::AddressOnly
    }

    /// True for fully registered devices of an inverter class.
    pub fn is_inverter(&self) -> bool {
        self.state == RegistrationState::FullyRegistered
            && self.class.map(DeviceClass::is_inverter).unwrap_or(false)
    }

    /// Serial number, if the identity is known.
    pub fn serial(&self) -> Option<u32> {
        self.identity.map(|identity| identity.serial)
    }

    /// UDP endpoint commands are sent to.
    pub fn endpoint(&self) -> Result<SocketAddr> {
        let address = self.address.ok_or(WireError::NoEndpoint)?;
        Ok(SocketAddr::new(address, GRIDWIRE_PORT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_display_matches_fleet_labels() {
        assert_eq!(DeviceClass::PvInverter.to_string(), "PV-Inverter");
        assert_eq!(DeviceClass::BatteryInverter.to_string(), "Battery-Inverter");
        assert_eq!(DeviceClass::Meter.to_string(), "Meter");
    }

    #[test]
    fn only_inverter_classes_hold_sessions() {
        assert!(DeviceClass::Inverter.is_inverter());
        assert!(DeviceClass::PvInverter.is_inverter());
        assert!(DeviceClass::BatteryInverter.is_inverter());
        assert!(!DeviceClass::Meter.is_inverter());
    }

    #[test]
    fn missing_device_has_no_endpoint() {
        let device = Device::missing(1901431377);
        assert!(device.endpoint().is_err());
        assert_eq!(device.serial(), Some(1901431377));
    }
}
