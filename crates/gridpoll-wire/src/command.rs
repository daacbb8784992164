//! ---
//! gridpoll_section: "02-wire-protocol-data-model"
//! gridpoll_subsection: "module"
//! gridpoll_type: "source"
//! gridpoll_scope: "code"
//! gridpoll_description: "Gridwire protocol codec and device collaborators."
//! gridpoll_version: "v0.1.0"
//! gridpoll_owner: "tbd"
//! ---
use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use crate::codec::{encode_login, encode_logoff, encode_query};
use crate::device::{Device, DeviceClass};
use crate::sockets::SocketPool;
use crate::{Result, WireError};

/// Command families a query request can address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum CommandClass {
    /// DC-side measurements.
    DcQuery,
    /// AC-side measurements.
    AcQuery,
    /// Device and relay status.
    StatusQuery,
    /// Device type and firmware information.
    DeviceQuery,
    /// Energy production counters.
    EnergyQuery,
    /// Temperature measurements.
    TemperatureQuery,
}

impl CommandClass {
    /// Wire code of the command family.
    pub fn wire_code(self) -> u8 {
        match self {
            CommandClass::DcQuery => 0x01,
            CommandClass::AcQuery => 0x02,
            CommandClass::StatusQuery => 0x03,
            CommandClass::DeviceQuery => 0x04,
            CommandClass::EnergyQuery => 0x05,
            CommandClass::TemperatureQuery => 0x06,
        }
    }
}

/// One entry of a device-class query plan: a command family plus a
/// vendor-defined register window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryWindow {
    /// Command family.
    pub class: CommandClass,
    /// First register of the window.
    pub range_start: u32,
    /// Last register of the window.
    pub range_end: u32,
}

/// Query plan for PV and generic inverters. The windows are reproduced
/// bit-for-bit from the reference deployment; do not reorder or renumber.
pub const INVERTER_QUERY_PLAN: [QueryWindow; 5] = [
    QueryWindow {
        class: CommandClass::DcQuery,
        range_start: 0x0025_1E00,
        range_end: 0x0025_1EFF,
    },
    QueryWindow {
        class: CommandClass::DcQuery,
        range_start: 0x0045_1F00,
        range_end: 0x0045_21FF,
    },
    QueryWindow {
        class: CommandClass::AcQuery,
        range_start: 0x0046_4000,
        range_end: 0x0046_42FF,
    },
    QueryWindow {
        class: CommandClass::StatusQuery,
        range_start: 0x0021_4800,
        range_end: 0x0021_48FF,
    },
    QueryWindow {
        class: CommandClass::StatusQuery,
        range_start: 0x0041_6400,
        range_end: 0x0041_64FF,
    },
];

/// Query plan for battery inverters, likewise bit-for-bit.
pub const BATTERY_QUERY_PLAN: [QueryWindow; 3] = [
    QueryWindow {
        class: CommandClass::StatusQuery,
        range_start: 0x0021_4800,
        range_end: 0x0041_64FF,
    },
    QueryWindow {
        class: CommandClass::StatusQuery,
        range_start: 0x0041_6400,
        range_end: 0x0041_64FF,
    },
    QueryWindow {
        class: CommandClass::AcQuery,
        range_start: 0x0026_3F00,
        range_end: 0x0049_5DFF,
    },
];

/// The fixed query plan for a device class; empty for the meter, which
/// pushes unsolicited.
pub fn query_plan(class: DeviceClass) -> &'static [QueryWindow] {
    match class {
        DeviceClass::Inverter | DeviceClass::PvInverter => &INVERTER_QUERY_PLAN,
        DeviceClass::BatteryInverter => &BATTERY_QUERY_PLAN,
        DeviceClass::Meter => &[],
    }
}

/// Mints correlation tokens for outbound requests. Implemented by the
/// token repository in `gridpoll-core`.
pub trait TokenMinter: Send + Sync {
    /// Mint a fresh outstanding token.
    fn mint(&self) -> u32;
}

/// Session and query commands towards a single device.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    /// Clear any stale server-side session. Fire-and-forget and idempotent.
    async fn logoff(&self, device: &Device) -> Result<()>;

    /// Open a session with the shared credential. The acknowledgement
    /// arrives as a command response carrying the minted token.
    async fn login(&self, device: &Device, installer_level: bool, credential: &str) -> Result<()>;

    /// Send one register query; returns the minted token on success.
    async fn send_query_request(
        &self,
        device: &Device,
        class: CommandClass,
        range_start: u32,
        range_end: u32,
    ) -> Result<i32>;
}

/// Concrete command channel sending Gridwire frames over the socket pool.
pub struct GridwireCommandChannel {
    pool: Arc<SocketPool>,
    minter: Arc<dyn TokenMinter>,
}

impl GridwireCommandChannel {
    /// Build a channel that mints tokens from the supplied repository.
    pub fn new(pool: Arc<SocketPool>, minter: Arc<dyn TokenMinter>) -> Self {
        Self { pool, minter }
    }
}

#[async_trait]
impl CommandChannel for GridwireCommandChannel {
    async fn logoff(&self, device: &Device) -> Result<()> {
        let identity = device.identity.ok_or(WireError::NoEndpoint)?;
        let endpoint = device.endpoint()?;
        let frame = encode_logoff(0, identity);
        trace!(serial = identity.serial, payload = %hex::encode(&frame), "logoff frame");
        self.pool.send_to(&frame, endpoint).await?;
        Ok(())
    }

    async fn login(&self, device: &Device, installer_level: bool, credential: &str) -> Result<()> {
        let identity = device.identity.ok_or(WireError::NoEndpoint)?;
        let endpoint = device.endpoint()?;
        let token = self.minter.mint();
        let frame = encode_login(token, identity, installer_level, credential);
        trace!(serial = identity.serial, token, payload = %hex::encode(&frame), "login frame");
        self.pool.send_to(&frame, endpoint).await?;
        Ok(())
    }

    async fn send_query_request(
        &self,
        device: &Device,
        class: CommandClass,
        range_start: u32,
        range_end: u32,
    ) -> Result<i32> {
        let identity = device.identity.ok_or(WireError::NoEndpoint)?;
        let endpoint = device.endpoint()?;
        let token = self.minter.mint();
        let frame = encode_query(token, identity, class.wire_code(), range_start, range_end);
        trace!(
            serial = identity.serial,
            token,
            command = %class,
            range_start = format_args!("0x{range_start:08X}"),
            range_end = format_args!("0x{range_end:08X}"),
            "query frame"
        );
        self.pool.send_to(&frame, endpoint).await?;
        Ok(token as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inverter_plan_matches_reference_deployment() {
        let plan = query_plan(DeviceClass::PvInverter);
        assert_eq!(plan.len(), 5);
        assert_eq!(plan[0].class, CommandClass::DcQuery);
        assert_eq!(plan[0].range_start, 0x0025_1E00);
        assert_eq!(plan[0].range_end, 0x0025_1EFF);
        assert_eq!(plan[1].range_start, 0x0045_1F00);
        assert_eq!(plan[1].range_end, 0x0045_21FF);
        assert_eq!(plan[2].class, CommandClass::AcQuery);
        assert_eq!(plan[2].range_start, 0x0046_4000);
        assert_eq!(plan[4].range_start, 0x0041_6400);
        assert_eq!(query_plan(DeviceClass::Inverter), plan);
    }

    #[test]
    fn battery_plan_matches_reference_deployment() {
        let plan = query_plan(DeviceClass::BatteryInverter);
        assert_eq!(plan.len(), 3);
        assert_eq!(plan[0].class, CommandClass::StatusQuery);
        assert_eq!(plan[0].range_start, 0x0021_4800);
        assert_eq!(plan[0].range_end, 0x0041_64FF);
        assert_eq!(plan[2].class, CommandClass::AcQuery);
        assert_eq!(plan[2].range_start, 0x0026_3F00);
        assert_eq!(plan[2].range_end, 0x0049_5DFF);
    }

    #[test]
    fn meter_has_no_query_plan() {
        assert!(query_plan(DeviceClass::Meter).is_empty());
    }
}
