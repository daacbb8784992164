//! ---
//! gridpoll_section: "01-core-functionality"
//! gridpoll_subsection: "module"
//! gridpoll_type: "source"
//! gridpoll_scope: "code"
//! gridpoll_description: "Compiled-in site configuration for the gridpoll daemon."
//! gridpoll_version: "v0.1.0"
//! gridpoll_owner: "tbd"
//! ---

//! Site parameters for the deployment this daemon runs at. There is no
//! CLI and no config file; changing the fleet means changing this module
//! and rebuilding.

use std::net::Ipv4Addr;

use gridpoll_agg::ObisQuantity;

/// Devices whose addresses are known up front but whose identities are
/// confirmed by discovery: the PV inverter and the battery inverter.
pub const PRE_REGISTERED_ADDRESSES: [Ipv4Addr; 2] = [
    Ipv4Addr::new(192, 168, 182, 18),
    Ipv4Addr::new(192, 168, 178, 22),
];

/// Serials the install is incomplete without: energy meter, PV inverter,
/// battery inverter.
pub const REQUIRED_SERIALS: [u32; 3] = [1901431377, 3010538116, 1901026885];

/// Multicast group the energy meter pushes its measurement stream to.
pub const METER_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 12, 96, 1);

/// Interface addresses to join the multicast group on; empty joins on the
/// unspecified interface.
pub const LOCAL_INTERFACE_ADDRS: [Ipv4Addr; 0] = [];

/// Meter quantities admitted into the aggregation pipeline. The signed
/// quantities are derived, listed here so downstream admission checks
/// treat them as first-class.
pub const METER_OBIS_SELECTION: [ObisQuantity; 10] = [
    ObisQuantity::PositiveActivePowerTotal,
    ObisQuantity::NegativeActivePowerTotal,
    ObisQuantity::PowerFactorTotal,
    ObisQuantity::PowerFactorL1,
    ObisQuantity::PowerFactorL2,
    ObisQuantity::PowerFactorL3,
    ObisQuantity::SignedActivePowerTotal,
    ObisQuantity::SignedActivePowerL1,
    ObisQuantity::SignedActivePowerL2,
    ObisQuantity::SignedActivePowerL3,
];

/// Averaging window for the meter push stream.
pub const AVERAGING_TIME_OBIS_MS: u64 = 60_000;

/// Averaging window for inverter registers; zero means flush on the
/// end-of-cycle signal only.
pub const AVERAGING_TIME_REGISTER_MS: u64 = 0;

/// Port the Prometheus scrape endpoint listens on.
pub const METRICS_PORT: u16 = 9464;
