//! ---
//! gridpoll_section: "02-wire-protocol-data-model"
//! gridpoll_subsection: "module"
//! gridpoll_type: "source"
//! gridpoll_scope: "code"
//! gridpoll_description: "Gridwire protocol codec and device collaborators."
//! gridpoll_version: "v0.1.0"
//! gridpoll_owner: "tbd"
//! ---
#![warn(missing_docs)]

//! Gridwire is the LAN telemetry protocol spoken by the devices gridpoll
//! talks to: the energy meter pushes measurement datagrams to a multicast
//! group, inverters answer unicast command requests. This crate holds the
//! byte codec, the UDP socket pool and the concrete discovery, command and
//! wake-probe collaborators consumed by `gridpoll-core`.

pub mod codec;
pub mod command;
pub mod device;
pub mod discovery;
pub mod sockets;
pub mod wake;

/// Shared result type for wire-level operations.
pub type Result<T> = std::result::Result<T, WireError>;

/// Errors surfaced by the codec and the socket collaborators.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Datagram was shorter than the frame it claims to carry.
    #[error("truncated frame ({0} bytes)")]
    Truncated(usize),
    /// Frame did not start with the Gridwire magic.
    #[error("bad magic 0x{0:08x}")]
    BadMagic(u32),
    /// Protocol tag is not one we speak.
    #[error("unknown protocol tag 0x{0:04x}")]
    UnknownProtocol(u16),
    /// Command opcode is not one we speak.
    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),
    /// Device class code outside the published range.
    #[error("unknown device class code {0}")]
    UnknownDeviceClass(u8),
    /// Attempted to address a device without a confirmed network endpoint.
    #[error("device has no network endpoint")]
    NoEndpoint,
    /// Wrapper for IO errors encountered on the socket pool.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for wake-probe HTTP failures.
    #[error("wake probe failed: {0}")]
    Probe(#[from] reqwest::Error),
}

pub use codec::{
    CommandResponse, DiscoveryPong, InboundPacket, InboundPayload, MeterReading, ObisRecord,
    PacketCategory, RegisterRecord,
};
pub use command::{
    query_plan, CommandChannel, CommandClass, GridwireCommandChannel, QueryWindow, TokenMinter,
};
pub use device::{Device, DeviceClass, DeviceIdentity, RegistrationState, GRIDWIRE_PORT};
pub use discovery::{DeviceDiscovery, GridwireDiscovery};
pub use sockets::{PacketSource, SocketPool};
pub use wake::{HttpWakeProbe, WakeProbe};
