//! ---
//! gridpoll_section: "02-wire-protocol-data-model"
//! gridpoll_subsection: "module"
//! gridpoll_type: "source"
//! gridpoll_scope: "code"
//! gridpoll_description: "Gridwire protocol codec and device collaborators."
//! gridpoll_version: "v0.1.0"
//! gridpoll_owner: "tbd"
//! ---
use std::net::SocketAddr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::device::{DeviceClass, DeviceIdentity};
use crate::{Result, WireError};

/// Magic prefix of every Gridwire frame ("GWP1").
pub const GRIDWIRE_MAGIC: u32 = 0x4757_5031;

/// Protocol tag carried by meter-stream datagrams.
pub const PROTOCOL_METER: u16 = 0x0010;
/// Protocol tag carried by command requests and responses.
pub const PROTOCOL_COMMAND: u16 = 0x0020;
/// Protocol tag carried by discovery pings and pongs.
pub const PROTOCOL_DISCOVERY: u16 = 0x0030;

const OPCODE_LOGIN: u8 = 0x01;
const OPCODE_LOGOFF: u8 = 0x02;
const OPCODE_QUERY: u8 = 0x03;
const OPCODE_RESPONSE: u8 = 0x81;
const OPCODE_PING: u8 = 0x01;
const OPCODE_PONG: u8 = 0x02;

/// Measurement values travel as signed milli-units.
const VALUE_SCALE: f64 = 1000.0;

/// Capability tag a packet is routed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum PacketCategory {
    /// Continuous measurement push from the energy meter.
    MeterStream,
    /// Response to a login, logoff or query request.
    CommandResponse,
}

/// One OBIS record inside a meter datagram.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObisRecord {
    /// OBIS identifier of the quantity.
    pub id: u32,
    /// Decoded value in engineering units.
    pub value: f64,
}

/// One register record inside a command response.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegisterRecord {
    /// Vendor register identifier.
    pub id: u32,
    /// Decoded value in engineering units.
    pub value: f64,
}

/// Decoded meter-stream datagram.
#[derive(Debug, Clone, PartialEq)]
pub struct MeterReading {
    /// Identity the meter stamps on every datagram.
    pub identity: DeviceIdentity,
    /// Records in transmission order.
    pub records: Vec<ObisRecord>,
}

/// Decoded command response.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResponse {
    /// Correlation token echoed from the request.
    pub token: u32,
    /// Identity of the answering device.
    pub identity: DeviceIdentity,
    /// Records in transmission order; empty for login/logoff acks.
    pub records: Vec<RegisterRecord>,
}

/// Decoded discovery answer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiscoveryPong {
    /// Identity the device confirms.
    pub identity: DeviceIdentity,
    /// Class tag the device reports.
    pub class: DeviceClass,
}

/// Payload variants the socket pool can produce.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundPayload {
    /// Meter-stream datagram.
    Meter(MeterReading),
    /// Command response.
    Command(CommandResponse),
    /// Discovery pong; only seen on the discovery socket.
    Discovery(DiscoveryPong),
}

/// A decoded datagram with its source address.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundPacket {
    /// Peer the datagram arrived from.
    pub source: SocketAddr,
    /// Decoded payload.
    pub payload: InboundPayload,
}

impl InboundPacket {
    /// Routing category; `None` for discovery traffic, which never passes
    /// through the dispatcher.
    pub fn category(&self) -> Option<PacketCategory> {
        match self.payload {
            InboundPayload::Meter(_) => Some(PacketCategory::MeterStream),
            InboundPayload::Command(_) => Some(PacketCategory::CommandResponse),
            InboundPayload::Discovery(_) => None,
        }
    }
}

fn need(buf: &impl Buf, bytes: usize, total: usize) -> Result<()> {
    if buf.remaining() < bytes {
        return Err(WireError::Truncated(total));
    }
    Ok(())
}

/// Decode one datagram into its payload.
pub fn decode_frame(datagram: &[u8]) -> Result<InboundPayload> {
    let total = datagram.len();
    let mut buf = datagram;
    need(&buf, 6, total)?;
    let magic = buf.get_u32();
    if magic != GRIDWIRE_MAGIC {
        return Err(WireError::BadMagic(magic));
    }
    match buf.get_u16() {
        PROTOCOL_METER => decode_meter(&mut buf, total).map(InboundPayload::Meter),
        PROTOCOL_COMMAND => decode_command(&mut buf, total).map(InboundPayload::Command),
        PROTOCOL_DISCOVERY => decode_discovery(&mut buf, total).map(InboundPayload::Discovery),
        other => Err(WireError::UnknownProtocol(other)),
    }
}

fn decode_identity(buf: &mut impl Buf, total: usize) -> Result<DeviceIdentity> {
    need(buf, 6, total)?;
    let susy_id = buf.get_u16();
    let serial = buf.get_u32();
    Ok(DeviceIdentity::new(susy_id, serial))
}

fn decode_meter(buf: &mut impl Buf, total: usize) -> Result<MeterReading> {
    let identity = decode_identity(buf, total)?;
    need(buf, 2, total)?;
    let count = buf.get_u16() as usize;
    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        need(buf, 12, total)?;
        let id = buf.get_u32();
        let value = buf.get_i64() as f64 / VALUE_SCALE;
        records.push(ObisRecord { id, value });
    }
    Ok(MeterReading { identity, records })
}

fn decode_command(buf: &mut impl Buf, total: usize) -> Result<CommandResponse> {
    need(buf, 1, total)?;
    let opcode = buf.get_u8();
    // Only responses travel towards us; a stray request is not worth
    // modelling.
    if opcode != OPCODE_RESPONSE {
        return Err(WireError::UnknownOpcode(opcode));
    }
    need(buf, 4, total)?;
    let token = buf.get_u32();
    let identity = decode_identity(buf, total)?;
    need(buf, 2, total)?;
    let count = buf.get_u16() as usize;
    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        need(buf, 12, total)?;
        let id = buf.get_u32();
        let value = buf.get_i64() as f64 / VALUE_SCALE;
        records.push(RegisterRecord { id, value });
    }
    Ok(CommandResponse {
        token,
        identity,
        records,
    })
}

fn decode_discovery(buf: &mut impl Buf, total: usize) -> Result<DiscoveryPong> {
    need(buf, 1, total)?;
    let opcode = buf.get_u8();
    // Our own pings may loop back through the multicast group.
    if opcode != OPCODE_PONG {
        return Err(WireError::UnknownOpcode(opcode));
    }
    let identity = decode_identity(buf, total)?;
    need(buf, 1, total)?;
    let class = DeviceClass::from_wire(buf.get_u8())?;
    Ok(DiscoveryPong { identity, class })
}

fn frame_header(protocol: u16) -> BytesMut {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u32(GRIDWIRE_MAGIC);
    buf.put_u16(protocol);
    buf
}

fn put_identity(buf: &mut BytesMut, identity: DeviceIdentity) {
    buf.put_u16(identity.susy_id);
    buf.put_u32(identity.serial);
}

/// Encode a discovery ping.
pub fn encode_discovery_ping() -> Bytes {
    let mut buf = frame_header(PROTOCOL_DISCOVERY);
    buf.put_u8(OPCODE_PING);
    buf.freeze()
}

/// Encode a discovery pong; used by tests standing in for a device.
pub fn encode_discovery_pong(identity: DeviceIdentity, class: DeviceClass) -> Bytes {
    let mut buf = frame_header(PROTOCOL_DISCOVERY);
    buf.put_u8(OPCODE_PONG);
    put_identity(&mut buf, identity);
    buf.put_u8(class.wire_code());
    buf.freeze()
}

/// Encode a login request.
pub fn encode_login(
    token: u32,
    identity: DeviceIdentity,
    installer_level: bool,
    credential: &str,
) -> Bytes {
    let mut buf = frame_header(PROTOCOL_COMMAND);
    buf.put_u8(OPCODE_LOGIN);
    buf.put_u32(token);
    put_identity(&mut buf, identity);
    buf.put_u8(u8::from(installer_level));
    buf.put_u8(credential.len() as u8);
    buf.put_slice(credential.as_bytes());
    buf.freeze()
}

/// Encode a logoff request. Logoff is fire-and-forget, so the token is
/// conventionally zero.
pub fn encode_logoff(token: u32, identity: DeviceIdentity) -> Bytes {
    let mut buf = frame_header(PROTOCOL_COMMAND);
    buf.put_u8(OPCODE_LOGOFF);
    buf.put_u32(token);
    put_identity(&mut buf, identity);
    buf.freeze()
}

/// Encode a register query over a vendor-defined register window.
pub fn encode_query(
    token: u32,
    identity: DeviceIdentity,
    command_code: u8,
    range_start: u32,
    range_end: u32,
) -> Bytes {
    let mut buf = frame_header(PROTOCOL_COMMAND);
    buf.put_u8(OPCODE_QUERY);
    buf.put_u32(token);
    put_identity(&mut buf, identity);
    buf.put_u8(command_code);
    buf.put_u32(range_start);
    buf.put_u32(range_end);
    buf.freeze()
}

/// Encode a meter-stream datagram; used by tests standing in for the meter.
pub fn encode_meter_reading(identity: DeviceIdentity, records: &[(u32, f64)]) -> Bytes {
    let mut buf = frame_header(PROTOCOL_METER);
    put_identity(&mut buf, identity);
    buf.put_u16(records.len() as u16);
    for (id, value) in records {
        buf.put_u32(*id);
        buf.put_i64((value * VALUE_SCALE).round() as i64);
    }
    buf.freeze()
}

/// Encode a command response; used by tests standing in for an inverter.
pub fn encode_command_response(
    token: u32,
    identity: DeviceIdentity,
    records: &[(u32, f64)],
) -> Bytes {
    let mut buf = frame_header(PROTOCOL_COMMAND);
    buf.put_u8(OPCODE_RESPONSE);
    buf.put_u32(token);
    put_identity(&mut buf, identity);
    buf.put_u16(records.len() as u16);
    for (id, value) in records {
        buf.put_u32(*id);
        buf.put_i64((value * VALUE_SCALE).round() as i64);
    }
    buf.freeze()
}
