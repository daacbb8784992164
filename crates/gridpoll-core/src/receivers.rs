//! ---
//! gridpoll_section: "01-core-functionality"
//! gridpoll_subsection: "module"
//! gridpoll_type: "source"
//! gridpoll_scope: "code"
//! gridpoll_description: "Adaptive polling core wiring discovery, sessions, dispatch and aggregation."
//! gridpoll_version: "v0.1.0"
//! gridpoll_owner: "tbd"
//! ---
use std::sync::Arc;

use tracing::{debug, trace};

use gridpoll_agg::{
    AveragingProcessor, ObisFilter, ObisQuantity, ObisUpdate, RegisterConsumer, RegisterQuantity,
    RegisterUpdate,
};
use gridpoll_common::unix_epoch_ms;
use gridpoll_wire::{InboundPacket, InboundPayload, PacketCategory};

use crate::dispatch::PacketReceiver;
use crate::tokens::TokenRepository;

/// Feeds meter-stream datagrams into the OBIS admission filter. Every
/// datagram ends with an end-of-data signal so the averaging stage can
/// evaluate its wall-clock window.
pub struct MeterPacketReceiver {
    filter: Arc<ObisFilter>,
}

impl MeterPacketReceiver {
    pub fn new(filter: Arc<ObisFilter>) -> Self {
        Self { filter }
    }
}

impl PacketReceiver for MeterPacketReceiver {
    fn category(&self) -> PacketCategory {
        PacketCategory::MeterStream
    }

    fn receive(&self, packet: &InboundPacket) {
        let InboundPayload::Meter(reading) = &packet.payload else {
            return;
        };
        let time = unix_epoch_ms();
        for record in &reading.records {
            let Some(quantity) = ObisQuantity::from_wire(record.id) else {
                trace!(id = format_args!("0x{:08X}", record.id), "unmapped obis id");
                continue;
            };
            self.filter.consume(ObisUpdate {
                quantity,
                value: record.value,
                time,
            });
        }
        self.filter.end_of_obis_data(time);
    }
}

/// Resolves command responses against the token repository and feeds their
/// register records into the averaging stage. Responses carrying an
/// unknown token, including late answers to an already cleared cycle, are
/// dropped without touching the measurement maps.
pub struct CommandPacketReceiver {
    tokens: Arc<TokenRepository>,
    averager: Arc<AveragingProcessor>,
}

impl CommandPacketReceiver {
    pub fn new(tokens: Arc<TokenRepository>, averager: Arc<AveragingProcessor>) -> Self {
        Self { tokens, averager }
    }
}

impl PacketReceiver for CommandPacketReceiver {
    fn category(&self) -> PacketCategory {
        PacketCategory::CommandResponse
    }

    fn receive(&self, packet: &InboundPacket) {
        let InboundPayload::Command(response) = &packet.payload else {
            return;
        };
        if !self.tokens.resolve(response.token) {
            debug!(
                token = response.token,
                serial = response.identity.serial,
                "dropping response with unknown or late token"
            );
            return;
        }
        let time = unix_epoch_ms();
        for record in &response.records {
            let Some(quantity) = RegisterQuantity::from_register(record.id) else {
                trace!(
                    id = format_args!("0x{:08X}", record.id),
                    "unmapped register id"
                );
                continue;
            };
            self.averager.consume_register(RegisterUpdate {
                quantity,
                value: record.value,
                time,
            });
        }
    }
}
