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
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use gridpoll_wire::{InboundPacket, PacketCategory, PacketSource};

/// Handler for one packet category.
pub trait PacketReceiver: Send + Sync {
    /// The category this receiver handles.
    fn category(&self) -> PacketCategory;

    /// Process one decoded packet of that category.
    fn receive(&self, packet: &InboundPacket);
}

/// Routes inbound packets to the receiver registered for their category.
///
/// One `dispatch` call is one bounded pass over the socket set: a single
/// readiness wait, then every currently available datagram is drained and
/// routed. Transient source errors count as an empty pass; the polling
/// loop keeps going.
pub struct PacketDispatcher {
    source: Arc<dyn PacketSource>,
    receivers: Mutex<IndexMap<PacketCategory, Arc<dyn PacketReceiver>>>,
}

impl PacketDispatcher {
    pub fn new(source: Arc<dyn PacketSource>) -> Self {
        Self {
            source,
            receivers: Mutex::new(IndexMap::new()),
        }
    }

    /// Register a receiver; a later registration for the same category
    /// replaces the earlier one.
    pub fn register_receiver(&self, receiver: Arc<dyn PacketReceiver>) {
        self.receivers.lock().insert(receiver.category(), receiver);
    }

    /// One bounded dispatch pass; returns the number of packets routed.
    pub async fn dispatch(&self, timeout: Duration) -> usize {
        let packets = match self.source.poll_once(timeout).await {
            Ok(packets) => packets,
            Err(err) => {
                warn!(error = %err, "packet source failed, treating as empty pass");
                return 0;
            }
        };
        let mut routed = 0usize;
        for packet in &packets {
            let Some(category) = packet.category() else {
                debug!(source = %packet.source, "dropping uncategorised packet");
                continue;
            };
            let receiver = self.receivers.lock().get(&category).cloned();
            match receiver {
                Some(receiver) => {
                    receiver.receive(packet);
                    routed += 1;
                }
                None => debug!(%category, "no receiver registered for category"),
            }
        }
        routed
    }
}
