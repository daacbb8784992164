//! ---
//! gridpoll_section: "02-wire-protocol-data-model"
//! gridpoll_subsection: "module"
//! gridpoll_type: "source"
//! gridpoll_scope: "code"
//! gridpoll_description: "Gridwire protocol codec and device collaborators."
//! gridpoll_version: "v0.1.0"
//! gridpoll_owner: "tbd"
//! ---
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

use crate::codec::{decode_frame, InboundPacket};
use crate::Result;

const MAX_DATAGRAM: usize = 2048;

/// Bounded multiplex wait over the open socket set.
///
/// One call performs exactly one readiness wait across all sockets and then
/// drains every currently available datagram. A call returns promptly on
/// timeout with zero packets; callers must not assume forward progress.
#[async_trait]
pub trait PacketSource: Send + Sync {
    /// Wait up to `timeout` for traffic, then drain and decode it.
    async fn poll_once(&self, timeout: Duration) -> Result<Vec<InboundPacket>>;
}

/// The two UDP sockets gridpoll keeps open: one bound to the Gridwire port
/// and joined to the meter multicast group, one ephemeral socket for
/// command requests and their responses.
pub struct SocketPool {
    meter: Arc<UdpSocket>,
    command: Arc<UdpSocket>,
}

impl SocketPool {
    /// Bind the pool. `local_addrs` lists the interface addresses the
    /// multicast membership is joined on; an empty list joins on the
    /// unspecified interface.
    pub async fn bind(
        port: u16,
        multicast_group: Ipv4Addr,
        local_addrs: &[Ipv4Addr],
    ) -> Result<Self> {
        let meter = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
        if local_addrs.is_empty() {
            meter.join_multicast_v4(multicast_group, Ipv4Addr::UNSPECIFIED)?;
        } else {
            for local in local_addrs {
                meter.join_multicast_v4(multicast_group, *local)?;
            }
        }
        let command = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        debug!(
            port,
            group = %multicast_group,
            command_port = command.local_addr()?.port(),
            "socket pool bound"
        );
        Ok(Self {
            meter: Arc::new(meter),
            command: Arc::new(command),
        })
    }

    /// Send one outbound frame from the command socket.
    pub async fn send_to(&self, payload: &[u8], target: SocketAddr) -> Result<usize> {
        Ok(self.command.send_to(payload, target).await?)
    }

    fn drain(socket: &UdpSocket, packets: &mut Vec<InboundPacket>) {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            match socket.try_recv_from(&mut buf) {
                Ok((len, source)) => match decode_frame(&buf[..len]) {
                    Ok(payload) => packets.push(InboundPacket { source, payload }),
                    Err(err) => {
                        debug!(%source, error = %err, "dropping undecodable datagram");
                        trace!(payload = %hex::encode(&buf[..len]), "undecodable datagram bytes");
                    }
                },
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!(error = %err, "socket read error");
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl PacketSource for SocketPool {
    async fn poll_once(&self, timeout: Duration) -> Result<Vec<InboundPacket>> {
        let readiness = futures::future::select_all([
            Box::pin(self.meter.readable()),
            Box::pin(self.command.readable()),
        ]);
        let mut packets = Vec::new();
        match tokio::time::timeout(timeout, readiness).await {
            Err(_) => return Ok(packets),
            Ok((Err(err), _, _)) => {
                // Transient readiness errors count as an empty pass; the
                // scheduler loop keeps going.
                warn!(error = %err, "socket readiness error");
                return Ok(packets);
            }
            Ok((Ok(()), _, _)) => {}
        }
        Self::drain(&self.meter, &mut packets);
        Self::drain(&self.command, &mut packets);
        Ok(packets)
    }
}
