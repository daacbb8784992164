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

use anyhow::Result;
use tracing::{debug, info};

use gridpoll_wire::{CommandChannel, Device};

use crate::dispatch::PacketDispatcher;

/// Shared installer credential the whole fleet accepts.
pub const INSTALLER_CREDENTIAL: &str = "9999";

/// Opens query sessions on the inverter fleet.
///
/// A login failure is indistinguishable from a slow acknowledgement on
/// this protocol, so the round is optimistic: persistent failure just
/// means the next cycle's responses never arrive and a later round logs
/// in again.
pub struct SessionManager {
    channel: Arc<dyn CommandChannel>,
}

impl SessionManager {
    pub fn new(channel: Arc<dyn CommandChannel>) -> Self {
        Self { channel }
    }

    /// Log every inverter-class device in, one at a time. Each login is
    /// preceded by an idempotent logoff clearing any stale server-side
    /// session and followed by one dispatch pass draining the synchronous
    /// acknowledgement; logins are not pipelined.
    pub async fn login_round(
        &self,
        devices: &[Device],
        dispatcher: &PacketDispatcher,
        poll_timeout: Duration,
    ) -> Result<()> {
        for device in devices.iter().filter(|d| d.is_inverter()) {
            let serial = device.serial().unwrap_or(0);
            debug!(serial, "logging in");
            self.channel.logoff(device).await?;
            self.channel
                .login(device, true, INSTALLER_CREDENTIAL)
                .await?;
            dispatcher.dispatch(poll_timeout).await;
        }
        info!("login round complete");
        Ok(())
    }
}
