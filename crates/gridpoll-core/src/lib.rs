//! ---
//! gridpoll_section: "01-core-functionality"
//! gridpoll_subsection: "module"
//! gridpoll_type: "source"
//! gridpoll_scope: "code"
//! gridpoll_description: "Adaptive polling core wiring discovery, sessions, dispatch and aggregation."
//! gridpoll_version: "v0.1.0"
//! gridpoll_owner: "tbd"
//! ---

//! The polling core: the adaptive scheduler that drives query cycles
//! against the inverter fleet, the token repository gating aggregation,
//! the session manager holding inverter logins, the discovery coordinator
//! with its wake-and-retry policy, and the packet dispatcher routing
//! inbound Gridwire traffic into the aggregation pipeline.

pub mod discovery;
pub mod dispatch;
pub mod receivers;
pub mod scheduler;
pub mod session;
pub mod tokens;

pub use discovery::run_discovery;
pub use dispatch::{PacketDispatcher, PacketReceiver};
pub use receivers::{CommandPacketReceiver, MeterPacketReceiver};
pub use scheduler::{
    cadence, derive_night_mode, CycleContext, CyclePhase, PollScheduler, DAY_POLL_TIMEOUT,
    DAY_QUERY_INTERVAL_MS, NIGHT_POLL_TIMEOUT, NIGHT_QUERY_INTERVAL_MS,
};
pub use session::{SessionManager, INSTALLER_CREDENTIAL};
pub use tokens::TokenRepository;
