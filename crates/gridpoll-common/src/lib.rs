//! ---
//! gridpoll_section: "01-core-functionality"
//! gridpoll_subsection: "module"
//! gridpoll_type: "source"
//! gridpoll_scope: "code"
//! gridpoll_description: "Shared primitives and utilities for the poller runtime."
//! gridpoll_version: "v0.1.0"
//! gridpoll_owner: "tbd"
//! ---
pub mod logging;
pub mod time;

pub use logging::{init_tracing, LogFormat, LoggingConfig};
pub use time::unix_epoch_ms;
