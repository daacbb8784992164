//! ---
//! gridpoll_section: "01-core-functionality"
//! gridpoll_subsection: "module"
//! gridpoll_type: "source"
//! gridpoll_scope: "code"
//! gridpoll_description: "Shared primitives and utilities for the poller runtime."
//! gridpoll_version: "v0.1.0"
//! gridpoll_owner: "tbd"
//! ---

/// Wall-clock milliseconds since the unix epoch. Measurement timestamps use
/// this representation, with `0` meaning "never updated".
pub fn unix_epoch_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_time_is_nonzero() {
        assert!(unix_epoch_ms() > 0);
    }

    #[test]
    fn epoch_time_does_not_go_backwards() {
        let a = unix_epoch_ms();
        let b = unix_epoch_ms();
        assert!(b >= a);
    }
}
