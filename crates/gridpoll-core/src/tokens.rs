//! ---
//! gridpoll_section: "01-core-functionality"
//! gridpoll_subsection: "module"
//! gridpoll_type: "source"
//! gridpoll_scope: "code"
//! gridpoll_description: "Adaptive polling core wiring discovery, sessions, dispatch and aggregation."
//! gridpoll_version: "v0.1.0"
//! gridpoll_owner: "tbd"
//! ---
use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::trace;

use gridpoll_common::unix_epoch_ms;
use gridpoll_wire::TokenMinter;

struct TokenState {
    next: u32,
    /// token -> mint timestamp (unix epoch ms), kept for trace logging.
    outstanding: IndexMap<u32, u64>,
}

/// Repository of correlation tokens for requests awaiting a response.
///
/// Its size gates cycle completion: the scheduler only flushes inverter
/// aggregation once every token minted for the cycle has been resolved.
/// Tokens abandoned by a silent device survive until the `clear()` at the
/// next cycle boundary; they are never retried within a cycle.
pub struct TokenRepository {
    state: Mutex<TokenState>,
}

impl TokenRepository {
    /// Repository with a random token origin, so tokens from a restarted
    /// process do not collide with responses still in flight.
    pub fn new() -> Self {
        Self::with_seed(rand::random())
    }

    /// Repository minting from a fixed origin; tests use this for
    /// deterministic tokens.
    pub fn with_seed(seed: u32) -> Self {
        Self {
            state: Mutex::new(TokenState {
                next: seed,
                outstanding: IndexMap::new(),
            }),
        }
    }

    /// Mint a fresh token and record it as outstanding.
    pub fn mint(&self) -> u32 {
        let mut state = self.state.lock();
        let token = state.next;
        state.next = state.next.wrapping_add(1);
        state.outstanding.insert(token, unix_epoch_ms());
        trace!(token, outstanding = state.outstanding.len(), "token minted");
        token
    }

    /// Resolve a token against an inbound response. Returns false for
    /// unknown tokens, including late responses to an already cleared
    /// cycle.
    pub fn resolve(&self, token: u32) -> bool {
        let resolved = self.state.lock().outstanding.shift_remove(&token).is_some();
        trace!(token, resolved, "token resolution");
        resolved
    }

    /// Discard every outstanding token. Called unconditionally at each
    /// query-cycle boundary; a no-op on an empty repository.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        if !state.outstanding.is_empty() {
            trace!(discarded = state.outstanding.len(), "clearing outstanding tokens");
        }
        state.outstanding.clear();
    }

    /// Count of requests still awaiting a response.
    pub fn size(&self) -> usize {
        self.state.lock().outstanding.len()
    }
}

impl Default for TokenRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenMinter for TokenRepository {
    fn mint(&self) -> u32 {
        TokenRepository::mint(self)
    }
}
