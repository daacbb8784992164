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
use tokio::time::Instant;
use tracing::{debug, info, warn};

use gridpoll_agg::{AveragingProcessor, RegisterConsumer, RegisterQuantity, TimestampedValue};
use gridpoll_common::unix_epoch_ms;
use gridpoll_metrics::PollerMetrics;
use gridpoll_wire::{query_plan, CommandChannel, Device};

use crate::dispatch::PacketDispatcher;
use crate::session::SessionManager;
use crate::tokens::TokenRepository;

/// Query interval while the PV plant produces.
pub const DAY_QUERY_INTERVAL_MS: u64 = 30_000;
/// Dispatch-pass timeout while the PV plant produces.
pub const DAY_POLL_TIMEOUT: Duration = Duration::from_millis(2_000);
/// Query interval after dark; inverters answer slowly or not at all.
pub const NIGHT_QUERY_INTERVAL_MS: u64 = 300_000;
/// Dispatch-pass timeout after dark.
pub const NIGHT_POLL_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Cadence derived from the night-mode flag: (query interval in ms,
/// dispatch-pass timeout).
pub fn cadence(night_mode: bool) -> (u64, Duration) {
    if night_mode {
        (NIGHT_QUERY_INTERVAL_MS, NIGHT_POLL_TIMEOUT)
    } else {
        (DAY_QUERY_INTERVAL_MS, DAY_POLL_TIMEOUT)
    }
}

/// Whether the newest MPP1 DC power reading indicates night. Night is a
/// reading that exists (non-zero timestamp), is exactly zero, and is no
/// older than the current query interval; a stale or absent reading never
/// enables the slow cadence.
pub fn derive_night_mode(
    newest: Option<TimestampedValue>,
    now_epoch_ms: u64,
    interval_ms: u64,
) -> bool {
    match newest {
        Some(reading) => {
            reading.time != 0
                && reading.value == 0.0
                && now_epoch_ms.saturating_sub(reading.time) <= interval_ms
        }
        None => false,
    }
}

/// Scheduling state carried across iterations.
///
/// `start_time` is milliseconds on the scheduler's own monotonic clock,
/// signed so the post-login rewind can precede the clock origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleContext {
    /// Start of the current query interval on the scheduler clock.
    pub start_time: i64,
    /// Derived at cycle completion, consumed and reset next iteration.
    pub night_mode: bool,
    /// True initially; a login round clears it before issuing logins.
    pub needs_login: bool,
    /// True while a query cycle awaits its responses.
    pub query_in_flight: bool,
}

impl Default for CycleContext {
    fn default() -> Self {
        Self {
            start_time: 0,
            night_mode: false,
            needs_login: true,
            query_in_flight: false,
        }
    }
}

impl CycleContext {
    /// Rewind the interval origin so the next interval check fires
    /// immediately; a fresh login session should not idle away.
    pub fn rewind(&mut self, now_ms: i64, interval_ms: u64) {
        self.start_time = now_ms - interval_ms as i64 - 1;
    }

    /// Whether the query interval has elapsed at `now_ms`.
    pub fn interval_elapsed(&self, now_ms: i64, interval_ms: u64) -> bool {
        now_ms - self.start_time > interval_ms as i64
    }
}

/// The five phases of one scheduler pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    /// Session (re-)establishment across the fleet.
    Login,
    /// Idle gate; an iteration starts and ends here.
    AwaitInterval,
    /// Cycle boundary: clear tokens, send the query plans.
    Query,
    /// One bounded pass over the socket set.
    Dispatch,
    /// Completion check and end-of-cycle flush.
    Aggregate,
}

impl CyclePhase {
    /// Guarded transition function. Pure; the scheduler evaluates it
    /// between phases with its current context and clock.
    pub fn next(self, ctx: &CycleContext, now_ms: i64, interval_ms: u64) -> CyclePhase {
        match self {
            CyclePhase::AwaitInterval => {
                if ctx.needs_login {
                    CyclePhase::Login
                } else if ctx.interval_elapsed(now_ms, interval_ms) {
                    CyclePhase::Query
                } else {
                    CyclePhase::Dispatch
                }
            }
            // A login round ends the iteration; the rewound interval makes
            // the next iteration query immediately.
            CyclePhase::Login => CyclePhase::AwaitInterval,
            CyclePhase::Query => CyclePhase::Dispatch,
            CyclePhase::Dispatch => {
                if ctx.query_in_flight {
                    CyclePhase::Aggregate
                } else {
                    CyclePhase::AwaitInterval
                }
            }
            CyclePhase::Aggregate => CyclePhase::AwaitInterval,
        }
    }
}

/// The adaptive polling scheduler.
///
/// Runs forever on the current-thread runtime; the only suspension points
/// are the bounded dispatch passes. Day cadence queries the fleet every
/// 30 s with 2 s passes; once the newest MPP1 DC power reading is exactly
/// zero the plant is dark and the cadence drops to one query round every
/// 5 min with 10 s passes.
pub struct PollScheduler {
    devices: Vec<Device>,
    channel: Arc<dyn CommandChannel>,
    dispatcher: Arc<PacketDispatcher>,
    tokens: Arc<TokenRepository>,
    averager: Arc<AveragingProcessor>,
    sessions: SessionManager,
    metrics: PollerMetrics,
    origin: Instant,
    ctx: CycleContext,
}

impl PollScheduler {
    pub fn new(
        devices: Vec<Device>,
        channel: Arc<dyn CommandChannel>,
        dispatcher: Arc<PacketDispatcher>,
        tokens: Arc<TokenRepository>,
        averager: Arc<AveragingProcessor>,
        metrics: PollerMetrics,
    ) -> Self {
        let sessions = SessionManager::new(channel.clone());
        Self {
            devices,
            channel,
            dispatcher,
            tokens,
            averager,
            sessions,
            metrics,
            origin: Instant::now(),
            ctx: CycleContext::default(),
        }
    }

    /// Current scheduling context, for observability and tests.
    pub fn context(&self) -> &CycleContext {
        &self.ctx
    }

    fn now_ms(&self) -> i64 {
        self.origin.elapsed().as_millis() as i64
    }

    /// Drive the polling loop forever. Iteration errors are logged, never
    /// fatal; sustained device unavailability degrades to an idle loop.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            devices = self.devices.len(),
            inverters = self.devices.iter().filter(|d| d.is_inverter()).count(),
            "poll scheduler starting"
        );
        loop {
            if let Err(err) = self.run_iteration().await {
                warn!(error = %err, "poll iteration failed");
            }
        }
    }

    /// One scheduler pass: derive the cadence, then walk the phase machine
    /// from `AwaitInterval` back to `AwaitInterval`.
    pub async fn run_iteration(&mut self) -> Result<()> {
        let (interval_ms, poll_timeout) = cadence(self.ctx.night_mode);
        self.ctx.night_mode = false;

        let mut phase = CyclePhase::AwaitInterval;
        loop {
            phase = phase.next(&self.ctx, self.now_ms(), interval_ms);
            match phase {
                CyclePhase::Login => self.login_phase(interval_ms, poll_timeout).await?,
                CyclePhase::Query => self.query_phase(interval_ms).await?,
                CyclePhase::Dispatch => self.dispatch_phase(poll_timeout).await,
                CyclePhase::Aggregate => self.aggregate_phase(interval_ms),
                CyclePhase::AwaitInterval => break,
            }
        }
        Ok(())
    }

    async fn login_phase(&mut self, interval_ms: u64, poll_timeout: Duration) -> Result<()> {
        // Cleared before issuing logins; a failure mid-round must not
        // re-enter the login phase within the iteration.
        self.ctx.needs_login = false;
        self.sessions
            .login_round(&self.devices, &self.dispatcher, poll_timeout)
            .await?;
        self.metrics.inc_login_round();
        let now = self.now_ms();
        self.ctx.rewind(now, interval_ms);
        Ok(())
    }

    async fn query_phase(&mut self, interval_ms: u64) -> Result<()> {
        // Advancing by the interval rather than to `now` keeps the cadence
        // phase-stable; slow passes do not accumulate drift.
        self.ctx.start_time += interval_ms as i64;
        self.tokens.clear();

        let mut sent = 0u64;
        for device in self.devices.iter().filter(|d| d.is_inverter()) {
            let Some(class) = device.class else {
                continue;
            };
            for window in query_plan(class) {
                self.channel
                    .send_query_request(device, window.class, window.range_start, window.range_end)
                    .await?;
                sent += 1;
            }
        }
        self.ctx.query_in_flight = sent > 0;
        self.metrics.inc_queries(sent);
        debug!(queries = sent, "query cycle started");
        Ok(())
    }

    async fn dispatch_phase(&mut self, poll_timeout: Duration) {
        let routed = self.dispatcher.dispatch(poll_timeout).await;
        if routed > 0 {
            self.metrics.add_packets(routed as u64);
        }
        self.metrics.set_tokens_outstanding(self.tokens.size());
    }

    fn aggregate_phase(&mut self, interval_ms: u64) {
        if self.tokens.size() > 0 {
            // Responses still outstanding; the cycle stays in flight until
            // they arrive or the next boundary clears them.
            return;
        }
        self.ctx.query_in_flight = false;

        let now = unix_epoch_ms();
        let newest = self.averager.newest_register(RegisterQuantity::DcPowerMpp1);
        self.ctx.night_mode = derive_night_mode(newest, now, interval_ms);
        self.metrics.set_night_mode(self.ctx.night_mode);
        self.metrics.inc_cycle();

        for device in self.devices.iter().filter(|d| d.is_inverter()) {
            if let Some(serial) = device.serial() {
                self.averager.end_of_device_data(serial, now);
            }
        }
        debug!(night_mode = self.ctx.night_mode, "query cycle complete");
    }
}
