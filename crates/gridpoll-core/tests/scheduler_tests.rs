//! ---
//! gridpoll_section: "01-core-functionality"
//! gridpoll_subsection: "module"
//! gridpoll_type: "source"
//! gridpoll_scope: "code"
//! gridpoll_description: "Adaptive polling core wiring discovery, sessions, dispatch and aggregation."
//! gridpoll_version: "v0.1.0"
//! gridpoll_owner: "tbd"
//! ---
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use gridpoll_agg::{
    AveragingProcessor, ObisConsumer, ObisUpdate, RegisterConsumer, RegisterUpdate,
};
use gridpoll_core::{
    CommandPacketReceiver, PacketDispatcher, PollScheduler, TokenRepository, DAY_POLL_TIMEOUT,
    DAY_QUERY_INTERVAL_MS, NIGHT_POLL_TIMEOUT,
};
use gridpoll_metrics::{new_registry, PollerMetrics};
use gridpoll_wire::{
    CommandChannel, CommandClass, CommandResponse, Device, DeviceClass, DeviceIdentity,
    InboundPacket, InboundPayload, PacketSource,
};

const PV_SERIAL: u32 = 3010538116;
const BATTERY_SERIAL: u32 = 1901026885;
const MPP1_DC_POWER: u32 = 0x0025_1E01;

fn pv_device() -> Device {
    Device::fully_registered(
        "192.168.182.18".parse().unwrap(),
        DeviceIdentity::new(378, PV_SERIAL),
        DeviceClass::PvInverter,
    )
}

fn battery_device() -> Device {
    Device::fully_registered(
        "192.168.178.22".parse().unwrap(),
        DeviceIdentity::new(372, BATTERY_SERIAL),
        DeviceClass::BatteryInverter,
    )
}

#[derive(Debug, Clone, PartialEq)]
enum Action {
    Logoff(u32),
    Login(u32),
    Query(u32, CommandClass, u32, u32),
}

/// Command channel standing in for the fleet: mints real tokens and, when
/// configured to answer, injects the matching response into the inbox the
/// packet source drains.
struct ScriptedChannel {
    tokens: Arc<TokenRepository>,
    inbox: Arc<Mutex<VecDeque<InboundPacket>>>,
    auto_respond: bool,
    response_records: Vec<(u32, f64)>,
    log: Mutex<Vec<(Action, Instant)>>,
}

impl ScriptedChannel {
    fn push_response(&self, token: u32, identity: DeviceIdentity, records: &[(u32, f64)]) {
        let source: SocketAddr = "192.168.182.18:9560".parse().unwrap();
        self.inbox.lock().push_back(InboundPacket {
            source,
            payload: InboundPayload::Command(CommandResponse {
                token,
                identity,
                records: records
                    .iter()
                    .map(|(id, value)| gridpoll_wire::RegisterRecord {
                        id: *id,
                        value: *value,
                    })
                    .collect(),
            }),
        });
    }

    fn actions(&self) -> Vec<Action> {
        self.log.lock().iter().map(|(a, _)| a.clone()).collect()
    }

    fn query_times(&self) -> Vec<Instant> {
        self.log
            .lock()
            .iter()
            .filter(|(a, _)| matches!(a, Action::Query(..)))
            .map(|(_, at)| *at)
            .collect()
    }
}

#[async_trait]
impl CommandChannel for ScriptedChannel {
    async fn logoff(&self, device: &Device) -> gridpoll_wire::Result<()> {
        let serial = device.serial().unwrap();
        self.log.lock().push((Action::Logoff(serial), Instant::now()));
        Ok(())
    }

    async fn login(
        &self,
        device: &Device,
        _installer_level: bool,
        _credential: &str,
    ) -> gridpoll_wire::Result<()> {
        let identity = device.identity.unwrap();
        let token = self.tokens.mint();
        self.log
            .lock()
            .push((Action::Login(identity.serial), Instant::now()));
        if self.auto_respond {
            // Login acks carry no records.
            self.push_response(token, identity, &[]);
        }
        Ok(())
    }

    async fn send_query_request(
        &self,
        device: &Device,
        class: CommandClass,
        range_start: u32,
        range_end: u32,
    ) -> gridpoll_wire::Result<i32> {
        let identity = device.identity.unwrap();
        let token = self.tokens.mint();
        self.log.lock().push((
            Action::Query(identity.serial, class, range_start, range_end),
            Instant::now(),
        ));
        if self.auto_respond {
            self.push_response(token, identity, &self.response_records);
        }
        Ok(token as i32)
    }
}

/// Packet source draining the shared inbox; with nothing queued it sleeps
/// out the timeout like a real readiness wait.
struct ScriptedSource {
    inbox: Arc<Mutex<VecDeque<InboundPacket>>>,
}

#[async_trait]
impl PacketSource for ScriptedSource {
    async fn poll_once(&self, timeout: Duration) -> gridpoll_wire::Result<Vec<InboundPacket>> {
        if self.inbox.lock().is_empty() {
            tokio::time::sleep(timeout).await;
            return Ok(Vec::new());
        }
        Ok(self.inbox.lock().drain(..).collect())
    }
}

#[derive(Default)]
struct RecordingSink {
    registers: Mutex<Vec<RegisterUpdate>>,
    device_ends: Mutex<Vec<(u32, u64)>>,
}

impl ObisConsumer for RecordingSink {
    fn consume_obis(&self, _update: ObisUpdate) {}
    fn end_of_obis_data(&self, _time: u64) {}
}

impl RegisterConsumer for RecordingSink {
    fn consume_register(&self, update: RegisterUpdate) {
        self.registers.lock().push(update);
    }

    fn end_of_device_data(&self, serial: u32, time: u64) {
        self.device_ends.lock().push((serial, time));
    }
}

struct Harness {
    scheduler: PollScheduler,
    channel: Arc<ScriptedChannel>,
    tokens: Arc<TokenRepository>,
    sink: Arc<RecordingSink>,
}

fn harness(devices: Vec<Device>, auto_respond: bool, response_records: Vec<(u32, f64)>) -> Harness {
    let tokens = Arc::new(TokenRepository::with_seed(1000));
    let inbox = Arc::new(Mutex::new(VecDeque::new()));
    let channel = Arc::new(ScriptedChannel {
        tokens: tokens.clone(),
        inbox: inbox.clone(),
        auto_respond,
        response_records,
        log: Mutex::new(Vec::new()),
    });

    let averager = Arc::new(AveragingProcessor::new(60_000, 0));
    let sink = Arc::new(RecordingSink::default());
    averager.add_register_consumer(sink.clone());

    let dispatcher = Arc::new(PacketDispatcher::new(Arc::new(ScriptedSource { inbox })));
    dispatcher.register_receiver(Arc::new(CommandPacketReceiver::new(
        tokens.clone(),
        averager.clone(),
    )));

    let metrics = PollerMetrics::new(new_registry()).unwrap();
    let scheduler = PollScheduler::new(
        devices,
        channel.clone(),
        dispatcher,
        tokens.clone(),
        averager,
        metrics,
    );
    Harness {
        scheduler,
        channel,
        tokens,
        sink,
    }
}

async fn run_iterations(harness: &mut Harness, count: usize) {
    for _ in 0..count {
        harness.scheduler.run_iteration().await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn first_iteration_runs_a_login_round_then_queries_immediately() {
    let mut h = harness(vec![pv_device()], true, vec![(MPP1_DC_POWER, 640.0)]);

    run_iterations(&mut h, 1).await;
    assert_eq!(
        h.channel.actions(),
        vec![Action::Logoff(PV_SERIAL), Action::Login(PV_SERIAL)]
    );
    assert!(!h.scheduler.context().needs_login);
    assert_eq!(h.tokens.size(), 0, "login ack resolved its token");

    // The rewound interval makes the next iteration query without waiting.
    let before = Instant::now();
    run_iterations(&mut h, 1).await;
    assert_eq!(Instant::now(), before, "no idle wait before the first cycle");

    let queries: Vec<Action> = h
        .channel
        .actions()
        .into_iter()
        .filter(|a| matches!(a, Action::Query(..)))
        .collect();
    assert_eq!(
        queries,
        vec![
            Action::Query(PV_SERIAL, CommandClass::DcQuery, 0x0025_1E00, 0x0025_1EFF),
            Action::Query(PV_SERIAL, CommandClass::DcQuery, 0x0045_1F00, 0x0045_21FF),
            Action::Query(PV_SERIAL, CommandClass::AcQuery, 0x0046_4000, 0x0046_42FF),
            Action::Query(PV_SERIAL, CommandClass::StatusQuery, 0x0021_4800, 0x0021_48FF),
            Action::Query(PV_SERIAL, CommandClass::StatusQuery, 0x0041_6400, 0x0041_64FF),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn completed_cycle_flushes_once_per_inverter_device() {
    let mut h = harness(
        vec![pv_device(), battery_device()],
        true,
        vec![(MPP1_DC_POWER, 640.0)],
    );

    run_iterations(&mut h, 2).await;

    let ends = h.sink.device_ends.lock().clone();
    let serials: Vec<u32> = ends.iter().map(|(serial, _)| *serial).collect();
    assert_eq!(serials, vec![PV_SERIAL, BATTERY_SERIAL]);
    assert!(!h.scheduler.context().query_in_flight);
    assert!(!h.scheduler.context().night_mode, "plant is producing");
}

#[tokio::test(start_paused = true)]
async fn no_flush_while_responses_are_outstanding() {
    let mut h = harness(vec![pv_device()], false, vec![]);

    // Login round (unanswered) plus the first query cycle.
    run_iterations(&mut h, 2).await;
    assert_eq!(h.tokens.size(), 5);
    assert!(h.scheduler.context().query_in_flight);
    assert!(h.sink.device_ends.lock().is_empty());

    // Run until the second cycle boundary clears and re-mints the tokens.
    for _ in 0..40 {
        run_iterations(&mut h, 1).await;
        if h.channel.query_times().len() == 10 {
            break;
        }
    }
    assert_eq!(h.channel.query_times().len(), 10, "second cycle started");
    assert_eq!(h.tokens.size(), 5, "cleared at the boundary, not stacked");
    assert!(
        h.sink.device_ends.lock().is_empty(),
        "silent cycles never flush"
    );
}

#[tokio::test(start_paused = true)]
async fn day_cadence_spaces_cycles_thirty_seconds_apart() {
    let mut h = harness(vec![pv_device()], true, vec![(MPP1_DC_POWER, 640.0)]);

    for _ in 0..40 {
        run_iterations(&mut h, 1).await;
        if h.channel.query_times().len() >= 10 {
            break;
        }
    }
    let times = h.channel.query_times();
    assert!(times.len() >= 10);
    let gap = times[5].duration_since(times[0]);
    assert_eq!(gap.as_millis() as u64, DAY_QUERY_INTERVAL_MS);
}

#[tokio::test(start_paused = true)]
async fn zero_dc_power_enables_night_mode_for_the_following_pass() {
    let mut h = harness(vec![pv_device()], true, vec![(MPP1_DC_POWER, 0.0)]);

    run_iterations(&mut h, 2).await;
    assert!(h.scheduler.context().night_mode, "dark plant enables night mode");
    assert_eq!(h.sink.device_ends.lock().len(), 1, "cycle still flushed");

    // The pass right after a dark cycle runs the night cadence; the flag is
    // then reset and only re-derived when an inverter response arrives, so
    // the pass after that is back on the day timeout.
    let before = Instant::now();
    run_iterations(&mut h, 1).await;
    assert_eq!(Instant::now().duration_since(before), NIGHT_POLL_TIMEOUT);
    assert!(!h.scheduler.context().night_mode);

    let before = Instant::now();
    run_iterations(&mut h, 1).await;
    assert_eq!(Instant::now().duration_since(before), DAY_POLL_TIMEOUT);
}

#[tokio::test(start_paused = true)]
async fn battery_device_gets_its_own_query_plan() {
    let mut h = harness(vec![battery_device()], true, vec![]);

    run_iterations(&mut h, 2).await;
    let queries: Vec<Action> = h
        .channel
        .actions()
        .into_iter()
        .filter(|a| matches!(a, Action::Query(..)))
        .collect();
    assert_eq!(
        queries,
        vec![
            Action::Query(
                BATTERY_SERIAL,
                CommandClass::StatusQuery,
                0x0021_4800,
                0x0041_64FF
            ),
            Action::Query(
                BATTERY_SERIAL,
                CommandClass::StatusQuery,
                0x0041_6400,
                0x0041_64FF
            ),
            Action::Query(
                BATTERY_SERIAL,
                CommandClass::AcQuery,
                0x0026_3F00,
                0x0049_5DFF
            ),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn meter_only_install_idles_without_queries() {
    let meter = Device::fully_registered(
        "192.168.178.20".parse().unwrap(),
        DeviceIdentity::new(349, 1901431377),
        DeviceClass::Meter,
    );
    let mut h = harness(vec![meter], true, vec![]);

    run_iterations(&mut h, 5).await;
    assert!(h.channel.actions().is_empty(), "meters hold no sessions");
    assert!(!h.scheduler.context().query_in_flight);
    assert!(h.sink.device_ends.lock().is_empty());
}
