//! ---
//! gridpoll_section: "03-measurement-aggregation"
//! gridpoll_subsection: "module"
//! gridpoll_type: "source"
//! gridpoll_scope: "code"
//! gridpoll_description: "Measurement aggregation pipeline."
//! gridpoll_version: "v0.1.0"
//! gridpoll_owner: "tbd"
//! ---
use std::sync::Arc;

use parking_lot::Mutex;

use gridpoll_agg::{
    AveragingProcessor, CalculatedValueProcessor, ObisConsumer, ObisFilter, ObisQuantity,
    ObisUpdate, RegisterConsumer, RegisterQuantity, RegisterUpdate,
};

#[derive(Default)]
struct RecordingSink {
    obis: Mutex<Vec<ObisUpdate>>,
    registers: Mutex<Vec<RegisterUpdate>>,
    obis_ends: Mutex<Vec<u64>>,
    device_ends: Mutex<Vec<(u32, u64)>>,
}

impl ObisConsumer for RecordingSink {
    fn consume_obis(&self, update: ObisUpdate) {
        self.obis.lock().push(update);
    }

    fn end_of_obis_data(&self, time: u64) {
        self.obis_ends.lock().push(time);
    }
}

impl RegisterConsumer for RecordingSink {
    fn consume_register(&self, update: RegisterUpdate) {
        self.registers.lock().push(update);
    }

    fn end_of_device_data(&self, serial: u32, time: u64) {
        self.device_ends.lock().push((serial, time));
    }
}

/// The reference chain: filter → averager → calculator → sink.
fn build_pipeline(
    obis_window_ms: u64,
) -> (Arc<ObisFilter>, Arc<AveragingProcessor>, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let calculator = Arc::new(CalculatedValueProcessor::new(sink.clone()));
    let averager = Arc::new(AveragingProcessor::new(obis_window_ms, 0));
    let filter = Arc::new(ObisFilter::new());
    filter.add_filter([
        ObisQuantity::PositiveActivePowerTotal,
        ObisQuantity::NegativeActivePowerTotal,
        ObisQuantity::PowerFactorTotal,
        ObisQuantity::SignedActivePowerTotal,
    ]);
    filter.add_consumer(averager.clone());
    averager.add_obis_consumer(calculator.clone());
    averager.add_register_consumer(calculator);
    (filter, averager, sink)
}

fn feed_meter_datagram(filter: &ObisFilter, positive: f64, negative: f64, time: u64) {
    filter.consume(ObisUpdate {
        quantity: ObisQuantity::PositiveActivePowerTotal,
        value: positive,
        time,
    });
    filter.consume(ObisUpdate {
        quantity: ObisQuantity::NegativeActivePowerTotal,
        value: negative,
        time,
    });
    filter.end_of_obis_data(time);
}

#[test]
fn meter_window_flushes_on_wall_clock_boundary() {
    let (filter, _averager, sink) = build_pipeline(60_000);

    // One datagram per nominal second; the first anchors the window.
    let mut time = 1_000_000u64;
    feed_meter_datagram(&filter, 1000.0, 0.0, time);
    for _ in 0..59 {
        time += 1_000;
        feed_meter_datagram(&filter, 1000.0, 0.0, time);
        assert!(sink.obis_ends.lock().is_empty(), "no flush inside window");
    }

    time += 1_000;
    feed_meter_datagram(&filter, 1000.0, 0.0, time);
    assert_eq!(sink.obis_ends.lock().as_slice(), &[time]);

    let obis = sink.obis.lock();
    let averaged = obis
        .iter()
        .find(|u| u.quantity == ObisQuantity::PositiveActivePowerTotal)
        .expect("averaged positive total");
    assert_eq!(averaged.value, 1000.0);
    let signed = obis
        .iter()
        .find(|u| u.quantity == ObisQuantity::SignedActivePowerTotal)
        .expect("derived signed total");
    assert_eq!(signed.value, 1000.0);
}

#[test]
fn silent_meter_produces_no_flush() {
    let (_filter, averager, sink) = build_pipeline(60_000);
    // No meter datagrams arrive; register traffic alone must not trigger
    // the meter-side window.
    averager.consume_register(RegisterUpdate {
        quantity: RegisterQuantity::DcPowerMpp1,
        value: 100.0,
        time: 500,
    });
    assert!(sink.obis_ends.lock().is_empty());
    assert!(sink.obis.lock().is_empty());
}

#[test]
fn register_flush_is_signal_driven_only() {
    let (_filter, averager, sink) = build_pipeline(60_000);

    averager.consume_register(RegisterUpdate {
        quantity: RegisterQuantity::DcPowerMpp1,
        value: 250.0,
        time: 1_000,
    });
    averager.consume_register(RegisterUpdate {
        quantity: RegisterQuantity::AcPowerL1,
        value: 240.0,
        time: 1_000,
    });
    assert!(sink.device_ends.lock().is_empty(), "no flush before signal");

    averager.end_of_device_data(3010538116, 2_000);
    assert_eq!(sink.device_ends.lock().as_slice(), &[(3010538116, 2_000)]);
    assert_eq!(sink.registers.lock().len(), 2);
}

#[test]
fn register_ring_keeps_only_newest_value() {
    let (_filter, averager, sink) = build_pipeline(60_000);

    averager.consume_register(RegisterUpdate {
        quantity: RegisterQuantity::DcPowerMpp1,
        value: 100.0,
        time: 1_000,
    });
    averager.consume_register(RegisterUpdate {
        quantity: RegisterQuantity::DcPowerMpp1,
        value: 175.0,
        time: 31_000,
    });
    averager.end_of_device_data(3010538116, 32_000);

    let registers = sink.registers.lock();
    assert_eq!(registers.len(), 1);
    assert_eq!(registers[0].value, 175.0);
    assert_eq!(registers[0].time, 31_000);

    let newest = averager
        .newest_register(RegisterQuantity::DcPowerMpp1)
        .expect("newest value retained");
    assert_eq!(newest.value, 175.0);
}

#[test]
fn consumers_are_notified_in_registration_order() {
    struct Tagger {
        tag: u32,
        log: Arc<Mutex<Vec<u32>>>,
    }

    impl ObisConsumer for Tagger {
        fn consume_obis(&self, _update: ObisUpdate) {}

        fn end_of_obis_data(&self, _time: u64) {
            self.log.lock().push(self.tag);
        }
    }

    let log = Arc::new(Mutex::new(Vec::new()));
    let filter = ObisFilter::new();
    filter.add_filter([ObisQuantity::PowerFactorTotal]);
    for tag in [1u32, 2, 3] {
        filter.add_consumer(Arc::new(Tagger {
            tag,
            log: log.clone(),
        }));
    }

    filter.end_of_obis_data(42);
    assert_eq!(log.lock().as_slice(), &[1, 2, 3]);
}

#[test]
fn obis_average_reports_missing_data() {
    let averager = AveragingProcessor::new(60_000, 0);
    assert!(averager
        .obis_average(ObisQuantity::PowerFactorTotal)
        .is_err());

    averager.consume_obis(ObisUpdate {
        quantity: ObisQuantity::PowerFactorTotal,
        value: 0.95,
        time: 1,
    });
    averager.consume_obis(ObisUpdate {
        quantity: ObisQuantity::PowerFactorTotal,
        value: 0.85,
        time: 2,
    });
    let average = averager
        .obis_average(ObisQuantity::PowerFactorTotal)
        .unwrap();
    assert!((average - 0.90).abs() < 1e-9);
}
