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

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::measurement::{ObisQuantity, TimestampedValue};
use crate::{
    MeasurementSink, ObisConsumer, ObisUpdate, RegisterConsumer, RegisterUpdate,
};

/// (positive, negative, signed) derivation tuples. The meter transmits the
/// unsigned directional quantities; consumers want the signed balance.
const SIGNED_DERIVATIONS: [(ObisQuantity, ObisQuantity, ObisQuantity); 4] = [
    (
        ObisQuantity::PositiveActivePowerTotal,
        ObisQuantity::NegativeActivePowerTotal,
        ObisQuantity::SignedActivePowerTotal,
    ),
    (
        ObisQuantity::PositiveActivePowerL1,
        ObisQuantity::NegativeActivePowerL1,
        ObisQuantity::SignedActivePowerL1,
    ),
    (
        ObisQuantity::PositiveActivePowerL2,
        ObisQuantity::NegativeActivePowerL2,
        ObisQuantity::SignedActivePowerL2,
    ),
    (
        ObisQuantity::PositiveActivePowerL3,
        ObisQuantity::NegativeActivePowerL3,
        ObisQuantity::SignedActivePowerL3,
    ),
];

/// Derives signed active power (positive minus negative, total and per
/// phase) from the averaged meter quantities and forwards everything,
/// derived values included, to the terminal sink.
pub struct CalculatedValueProcessor {
    sink: Arc<dyn MeasurementSink>,
    latest_obis: Mutex<IndexMap<ObisQuantity, TimestampedValue>>,
}

impl CalculatedValueProcessor {
    pub fn new(sink: Arc<dyn MeasurementSink>) -> Self {
        Self {
            sink,
            latest_obis: Mutex::new(IndexMap::new()),
        }
    }
}

impl ObisConsumer for CalculatedValueProcessor {
    fn consume_obis(&self, update: ObisUpdate) {
        self.latest_obis.lock().insert(
            update.quantity,
            TimestampedValue {
                value: update.value,
                time: update.time,
            },
        );
        self.sink.consume_obis(update);
    }

    fn end_of_obis_data(&self, time: u64) {
        let derived: Vec<ObisUpdate> = {
            let latest = self.latest_obis.lock();
            SIGNED_DERIVATIONS
                .iter()
                .filter_map(|(positive, negative, signed)| {
                    let positive = latest.get(positive)?;
                    let negative = latest.get(negative)?;
                    Some(ObisUpdate {
                        quantity: *signed,
                        value: positive.value - negative.value,
                        time,
                    })
                })
                .collect()
        };
        for update in derived {
            self.sink.consume_obis(update);
        }
        self.sink.end_of_obis_data(time);
    }
}

impl RegisterConsumer for CalculatedValueProcessor {
    fn consume_register(&self, update: RegisterUpdate) {
        self.sink.consume_register(update);
    }

    fn end_of_device_data(&self, serial: u32, time: u64) {
        self.sink.end_of_device_data(serial, time);
    }
}
