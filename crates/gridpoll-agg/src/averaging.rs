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
use tracing::debug;

use crate::measurement::{
    MeasurementValues, ObisQuantity, QuantityMap, RegisterQuantity, TimestampedValue,
};
use crate::{AggError, ObisConsumer, ObisUpdate, RegisterConsumer, RegisterUpdate, Result};

/// Nominal cadence of the meter push stream.
const NOMINAL_METER_INTERVAL_MS: u64 = 1_000;

/// Windowed averaging over two independent quantity maps.
///
/// Meter-stream quantities are buffered in rings sized for the configured
/// window and flushed on a wall-clock window boundary, evaluated when meter
/// data arrives. Inverter register quantities keep only the newest value
/// and flush on the explicit end-of-cycle signal when the register window
/// is configured as zero.
pub struct AveragingProcessor {
    averaging_time_obis_ms: u64,
    averaging_time_register_ms: u64,
    obis_values: Mutex<QuantityMap<ObisQuantity>>,
    register_values: Mutex<QuantityMap<RegisterQuantity>>,
    obis_window_start: Mutex<u64>,
    register_window_start: Mutex<u64>,
    obis_consumers: Mutex<Vec<Arc<dyn ObisConsumer>>>,
    register_consumers: Mutex<Vec<Arc<dyn RegisterConsumer>>>,
}

impl AveragingProcessor {
    /// Create a processor with the two averaging windows in milliseconds;
    /// a zero window means "flush on explicit signal only".
    pub fn new(averaging_time_obis_ms: u64, averaging_time_register_ms: u64) -> Self {
        Self {
            averaging_time_obis_ms,
            averaging_time_register_ms,
            obis_values: Mutex::new(QuantityMap::new()),
            register_values: Mutex::new(QuantityMap::new()),
            obis_window_start: Mutex::new(0),
            register_window_start: Mutex::new(0),
            obis_consumers: Mutex::new(Vec::new()),
            register_consumers: Mutex::new(Vec::new()),
        }
    }

    /// Register a meter-stream consumer; notified in registration order.
    pub fn add_obis_consumer(&self, consumer: Arc<dyn ObisConsumer>) {
        self.obis_consumers.lock().push(consumer);
    }

    /// Register an inverter-register consumer; notified in registration order.
    pub fn add_register_consumer(&self, consumer: Arc<dyn RegisterConsumer>) {
        self.register_consumers.lock().push(consumer);
    }

    fn obis_ring_elements(&self) -> usize {
        (self.averaging_time_obis_ms / NOMINAL_METER_INTERVAL_MS).max(1) as usize
    }

    /// Newest buffered value of a register quantity; the adaptive
    /// scheduler reads MPP1 DC power through this to derive night mode.
    pub fn newest_register(&self, quantity: RegisterQuantity) -> Option<TimestampedValue> {
        self.register_values
            .lock()
            .get(&quantity)
            .and_then(MeasurementValues::newest)
    }

    /// Average over the current contents of a meter quantity's buffer.
    pub fn obis_average(&self, quantity: ObisQuantity) -> Result<f64> {
        self.obis_values
            .lock()
            .get(&quantity)
            .and_then(MeasurementValues::average)
            .ok_or_else(|| AggError::NoData(quantity.to_string()))
    }

    fn flush_obis(&self, time: u64) {
        let updates: Vec<ObisUpdate> = {
            let values = self.obis_values.lock();
            values
                .iter()
                .filter_map(|(quantity, buffer)| {
                    buffer.average().map(|value| ObisUpdate {
                        quantity: *quantity,
                        value,
                        time,
                    })
                })
                .collect()
        };
        debug!(quantities = updates.len(), time, "flushing averaged meter data");
        let consumers = self.obis_consumers.lock();
        for update in &updates {
            for consumer in consumers.iter() {
                consumer.consume_obis(*update);
            }
        }
        for consumer in consumers.iter() {
            consumer.end_of_obis_data(time);
        }
    }

    fn flush_registers(&self, serial: u32, time: u64) {
        let updates: Vec<RegisterUpdate> = {
            let values = self.register_values.lock();
            values
                .iter()
                .filter_map(|(quantity, buffer)| {
                    buffer.newest().map(|newest| RegisterUpdate {
                        quantity: *quantity,
                        value: newest.value,
                        time: newest.time,
                    })
                })
                .collect()
        };
        debug!(
            serial,
            quantities = updates.len(),
            time,
            "flushing inverter register data"
        );
        let consumers = self.register_consumers.lock();
        for update in &updates {
            for consumer in consumers.iter() {
                consumer.consume_register(*update);
            }
        }
        for consumer in consumers.iter() {
            consumer.end_of_device_data(serial, time);
        }
    }

    /// Whether a wall-clock window starting at `window_start` has elapsed
    /// at `time`. The first signal only anchors the window.
    fn window_elapsed(window_start: &Mutex<u64>, window_ms: u64, time: u64) -> bool {
        let mut start = window_start.lock();
        if *start == 0 {
            *start = time;
            return false;
        }
        if time.saturating_sub(*start) >= window_ms {
            *start = time;
            return true;
        }
        false
    }
}

impl ObisConsumer for AveragingProcessor {
    fn consume_obis(&self, update: ObisUpdate) {
        let ring = self.obis_ring_elements();
        let mut values = self.obis_values.lock();
        values
            .entry(update.quantity)
            .or_insert_with(|| MeasurementValues::new(ring))
            .push(update.value, update.time);
    }

    fn end_of_obis_data(&self, time: u64) {
        if self.averaging_time_obis_ms == 0 {
            self.flush_obis(time);
            return;
        }
        if Self::window_elapsed(&self.obis_window_start, self.averaging_time_obis_ms, time) {
            self.flush_obis(time);
        }
    }
}

impl RegisterConsumer for AveragingProcessor {
    fn consume_register(&self, update: RegisterUpdate) {
        let mut values = self.register_values.lock();
        values
            .entry(update.quantity)
            .or_insert_with(|| MeasurementValues::new(1))
            .push(update.value, update.time);
    }

    fn end_of_device_data(&self, serial: u32, time: u64) {
        if self.averaging_time_register_ms == 0 {
            self.flush_registers(serial, time);
            return;
        }
        if Self::window_elapsed(
            &self.register_window_start,
            self.averaging_time_register_ms,
            time,
        ) {
            self.flush_registers(serial, time);
        }
    }
}
