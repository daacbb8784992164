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

use indexmap::IndexSet;
use parking_lot::Mutex;
use tracing::trace;

use crate::measurement::ObisQuantity;
use crate::{ObisConsumer, ObisUpdate};

/// Admission filter at the head of the meter-stream pipeline. Only
/// configured quantities pass through to the registered consumers.
#[derive(Default)]
pub struct ObisFilter {
    admitted: Mutex<IndexSet<ObisQuantity>>,
    consumers: Mutex<Vec<Arc<dyn ObisConsumer>>>,
}

impl ObisFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit the given quantities. Calculated quantities may be listed for
    /// completeness; they never arrive on the wire.
    pub fn add_filter(&self, quantities: impl IntoIterator<Item = ObisQuantity>) {
        let mut admitted = self.admitted.lock();
        for quantity in quantities {
            admitted.insert(quantity);
        }
    }

    /// Register a consumer; notification order follows registration order.
    pub fn add_consumer(&self, consumer: Arc<dyn ObisConsumer>) {
        self.consumers.lock().push(consumer);
    }

    /// Whether a quantity passes the filter.
    pub fn is_admitted(&self, quantity: ObisQuantity) -> bool {
        self.admitted.lock().contains(&quantity)
    }

    /// Feed one classified update through the filter.
    pub fn consume(&self, update: ObisUpdate) {
        if !self.is_admitted(update.quantity) {
            trace!(quantity = %update.quantity, "obis update rejected by filter");
            return;
        }
        for consumer in self.consumers.lock().iter() {
            consumer.consume_obis(update);
        }
    }

    /// Propagate the end-of-datagram signal.
    pub fn end_of_obis_data(&self, time: u64) {
        for consumer in self.consumers.lock().iter() {
            consumer.end_of_obis_data(time);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        updates: Mutex<Vec<ObisUpdate>>,
        ends: Mutex<Vec<u64>>,
    }

    impl ObisConsumer for Recorder {
        fn consume_obis(&self, update: ObisUpdate) {
            self.updates.lock().push(update);
        }

        fn end_of_obis_data(&self, time: u64) {
            self.ends.lock().push(time);
        }
    }

    #[test]
    fn only_admitted_quantities_pass() {
        let filter = ObisFilter::new();
        filter.add_filter([ObisQuantity::PositiveActivePowerTotal]);
        let recorder = Arc::new(Recorder::default());
        filter.add_consumer(recorder.clone());

        filter.consume(ObisUpdate {
            quantity: ObisQuantity::PositiveActivePowerTotal,
            value: 100.0,
            time: 1,
        });
        filter.consume(ObisUpdate {
            quantity: ObisQuantity::PowerFactorL2,
            value: 0.9,
            time: 1,
        });
        filter.end_of_obis_data(1);

        assert_eq!(recorder.updates.lock().len(), 1);
        assert_eq!(
            recorder.updates.lock()[0].quantity,
            ObisQuantity::PositiveActivePowerTotal
        );
        assert_eq!(recorder.ends.lock().as_slice(), &[1]);
    }
}
