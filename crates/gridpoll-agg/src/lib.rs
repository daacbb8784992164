//! ---
//! gridpoll_section: "03-measurement-aggregation"
//! gridpoll_subsection: "module"
//! gridpoll_type: "source"
//! gridpoll_scope: "code"
//! gridpoll_description: "Measurement aggregation pipeline."
//! gridpoll_version: "v0.1.0"
//! gridpoll_owner: "tbd"
//! ---

//! The aggregation pipeline: classified measurement updates flow through an
//! admission filter into ring buffers, get averaged over a wall-clock
//! window (meter stream) or replaced per query cycle (inverter registers),
//! pass a calculated-value stage deriving the signed power quantities, and
//! end at whatever terminal sink the deployment registers.

pub mod averaging;
pub mod calculated;
pub mod filter;
pub mod measurement;

/// Shared result type for aggregation operations.
pub type Result<T> = std::result::Result<T, AggError>;

/// Errors surfaced by the aggregation pipeline.
#[derive(Debug, thiserror::Error)]
pub enum AggError {
    /// A consumer asked for an average but the buffer holds no values yet.
    #[error("no data recorded for quantity {0}")]
    NoData(String),
}

/// Classified update for one meter (OBIS) quantity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObisUpdate {
    /// The quantity being updated.
    pub quantity: measurement::ObisQuantity,
    /// Value in engineering units.
    pub value: f64,
    /// Unix epoch milliseconds of the observation.
    pub time: u64,
}

/// Classified update for one inverter register quantity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegisterUpdate {
    /// The quantity being updated.
    pub quantity: measurement::RegisterQuantity,
    /// Value in engineering units.
    pub value: f64,
    /// Unix epoch milliseconds of the observation.
    pub time: u64,
}

/// Consumer of meter-stream measurements. Notified synchronously, in
/// registration order.
pub trait ObisConsumer: Send + Sync {
    /// Accept one classified meter update.
    fn consume_obis(&self, update: ObisUpdate);
    /// The meter datagram (or averaging window) that produced the
    /// preceding updates is complete.
    fn end_of_obis_data(&self, time: u64);
}

/// Consumer of inverter register measurements. Notified synchronously, in
/// registration order.
pub trait RegisterConsumer: Send + Sync {
    /// Accept one classified register update.
    fn consume_register(&self, update: RegisterUpdate);
    /// End-of-cycle flush signal for the device with the given serial.
    fn end_of_device_data(&self, serial: u32, time: u64);
}

/// Terminal sink accepting both measurement streams.
pub trait MeasurementSink: ObisConsumer + RegisterConsumer {}

impl<T: ObisConsumer + RegisterConsumer> MeasurementSink for T {}

pub use averaging::AveragingProcessor;
pub use calculated::CalculatedValueProcessor;
pub use filter::ObisFilter;
pub use measurement::{MeasurementValues, ObisQuantity, RegisterQuantity, TimestampedValue};
