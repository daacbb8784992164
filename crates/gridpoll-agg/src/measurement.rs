//! ---
//! gridpoll_section: "03-measurement-aggregation"
//! gridpoll_subsection: "module"
//! gridpoll_type: "source"
//! gridpoll_scope: "code"
//! gridpoll_description: "Measurement aggregation pipeline."
//! gridpoll_version: "v0.1.0"
//! gridpoll_owner: "tbd"
//! ---
use std::collections::VecDeque;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Meter quantities, keyed by their OBIS identifier on the wire. The four
/// signed quantities are not transmitted by the meter; the calculated-value
/// stage derives them as positive minus negative.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
pub enum ObisQuantity {
    PositiveActivePowerTotal,
    PositiveActivePowerL1,
    PositiveActivePowerL2,
    PositiveActivePowerL3,
    NegativeActivePowerTotal,
    NegativeActivePowerL1,
    NegativeActivePowerL2,
    NegativeActivePowerL3,
    PowerFactorTotal,
    PowerFactorL1,
    PowerFactorL2,
    PowerFactorL3,
    SignedActivePowerTotal,
    SignedActivePowerL1,
    SignedActivePowerL2,
    SignedActivePowerL3,
}

impl ObisQuantity {
    /// Map a wire OBIS identifier to its quantity; `None` for identifiers
    /// outside the supported set.
    pub fn from_wire(id: u32) -> Option<Self> {
        match id {
            0x0001_0400 => Some(Self::PositiveActivePowerTotal),
            0x0015_0400 => Some(Self::PositiveActivePowerL1),
            0x0029_0400 => Some(Self::PositiveActivePowerL2),
            0x003D_0400 => Some(Self::PositiveActivePowerL3),
            0x0002_0400 => Some(Self::NegativeActivePowerTotal),
            0x0016_0400 => Some(Self::NegativeActivePowerL1),
            0x002A_0400 => Some(Self::NegativeActivePowerL2),
            0x003E_0400 => Some(Self::NegativeActivePowerL3),
            0x000D_0400 => Some(Self::PowerFactorTotal),
            0x0021_0400 => Some(Self::PowerFactorL1),
            0x0035_0400 => Some(Self::PowerFactorL2),
            0x0049_0400 => Some(Self::PowerFactorL3),
            _ => None,
        }
    }

    /// True for quantities derived by the calculated-value stage rather
    /// than transmitted by the meter.
    pub fn is_calculated(self) -> bool {
        matches!(
            self,
            Self::SignedActivePowerTotal
                | Self::SignedActivePowerL1
                | Self::SignedActivePowerL2
                | Self::SignedActivePowerL3
        )
    }
}

/// Inverter quantities, keyed by vendor register identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
pub enum RegisterQuantity {
    DcPowerMpp1,
    DcPowerMpp2,
    DcVoltageMpp1,
    DcVoltageMpp2,
    DcCurrentMpp1,
    DcCurrentMpp2,
    AcPowerL1,
    AcPowerL2,
    AcPowerL3,
    OperationStatus,
    GridRelayStatus,
    BatteryStateOfCharge,
    BatteryTemperature,
    BatteryAcPowerTotal,
    BatteryOperationStatus,
    BatteryRelayStatus,
}

impl RegisterQuantity {
    /// Map a vendor register identifier to its quantity; `None` for
    /// registers outside the supported set.
    pub fn from_register(id: u32) -> Option<Self> {
        match id {
            0x0025_1E01 => Some(Self::DcPowerMpp1),
            0x0025_1E02 => Some(Self::DcPowerMpp2),
            0x0045_1F01 => Some(Self::DcVoltageMpp1),
            0x0045_1F02 => Some(Self::DcVoltageMpp2),
            0x0045_2101 => Some(Self::DcCurrentMpp1),
            0x0045_2102 => Some(Self::DcCurrentMpp2),
            0x0046_4001 => Some(Self::AcPowerL1),
            0x0046_4101 => Some(Self::AcPowerL2),
            0x0046_4201 => Some(Self::AcPowerL3),
            0x0021_4801 => Some(Self::OperationStatus),
            0x0041_6401 => Some(Self::GridRelayStatus),
            0x0029_5A01 => Some(Self::BatteryStateOfCharge),
            0x0049_5B01 => Some(Self::BatteryTemperature),
            0x0026_3F01 => Some(Self::BatteryAcPowerTotal),
            0x0021_4802 => Some(Self::BatteryOperationStatus),
            0x0041_6402 => Some(Self::BatteryRelayStatus),
            _ => None,
        }
    }
}

/// One observed value with its wall-clock timestamp (unix epoch ms).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimestampedValue {
    pub value: f64,
    pub time: u64,
}

/// Bounded, insertion-ordered buffer of the most recent values of one
/// quantity. The length never exceeds the configured maximum; the oldest
/// element is evicted first.
#[derive(Debug, Clone)]
pub struct MeasurementValues {
    max_elements: usize,
    values: VecDeque<TimestampedValue>,
}

impl MeasurementValues {
    /// Create a buffer holding at most `max_elements` values (at least 1).
    pub fn new(max_elements: usize) -> Self {
        let max_elements = max_elements.max(1);
        Self {
            max_elements,
            values: VecDeque::with_capacity(max_elements),
        }
    }

    /// Record one value, evicting the oldest if the buffer is full.
    pub fn push(&mut self, value: f64, time: u64) {
        if self.values.len() == self.max_elements {
            self.values.pop_front();
        }
        self.values.push_back(TimestampedValue { value, time });
    }

    /// Most recently recorded value, if any.
    pub fn newest(&self) -> Option<TimestampedValue> {
        self.values.back().copied()
    }

    /// Arithmetic mean over the buffer's current contents.
    pub fn average(&self) -> Option<f64> {
        if self.values.is_empty() {
            return None;
        }
        let sum: f64 = self.values.iter().map(|v| v.value).sum();
        Some(sum / self.values.len() as f64)
    }

    /// Timestamp of the newest value; 0 when never updated.
    pub fn last_update(&self) -> u64 {
        self.newest().map(|v| v.time).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Configured capacity.
    pub fn max_elements(&self) -> usize {
        self.max_elements
    }
}

/// Insertion-ordered map from quantity to its value buffer.
pub type QuantityMap<Q> = IndexMap<Q, MeasurementValues>;
