use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::error::EphysError;

/// Junction potential measured at 32 C; subtracted from voltage traces when
/// they are displayed, never from stored statistics.
pub const JUNCTION_POTENTIAL_MV: f64 = 11.6;

/// Canonical unit symbols for the two recorded dimensions.
pub const VOLTAGE_UNIT: &str = "mV";
pub const CURRENT_UNIT: &str = "pA";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dimension {
    Voltage,
    Current,
}

static VOLTAGE_SCALES: Lazy<BTreeMap<&'static str, f64>> = Lazy::new(|| {
    BTreeMap::from([("V", 1e3), ("mV", 1.0), ("uV", 1e-3), ("µV", 1e-3)])
});

static CURRENT_SCALES: Lazy<BTreeMap<&'static str, f64>> = Lazy::new(|| {
    BTreeMap::from([
        ("A", 1e12),
        ("mA", 1e9),
        ("uA", 1e6),
        ("µA", 1e6),
        ("nA", 1e3),
        ("pA", 1.0),
    ])
});

/// Scale factor taking a sample in `unit` to the canonical unit for its
/// dimension (mV for voltage, pA for current). A unit that is not in the
/// table means the channel is not what a current-clamp recording needs,
/// which is fatal for the calling tool.
pub fn scale_to_canonical(dimension: Dimension, unit: &str) -> Result<f64, EphysError> {
    let table = match dimension {
        Dimension::Voltage => &*VOLTAGE_SCALES,
        Dimension::Current => &*CURRENT_SCALES,
    };
    table.get(unit).copied().ok_or_else(|| match dimension {
        Dimension::Voltage => EphysError::NotVoltage(unit.to_string()),
        Dimension::Current => EphysError::NotCurrent(unit.to_string()),
    })
}

/// A physical value bound for JSON output. Quantities are serialized as
/// plain numbers after unit normalization; the owning document records the
/// unit of each field in its unit table.
#[derive(Clone, Debug, PartialEq)]
pub enum Quantity {
    Scalar(f64),
    Array(Vec<f64>),
}

impl Quantity {
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Quantity::Scalar(v) => Some(*v),
            Quantity::Array(_) => None,
        }
    }

    pub fn as_slice(&self) -> &[f64] {
        match self {
            Quantity::Scalar(v) => std::slice::from_ref(v),
            Quantity::Array(v) => v.as_slice(),
        }
    }
}

impl Serialize for Quantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Quantity::Scalar(v) => serializer.serialize_f64(*v),
            Quantity::Array(v) => v.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Scalar(f64),
            Array(Vec<f64>),
        }
        Ok(match Raw::deserialize(deserializer)? {
            Raw::Scalar(v) => Quantity::Scalar(v),
            Raw::Array(v) => Quantity::Array(v),
        })
    }
}

/// Resistance in MΩ from a voltage drop in mV over a current drop in pA.
pub fn megaohms(delta_v_mv: f64, delta_i_pa: f64) -> f64 {
    delta_v_mv / delta_i_pa * 1e3
}

/// Capacitance in pF from a time constant in ms over a resistance in MΩ.
pub fn picofarads(tau_ms: f64, r_mohm: f64) -> f64 {
    tau_ms / r_mohm * 1e3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn voltage_units_normalize_to_millivolts() {
        assert_eq!(scale_to_canonical(Dimension::Voltage, "V").unwrap(), 1e3);
        assert_eq!(scale_to_canonical(Dimension::Voltage, "mV").unwrap(), 1.0);
        assert!(matches!(
            scale_to_canonical(Dimension::Voltage, "pA"),
            Err(EphysError::NotVoltage(_))
        ));
    }

    #[test]
    fn current_units_normalize_to_picoamps() {
        assert_eq!(scale_to_canonical(Dimension::Current, "nA").unwrap(), 1e3);
        assert!(matches!(
            scale_to_canonical(Dimension::Current, "mV"),
            Err(EphysError::NotCurrent(_))
        ));
    }

    #[test]
    fn quantities_serialize_as_plain_numbers() {
        let scalar = serde_json::to_string(&Quantity::Scalar(-62.5)).unwrap();
        assert_eq!(scalar, "-62.5");
        let array = serde_json::to_string(&Quantity::Array(vec![1.0, 2.0])).unwrap();
        assert_eq!(array, "[1.0,2.0]");
        let back: Quantity = serde_json::from_str(&array).unwrap();
        assert_eq!(back, Quantity::Array(vec![1.0, 2.0]));
    }

    #[test]
    fn derived_unit_helpers() {
        // 10 mV drop over 50 pA is 200 MOhm
        assert!((megaohms(10.0, 50.0) - 200.0).abs() < 1e-12);
        // 20 ms over 200 MOhm is 100 pF
        assert!((picofarads(20.0, 200.0) - 100.0).abs() < 1e-12);
    }
}
