//! Derived metrics computed from decoded values.
//!
//! Each metric declares the logical names it reads, never raw registers. The
//! engine recomputes a metric when any declared input's timestamp advances;
//! an undefined result (zero denominator, invalid or absent input) marks the
//! metric invalid instead of failing. Inputs that stop refreshing leave the
//! metric untouched, so its own timestamp ages along with them.

use std::collections::BTreeMap;

use crate::value::{DecodedValue, Instant, Value};

/// Read-only view of the state map offered to metric computations.
pub struct InputView<'a> {
    state: &'a BTreeMap<&'static str, DecodedValue>,
}

impl<'a> InputView<'a> {
    pub fn new(state: &'a BTreeMap<&'static str, DecodedValue>) -> Self {
        Self { state }
    }

    /// Numeric value of a valid entry, `None` if absent or invalid.
    pub fn number(&self, name: &str) -> Option<f64> {
        self.state
            .get(name)
            .filter(|d| d.valid)
            .and_then(|d| d.value.as_number())
    }
}

pub struct DerivedMetric {
    pub name: &'static str,
    pub unit: &'static str,
    pub inputs: &'static [&'static str],
    pub compute: fn(&InputView<'_>) -> Option<f64>,
}

pub static DERIVED_METRICS: &[DerivedMetric] = &[
    DerivedMetric {
        name: "round_trip_efficiency",
        unit: "%",
        inputs: &["total_charged_energy", "total_discharged_energy"],
        compute: round_trip_efficiency,
    },
    DerivedMetric {
        name: "monthly_round_trip_efficiency",
        unit: "%",
        inputs: &["monthly_charged_energy", "monthly_discharged_energy"],
        compute: monthly_round_trip_efficiency,
    },
    DerivedMetric {
        name: "stored_energy",
        unit: "kWh",
        inputs: &["rated_capacity", "soc"],
        compute: stored_energy,
    },
    DerivedMetric {
        name: "conversion_efficiency",
        unit: "%",
        inputs: &["total_ac_output_energy", "total_discharged_energy"],
        compute: conversion_efficiency,
    },
];

/// Percentage ratio, undefined on a zero denominator.
fn percent_ratio(view: &InputView<'_>, numerator: &str, denominator: &str) -> Option<f64> {
    let den = view.number(denominator)?;
    let num = view.number(numerator)?;
    if den == 0.0 {
        return None;
    }
    Some(num / den * 100.0)
}

fn round_trip_efficiency(view: &InputView<'_>) -> Option<f64> {
    percent_ratio(view, "total_discharged_energy", "total_charged_energy")
}

fn monthly_round_trip_efficiency(view: &InputView<'_>) -> Option<f64> {
    percent_ratio(view, "monthly_discharged_energy", "monthly_charged_energy")
}

fn conversion_efficiency(view: &InputView<'_>) -> Option<f64> {
    percent_ratio(view, "total_ac_output_energy", "total_discharged_energy")
}

fn stored_energy(view: &InputView<'_>) -> Option<f64> {
    let capacity = view.number("rated_capacity")?;
    let soc = view.number("soc")?;
    Some(capacity * soc / 100.0)
}

/// Tracks input timestamps per metric and republishes results into the state
/// map. Single writer: only the coordinator invokes this, after each decode
/// batch.
pub struct MetricEngine {
    last_inputs: Vec<Vec<Option<Instant>>>,
}

impl MetricEngine {
    pub fn new() -> Self {
        Self {
            last_inputs: DERIVED_METRICS
                .iter()
                .map(|m| vec![None; m.inputs.len()])
                .collect(),
        }
    }

    /// Recompute every metric whose input timestamps moved since the last
    /// call. Returns the names that were republished.
    pub fn recompute(
        &mut self,
        state: &mut BTreeMap<&'static str, DecodedValue>,
        now: Instant,
    ) -> Vec<&'static str> {
        let mut updated = Vec::new();
        for (i, metric) in DERIVED_METRICS.iter().enumerate() {
            let stamps: Vec<Option<Instant>> = metric
                .inputs
                .iter()
                .map(|n| state.get(n).and_then(|d| d.timestamp))
                .collect();
            if stamps == self.last_inputs[i] {
                continue;
            }
            self.last_inputs[i] = stamps;

            let result = {
                let view = InputView::new(state);
                (metric.compute)(&view)
            };
            match result {
                Some(v) => {
                    state.insert(metric.name, DecodedValue::fresh(Value::Number(v), now));
                }
                None => {
                    // Keep the previous value visible but flag it undefined.
                    let entry = state.entry(metric.name).or_insert_with(DecodedValue::missing);
                    entry.valid = false;
                }
            }
            updated.push(metric.name);
        }
        updated
    }
}

impl Default for MetricEngine {
    fn default() -> Self {
        Self::new()
    }
}
