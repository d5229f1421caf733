//! Product dimension → target cycle rate lookup.
//!
//! The table is an ordered list of length bands. `classify` scans it linearly
//! in ascending `max_length` order and returns the first rule whose bounds
//! dominate the product; the final rule is the catch-all ceiling.

use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CYCLE_LPM: f64 = 14.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CycleRule {
    pub max_length: u32,
    pub max_width: u32,
    pub cycle_lpm: f64,
}

impl CycleRule {
    pub const fn new(max_length: u32, max_width: u32, cycle_lpm: f64) -> Self {
        Self {
            max_length,
            max_width,
            cycle_lpm,
        }
    }

    fn matches(&self, length: f64, width: f64) -> bool {
        length <= f64::from(self.max_length) && width <= f64::from(self.max_width)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Classification {
    pub cycle_lpm: f64,
    pub rule_index: Option<usize>,
    pub fallback: bool,
}

impl Classification {
    pub fn fallback(default_lpm: f64) -> Self {
        Self {
            cycle_lpm: default_lpm,
            rule_index: None,
            fallback: true,
        }
    }

    /// Ideal seconds per cycle at this rate.
    pub fn ideal_cycle_seconds(&self) -> f64 {
        if self.cycle_lpm > 0.0 {
            60.0 / self.cycle_lpm
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone)]
pub struct CycleTable {
    rules: Vec<CycleRule>,
    default_lpm: f64,
}

impl CycleTable {
    pub fn new(rules: Vec<CycleRule>, default_lpm: f64) -> EngineResult<Self> {
        if rules.is_empty() {
            return Err(EngineError::InvalidCycleTable(
                "table must contain at least one rule".to_string(),
            ));
        }
        for pair in rules.windows(2) {
            if pair[1].max_length <= pair[0].max_length {
                return Err(EngineError::InvalidCycleTable(format!(
                    "max_length must be strictly ascending ({} then {})",
                    pair[0].max_length, pair[1].max_length
                )));
            }
        }
        if let Some(rule) = rules
            .iter()
            .find(|rule| !rule.cycle_lpm.is_finite() || rule.cycle_lpm <= 0.0)
        {
            return Err(EngineError::InvalidCycleTable(format!(
                "cycle rate for max_length {} must be positive",
                rule.max_length
            )));
        }
        if !default_lpm.is_finite() || default_lpm <= 0.0 {
            return Err(EngineError::InvalidCycleTable(
                "default cycle rate must be positive".to_string(),
            ));
        }
        Ok(Self { rules, default_lpm })
    }

    pub fn rules(&self) -> &[CycleRule] {
        &self.rules
    }

    pub fn default_lpm(&self) -> f64 {
        self.default_lpm
    }

    pub fn classify(&self, length: f64, width: f64) -> Classification {
        for (index, rule) in self.rules.iter().enumerate() {
            if rule.matches(length, width) {
                return Classification {
                    cycle_lpm: rule.cycle_lpm,
                    rule_index: Some(index),
                    fallback: false,
                };
            }
        }
        tracing::debug!(length, width, "no cycle rule matched; using default rate");
        Classification::fallback(self.default_lpm)
    }

    /// Classifies optional dimensions, falling back when they are unavailable.
    pub fn classify_dimensions(&self, dimensions: Option<(f64, f64)>) -> Classification {
        match dimensions {
            Some((length, width)) if length.is_finite() && width.is_finite() => {
                self.classify(length, width)
            }
            _ => Classification::fallback(self.default_lpm),
        }
    }
}

impl Default for CycleTable {
    fn default() -> Self {
        Self {
            rules: vec![
                CycleRule::new(600, 9999, 15.0),
                CycleRule::new(800, 9999, 12.875),
                CycleRule::new(1200, 9999, 12.0),
                CycleRule::new(99999, 9999, 7.06),
            ],
            default_lpm: DEFAULT_CYCLE_LPM,
        }
    }
}
