//! Unit-correction hooks applied by the aggregators.
//!
//! The plant constants (air factor, impulses per rotation) are the defaults;
//! installations with different hardware swap in their own functions.

use std::fmt;
use std::sync::Arc;

pub const DEFAULT_AIR_FACTOR: f64 = 1.0;
pub const DEFAULT_IMPULSES_PER_ROTATION: u32 = 8;

pub type ConversionFn = Arc<dyn Fn(f64) -> f64 + Send + Sync>;

#[derive(Clone)]
pub struct Conversions {
    /// Applied to every flow reading before totals are computed.
    pub flow: ConversionFn,
    /// Raw impulse count → rotations.
    pub impulses_to_rotations: ConversionFn,
}

impl Conversions {
    pub fn with_constants(air_factor: f64, impulses_per_rotation: u32) -> Self {
        let per_rotation = f64::from(impulses_per_rotation.max(1));
        Self {
            flow: Arc::new(move |value| value * air_factor),
            impulses_to_rotations: Arc::new(move |impulses| impulses / per_rotation),
        }
    }

    pub fn flow(&self, value: f64) -> f64 {
        (self.flow)(value)
    }

    pub fn rotations(&self, impulses: u64) -> f64 {
        (self.impulses_to_rotations)(impulses as f64)
    }
}

impl Default for Conversions {
    fn default() -> Self {
        Self::with_constants(DEFAULT_AIR_FACTOR, DEFAULT_IMPULSES_PER_ROTATION)
    }
}

impl fmt::Debug for Conversions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conversions").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_flow_through_and_divide_impulses() {
        let conv = Conversions::default();
        assert_eq!(conv.flow(12.5), 12.5);
        assert_eq!(conv.rotations(16), 2.0);
        assert_eq!(conv.rotations(4), 0.5);
    }

    #[test]
    fn custom_hooks_replace_constants() {
        let conv = Conversions {
            flow: Arc::new(|value| value * 0.5),
            impulses_to_rotations: Arc::new(|impulses| impulses / 4.0),
        };
        assert_eq!(conv.flow(10.0), 5.0);
        assert_eq!(conv.rotations(8), 2.0);
    }
}
