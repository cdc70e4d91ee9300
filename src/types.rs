//! Core type definitions for the co-simulation runtime.
//!
//! All components share one representation of simulated time and one set of
//! identifier types, so that values can flow between the model layer, the
//! control protocol, and the data bus without conversion.

/// A point on the simulated time axis, in seconds.
pub type TimePoint = f64;

/// A duration on the simulated time axis, in seconds.
///
/// If `t1` and `t2` are [`TimePoint`]s, then `t2 - t1` is a `TimeDuration`,
/// and `t1 + dt` is again a `TimePoint`.
pub type TimeDuration = f64;

/// A special [`TimePoint`] that lies infinitely far in the future.
pub const ETERNITY: TimePoint = f64::INFINITY;

/// Identifies a slave within one execution.
///
/// Assigned by the master when the slave is added; also used in the 4-byte
/// header of published variable frames.
pub type SlaveId = u16;

/// Identifies a variable within one slave type.
pub type VariableId = u32;

/// Identifies a time step within one execution.
///
/// Step IDs increase monotonically from zero.
pub type StepId = i32;

/// The step ID used before the first step has been performed.
pub const INVALID_STEP_ID: StepId = -1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eternity_is_later_than_everything() {
        let t: TimePoint = 1.0e300;
        assert!(t < ETERNITY);
        assert!(ETERNITY > 0.0);
    }

    #[test]
    fn test_time_arithmetic() {
        let t: TimePoint = 1.5;
        let dt: TimeDuration = 0.1;
        assert!((t + dt - 1.6).abs() < 1e-12);
    }

    #[test]
    fn test_invalid_step_id() {
        assert!(INVALID_STEP_ID < 0);
    }
}
