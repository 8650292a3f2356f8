//! Arrival arithmetic of the open-model scaling strategies.
//!
//! A rate strategy is described by a `start_rate` and an `end_rate` (sessions per
//! second) over a phase `duration`. The instantaneous rate `r(t)` is the linear
//! interpolation between the two:
//!
//! ```text
//! t = elapsed / duration
//! r(t) = start_rate + (end_rate - start_rate) * t
//! ```
//!
//! The scheduler never keeps a running sum of per-tick quotas. Instead it compares
//! how many sessions it has accounted for (started or blocked) with the integral of
//! `r` up to now:
//!
//! ```text
//! n(e) = floor(start_rate * e + (end_rate - start_rate) * e^2 / (2 * duration))
//! ```
//!
//! and issues the difference. Rounding therefore never accumulates: at any tick the
//! issued count is within one session of the exact curve, and at the end of the
//! phase it is exactly `n(duration)`. Tick jitter only delays sessions, it never
//! changes how many there are.

use std::time::Duration;

/// Upper bound of any count returned here, to stay clear of overflow in callers
/// that add counts together.
pub const MAX_SESSIONS: u64 = u64::MAX >> 3;

/// Instantaneous rate after `elapsed`. Past the end of the phase the rate stays at
/// `end_rate`.
pub fn rate_at(elapsed: Duration, duration: Duration, start_rate: f64, end_rate: f64) -> f64 {
    if duration.is_zero() {
        return end_rate;
    }
    // Interpolation factor [0.0..1.0]
    let t = (elapsed.as_secs_f64() / duration.as_secs_f64()).min(1.0);
    start_rate + (end_rate - start_rate) * t
}

/// Number of sessions the arrival curve has produced after `elapsed`.
///
/// Time past `duration` adds nothing: the phase stops issuing when it ends.
pub fn nominal_count(
    elapsed: Duration,
    duration: Duration,
    start_rate: f64,
    end_rate: f64,
) -> u64 {
    if duration.is_zero() {
        return 0;
    }
    let d = duration.as_secs_f64();
    let e = elapsed.as_secs_f64().min(d);
    let n = (start_rate * e + (end_rate - start_rate) * e * e / (2.0 * d)).floor();

    // Saturate instead of wrapping on absurd rates
    if n.is_nan() || n < 0.0 {
        0
    } else if n >= MAX_SESSIONS as f64 {
        MAX_SESSIONS
    } else {
        n as u64
    }
}

/// Sessions to issue now, given that `accounted` were already started or blocked.
pub fn due(
    elapsed: Duration,
    duration: Duration,
    start_rate: f64,
    end_rate: f64,
    accounted: u64,
) -> u64 {
    nominal_count(elapsed, duration, start_rate, end_rate).saturating_sub(accounted)
}
