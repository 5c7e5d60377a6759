//! Polling plans for devices that cannot report their own progress.
//!
//! Poll offsets `L1 < L2 < ... < Lk` (seconds after dispatch) follow the
//! recurrence `Ln = Ln-1 + (F(Ln-1) - F(Ln-2)) / f(Ln-1)` with `L0 = 0`: each
//! poll is placed where the marginal detection delay it saves balances the
//! mass it captures. `L1` is bisected until `Lk` lands on the upper bound.

use std::time::Duration;

use crate::error::EstimationError;

use super::distribution::Distribution;

/// Quantile used as the upper bound when none is given.
pub const DEFAULT_UPPER_QUANTILE: f64 = 0.99;

/// Largest number of polls a plan may contain.
pub const MAX_POLLS: usize = 256;

const BISECTION_ROUNDS: usize = 200;

/// Parameters of [`get_polls`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollOptions {
    /// Offset of the final poll; defaults to the 99th percentile.
    pub upper_bound: Option<f64>,
    /// Longest acceptable gap between completion and detection, in seconds.
    pub worst_case_delta: f64,
    /// Probability mass that must be detected within `worst_case_delta`.
    pub slo: f64,
    /// Exact number of polls; searched for when `None`.
    pub polls: Option<usize>,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            upper_bound: None,
            worst_case_delta: 2.0,
            slo: 0.95,
            polls: None,
        }
    }
}

/// Ascending poll offsets, in seconds, ending at the upper bound.
///
/// # Errors
///
/// Returns [`EstimationError::InvalidParameter`] for a non-positive bound,
/// delta or poll count, or an SLO outside `(0, 1]`, and
/// [`EstimationError::NoSuchSchedule`] when no plan satisfies the request.
/// Callers fall back to polling every second on either.
pub fn get_polls(dist: &dyn Distribution, options: &PollOptions) -> Result<Vec<f64>, EstimationError> {
    let upper_bound = options
        .upper_bound
        .unwrap_or_else(|| dist.quantile(DEFAULT_UPPER_QUANTILE));
    if !upper_bound.is_finite() || upper_bound <= 0.0 {
        return Err(EstimationError::InvalidParameter("upper_bound"));
    }
    if !options.worst_case_delta.is_finite() || options.worst_case_delta <= 0.0 {
        return Err(EstimationError::InvalidParameter("worst_case_delta"));
    }
    if options.slo.is_nan() || options.slo <= 0.0 || options.slo > 1.0 {
        return Err(EstimationError::InvalidParameter("slo"));
    }

    if let Some(count) = options.polls {
        if count == 0 {
            return Err(EstimationError::InvalidParameter("polls"));
        }
        return polls_for(dist, upper_bound, count);
    }

    // smallest count meeting the SLO
    let mut low = 1;
    let mut high = MAX_POLLS;
    let mut found = None;
    while low <= high {
        let middle = low + (high - low) / 2;
        match polls_for(dist, upper_bound, middle) {
            Ok(polls) if captured_mass(dist, &polls, options.worst_case_delta) >= options.slo => {
                found = Some(polls);
                high = middle - 1;
            }
            _ => low = middle + 1,
        }
    }
    found.ok_or_else(|| no_such_schedule(MAX_POLLS, upper_bound))
}

/// Probability that a completion is detected within `delta` of happening.
#[must_use]
pub fn captured_mass(dist: &dyn Distribution, polls: &[f64], delta: f64) -> f64 {
    let mut previous: f64 = 0.0;
    let mut mass = 0.0;
    for &poll in polls {
        let from = previous.max(poll - delta);
        mass += (dist.cdf(poll) - dist.cdf(from)).max(0.0);
        previous = poll;
    }
    mass
}

fn no_such_schedule(polls: usize, upper_bound: f64) -> EstimationError {
    EstimationError::NoSuchSchedule {
        polls,
        upper_bound: Duration::try_from_secs_f64(upper_bound).unwrap_or_default(),
    }
}

fn polls_for(dist: &dyn Distribution, upper_bound: f64, count: usize) -> Result<Vec<f64>, EstimationError> {
    if count == 1 {
        return Ok(vec![upper_bound]);
    }

    let tolerance = upper_bound * 1e-9;
    // below the support the recurrence stalls, which reads as overshooting
    let mut left = dist.quantile(f64::EPSILON).clamp(0.0, upper_bound);
    let mut right = upper_bound;
    for _ in 0..BISECTION_ROUNDS {
        let first = 0.5 * (left + right);
        if first <= left || first >= right {
            break;
        }
        match propagate(dist, first, count) {
            Some(polls) if (polls[count - 1] - upper_bound).abs() <= tolerance => {
                return finish(polls, upper_bound, count);
            }
            Some(polls) if polls[count - 1] < upper_bound => left = first,
            _ => right = first,
        }
    }

    // close enough once the bracket collapsed on a valid sequence
    match propagate(dist, left, count) {
        Some(polls) if left > 0.0 && (polls[count - 1] - upper_bound).abs() <= upper_bound * 1e-3 => {
            finish(polls, upper_bound, count)
        }
        _ => Err(no_such_schedule(count, upper_bound)),
    }
}

/// Run the recurrence from `first`; `None` once it stalls or leaves the support.
fn propagate(dist: &dyn Distribution, first: f64, count: usize) -> Option<Vec<f64>> {
    let mut polls = Vec::with_capacity(count);
    polls.push(first);
    let mut before = 0.0;
    let mut last = first;
    while polls.len() < count {
        let density = dist.pdf(last);
        if !density.is_finite() || density <= 0.0 {
            return None;
        }
        let next = last + (dist.cdf(last) - dist.cdf(before)) / density;
        if !next.is_finite() || next <= last {
            return None;
        }
        polls.push(next);
        before = last;
        last = next;
    }
    Some(polls)
}

fn finish(mut polls: Vec<f64>, upper_bound: f64, count: usize) -> Result<Vec<f64>, EstimationError> {
    polls[count - 1] = upper_bound;
    if polls.windows(2).all(|pair| pair[0] < pair[1]) {
        Ok(polls)
    } else {
        Err(no_such_schedule(count, upper_bound))
    }
}
