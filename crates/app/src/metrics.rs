//! Scheduling metrics.
//!
//! Pure bookkeeping fed by the orchestrator: routine arrivals, action starts
//! and ends per device, routine ends. Every accessor tolerates an empty
//! record and answers `0.0` with a warning.
//!
//! Only the most recent retired routines are kept, so statistics describe a
//! sliding window over the routines that ran last.

use std::collections::{BTreeMap, HashMap, VecDeque};

use serde::Serialize;

use rascal_domain::id::{ActionId, EntityId, RoutineId};
use rascal_domain::time::{Timestamp, seconds};

#[derive(Debug, Clone, Default)]
struct RoutineTimes {
    arrival: Option<Timestamp>,
    start: Option<Timestamp>,
    end: Option<Timestamp>,
}

/// Retired routines kept by [`ScheduleMetrics::new`].
pub const DEFAULT_RETENTION: usize = 1_000;

/// Observed timings of routines and actions.
#[derive(Debug, Clone)]
pub struct ScheduleMetrics {
    routines: HashMap<RoutineId, RoutineTimes>,
    /// Execution windows per device, keyed by action.
    windows: BTreeMap<EntityId, BTreeMap<ActionId, (Timestamp, Option<Timestamp>)>>,
    /// Ended, aborted or dropped routines, oldest first.
    retired: VecDeque<RoutineId>,
    retention: usize,
}

impl Default for ScheduleMetrics {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }
}

/// Snapshot of every derived statistic, in seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsReport {
    pub routines: usize,
    pub avg_wait_time: f64,
    pub p95_wait_time: f64,
    pub avg_exec_time: f64,
    pub p95_exec_time: f64,
    pub avg_latency: f64,
    pub p95_latency: f64,
    pub total_idle_time: f64,
    pub avg_parallelism: f64,
    pub p05_parallelism: f64,
}

impl ScheduleMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep the records of at most `retention` retired routines.
    #[must_use]
    pub fn with_retention(retention: usize) -> Self {
        Self {
            routines: HashMap::new(),
            windows: BTreeMap::new(),
            retired: VecDeque::new(),
            retention,
        }
    }

    pub fn record_routine_arrival(&mut self, routine_id: &RoutineId, at: Timestamp) {
        self.routines.entry(routine_id.clone()).or_default().arrival = Some(at);
    }

    /// The first action start of a routine is the routine start.
    pub fn record_action_start(&mut self, action_id: &ActionId, entity_id: &EntityId, at: Timestamp) {
        let times = self.routines.entry(action_id.routine_id()).or_default();
        times.start = Some(times.start.map_or(at, |start| start.min(at)));

        self.windows
            .entry(entity_id.clone())
            .or_default()
            .entry(action_id.clone())
            .or_insert((at, None));
    }

    pub fn record_action_end(&mut self, action_id: &ActionId, entity_id: &EntityId, at: Timestamp) {
        let Some(window) = self
            .windows
            .get_mut(entity_id)
            .and_then(|windows| windows.get_mut(action_id))
        else {
            tracing::debug!(action_id = %action_id, entity_id = %entity_id, "end recorded without a start");
            return;
        };
        if window.1.is_none() {
            window.1 = Some(at);
        }
    }

    pub fn record_routine_end(&mut self, routine_id: &RoutineId, at: Timestamp) {
        self.routines.entry(routine_id.clone()).or_default().end = Some(at);
        self.retire(routine_id);
    }

    /// Mark a routine as done for good, forgetting the oldest retired
    /// routines beyond the retention.
    pub fn retire(&mut self, routine_id: &RoutineId) {
        self.retired.push_back(routine_id.clone());
        while self.retired.len() > self.retention {
            let Some(oldest) = self.retired.pop_front() else {
                break;
            };
            self.forget(&oldest);
        }
    }

    fn forget(&mut self, routine_id: &RoutineId) {
        self.routines.remove(routine_id);
        for windows in self.windows.values_mut() {
            windows.retain(|action_id, _| &action_id.routine_id() != routine_id);
        }
        self.windows.retain(|_, windows| !windows.is_empty());
        tracing::trace!(routine_id = %routine_id, "routine metrics forgotten");
    }

    fn wait_times(&self) -> Vec<f64> {
        self.routines
            .values()
            .filter_map(|times| Some(seconds(times.start? - times.arrival?)))
            .collect()
    }

    fn exec_times(&self) -> Vec<f64> {
        self.routines
            .values()
            .filter_map(|times| Some(seconds(times.end? - times.start?)))
            .collect()
    }

    fn latencies(&self) -> Vec<f64> {
        self.routines
            .values()
            .filter_map(|times| {
                times.start?;
                Some(seconds(times.end? - times.arrival?))
            })
            .collect()
    }

    #[must_use]
    pub fn avg_wait_time(&self) -> f64 {
        average("wait time", &self.wait_times())
    }

    #[must_use]
    pub fn p95_wait_time(&self) -> f64 {
        percentile("wait time", self.wait_times(), 0.95)
    }

    #[must_use]
    pub fn avg_exec_time(&self) -> f64 {
        average("execution time", &self.exec_times())
    }

    #[must_use]
    pub fn p95_exec_time(&self) -> f64 {
        percentile("execution time", self.exec_times(), 0.95)
    }

    #[must_use]
    pub fn avg_latency(&self) -> f64 {
        average("latency", &self.latencies())
    }

    #[must_use]
    pub fn p95_latency(&self) -> f64 {
        percentile("latency", self.latencies(), 0.95)
    }

    /// Sum of the gaps between consecutive finished actions on one device.
    #[must_use]
    pub fn idle_time(&self, entity_id: &EntityId) -> f64 {
        let Some(windows) = self.windows.get(entity_id) else {
            tracing::warn!(entity_id = %entity_id, "no action recorded on entity, idle time is zero");
            return 0.0;
        };
        let mut spans: Vec<(Timestamp, Timestamp)> = windows
            .values()
            .filter_map(|(start, end)| end.map(|end| (*start, end)))
            .collect();
        spans.sort();

        let mut idle = 0.0;
        let mut busy_until: Option<Timestamp> = None;
        for (start, end) in spans {
            if let Some(until) = busy_until {
                if start > until {
                    idle += seconds(start - until);
                }
            }
            busy_until = Some(busy_until.map_or(end, |until| until.max(end)));
        }
        idle
    }

    #[must_use]
    pub fn total_idle_time(&self) -> f64 {
        if self.windows.is_empty() {
            tracing::warn!("no action recorded, idle time is zero");
            return 0.0;
        }
        self.windows.keys().map(|entity_id| self.idle_time(entity_id)).sum()
    }

    /// Seconds spent at each parallelism level, between the first and last step.
    fn parallelism_histogram(&self) -> BTreeMap<i32, f64> {
        let mut steps: Vec<(Timestamp, i32)> = Vec::new();
        for (start, end) in self.windows.values().flat_map(BTreeMap::values) {
            steps.push((*start, 1));
            if let Some(end) = end {
                steps.push((*end, -1));
            }
        }
        steps.sort();

        let mut histogram = BTreeMap::new();
        let mut level = 0;
        let mut previous: Option<Timestamp> = None;
        for (at, delta) in steps {
            if let Some(previous) = previous {
                let span = seconds(at - previous);
                if span > 0.0 {
                    *histogram.entry(level).or_insert(0.0) += span;
                }
            }
            level += delta;
            previous = Some(at);
        }
        histogram
    }

    /// Time-weighted mean number of concurrently executing actions.
    #[must_use]
    pub fn avg_parallelism(&self) -> f64 {
        let histogram = self.parallelism_histogram();
        let total: f64 = histogram.values().sum();
        if total <= 0.0 {
            tracing::warn!("no parallelism recorded, average is zero");
            return 0.0;
        }
        histogram
            .iter()
            .map(|(level, span)| f64::from(*level) * span)
            .sum::<f64>()
            / total
    }

    /// Lowest level below which 5% of the recorded time was spent.
    #[must_use]
    pub fn p05_parallelism(&self) -> f64 {
        let histogram = self.parallelism_histogram();
        let total: f64 = histogram.values().sum();
        if total <= 0.0 {
            tracing::warn!("no parallelism recorded, p05 is zero");
            return 0.0;
        }
        let mut cumulative = 0.0;
        for (level, span) in &histogram {
            cumulative += span / total;
            if cumulative >= 0.05 {
                return f64::from(*level);
            }
        }
        histogram.keys().next_back().map_or(0.0, |level| f64::from(*level))
    }

    #[must_use]
    pub fn report(&self) -> MetricsReport {
        MetricsReport {
            routines: self.routines.len(),
            avg_wait_time: self.avg_wait_time(),
            p95_wait_time: self.p95_wait_time(),
            avg_exec_time: self.avg_exec_time(),
            p95_exec_time: self.p95_exec_time(),
            avg_latency: self.avg_latency(),
            p95_latency: self.p95_latency(),
            total_idle_time: self.total_idle_time(),
            avg_parallelism: self.avg_parallelism(),
            p05_parallelism: self.p05_parallelism(),
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn average(what: &str, values: &[f64]) -> f64 {
    if values.is_empty() {
        tracing::warn!(metric = what, "no sample recorded, average is zero");
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Nearest-rank percentile.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn percentile(what: &str, mut values: Vec<f64>, rank: f64) -> f64 {
    if values.is_empty() {
        tracing::warn!(metric = what, "no sample recorded, percentile is zero");
        return 0.0;
    }
    values.sort_by(f64::total_cmp);
    let position = (rank * values.len() as f64).ceil() as usize;
    values[position.clamp(1, values.len()) - 1]
}
