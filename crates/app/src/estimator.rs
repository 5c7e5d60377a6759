//! History-backed duration estimation.
//!
//! The estimator keeps START (dispatch to start) and COMPLETE (start to
//! complete) latency samples per [`HistoryKey`]. A duration estimate is the
//! sum of the SLO quantiles of both best-fit distributions; a polling plan is
//! derived from the COMPLETE distribution.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::TimeDelta;

use rascal_domain::estimation::{PollOptions, get_best_distribution, get_polls};
use rascal_domain::event::RascEventKind;
use rascal_domain::id::EntityId;
use rascal_domain::script::ActionPayload;
use rascal_domain::time::to_delta;

use crate::ports::{HistoryKey, LatencyHistory, PollingPlan};

/// Tuning of the [`DurationEstimator`].
#[derive(Debug, Clone, PartialEq)]
pub struct EstimatorConfig {
    /// Quantile used for duration estimates, and the detection target of
    /// polling plans.
    pub slo: f64,
    /// Longest acceptable gap between completion and its detection.
    pub worst_case_delta: Duration,
    /// Samples kept per key and transition.
    pub history_limit: usize,
    /// Estimate used before any sample was observed.
    pub default_duration: Duration,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            slo: 0.95,
            worst_case_delta: Duration::from_secs(2),
            history_limit: 100,
            default_duration: Duration::from_secs(1),
        }
    }
}

/// Learns action latencies and turns them into estimates.
#[derive(Debug, Clone, Default)]
pub struct DurationEstimator {
    config: EstimatorConfig,
    histories: BTreeMap<HistoryKey, LatencyHistory>,
    dirty: bool,
}

impl DurationEstimator {
    #[must_use]
    pub fn new(config: EstimatorConfig) -> Self {
        Self {
            config,
            histories: BTreeMap::new(),
            dirty: false,
        }
    }

    /// Seed the estimator with persisted histories. Malformed keys are skipped.
    #[must_use]
    pub fn with_histories(mut self, histories: BTreeMap<String, LatencyHistory>) -> Self {
        for (key, history) in histories {
            match key.parse::<HistoryKey>() {
                Ok(parsed) => {
                    self.histories.insert(parsed, history);
                }
                Err(err) => tracing::warn!(key = %key, error = %err, "skipping malformed history key"),
            }
        }
        self
    }

    #[must_use]
    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    pub fn record(&mut self, entity_id: &EntityId, payload: &ActionPayload, kind: RascEventKind, seconds: f64) {
        if !seconds.is_finite() || seconds < 0.0 {
            return;
        }
        let limit = self.config.history_limit;
        self.histories
            .entry(HistoryKey::new(entity_id.clone(), payload))
            .or_default()
            .record(kind, seconds, limit);
        self.dirty = true;
    }

    #[must_use]
    pub fn history(&self, entity_id: &EntityId, payload: &ActionPayload) -> Option<&LatencyHistory> {
        self.histories.get(&HistoryKey::new(entity_id.clone(), payload))
    }

    /// SLO quantile of one transition, in seconds.
    fn quantile(&self, history: &LatencyHistory, kind: RascEventKind) -> Option<f64> {
        let samples = history.samples(kind);
        if samples.is_empty() {
            return None;
        }
        match get_best_distribution(samples) {
            Ok(dist) => Some(dist.quantile(self.config.slo)).filter(|q| q.is_finite() && *q >= 0.0),
            Err(err) => {
                tracing::debug!(error = %err, transition = %kind, "cannot fit latency history");
                None
            }
        }
    }

    /// Estimated time from dispatch to completion on one device.
    #[must_use]
    pub fn estimate(&self, entity_id: &EntityId, payload: &ActionPayload) -> TimeDelta {
        let default = to_delta(self.config.default_duration);
        let Some(history) = self.history(entity_id, payload) else {
            return default;
        };
        let start = self.quantile(history, RascEventKind::Start);
        let complete = self.quantile(history, RascEventKind::Complete);
        if start.is_none() && complete.is_none() {
            return default;
        }
        let total = start.unwrap_or(0.0) + complete.unwrap_or(0.0);
        Duration::try_from_secs_f64(total).map_or(default, to_delta)
    }

    /// When to poll a device that cannot push its completion.
    #[must_use]
    pub fn polling_plan(&self, entity_id: &EntityId, payload: &ActionPayload) -> PollingPlan {
        let Some(samples) = self
            .history(entity_id, payload)
            .map(|history| history.samples(RascEventKind::Complete))
            .filter(|samples| !samples.is_empty())
        else {
            return PollingPlan::FALLBACK;
        };

        let options = PollOptions {
            worst_case_delta: self.config.worst_case_delta.as_secs_f64(),
            slo: self.config.slo,
            ..PollOptions::default()
        };
        let polls = get_best_distribution(samples).and_then(|dist| get_polls(dist.as_ref(), &options));
        match polls {
            Ok(polls) => PollingPlan::Offsets(
                polls
                    .into_iter()
                    .filter_map(|secs| Duration::try_from_secs_f64(secs).ok())
                    .collect(),
            ),
            Err(err) => {
                tracing::debug!(entity_id = %entity_id, error = %err, "falling back to fixed polling");
                PollingPlan::FALLBACK
            }
        }
    }

    /// Histories in their persisted shape, if anything changed since the last call.
    pub fn take_dirty(&mut self) -> Option<BTreeMap<String, LatencyHistory>> {
        if !self.dirty {
            return None;
        }
        self.dirty = false;
        Some(self.snapshot())
    }

    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, LatencyHistory> {
        self.histories
            .iter()
            .map(|(key, history)| (key.to_string(), history.clone()))
            .collect()
    }
}
