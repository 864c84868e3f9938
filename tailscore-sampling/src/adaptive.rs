//! Adaptive threshold control for model policies.
//!
//! The controller keeps the scores of recent traces and periodically moves the sampling
//! threshold to the score quantile that retains the desired share of traffic. The desired share
//! follows either a fixed keep ratio or a target number of traces per second divided by the
//! measured incoming rate. While the share of erroring or slow traces in the current window is
//! high, a larger incident keep ratio is applied instead.

use std::convert::Infallible;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tailscore_statsd::metric;

use crate::config::AdaptiveConfig;
use crate::evaluation::{Decision, PolicyEvaluator, record_decision, score_trace};
use crate::model::LinearModel;
use crate::statsd::{SamplingCounters, SamplingGauges, SamplingTimers};
use crate::trace::{TraceData, TraceId};

/// A fixed-capacity buffer holding the most recent scores.
#[derive(Clone, Debug)]
pub struct ScoreBuffer {
    scores: Vec<f64>,
    capacity: usize,
    next: usize,
    filled: bool,
}

impl ScoreBuffer {
    /// Creates an empty buffer. A capacity of `0` discards all scores.
    pub fn new(capacity: usize) -> Self {
        Self {
            scores: Vec::with_capacity(capacity),
            capacity,
            next: 0,
            filled: false,
        }
    }

    /// Adds a score, overwriting the oldest one once the buffer is full.
    pub fn push(&mut self, score: f64) {
        if self.capacity == 0 {
            return;
        }

        if self.scores.len() < self.capacity {
            self.scores.push(score);
            return;
        }

        self.scores[self.next] = score;
        self.next += 1;
        if self.next >= self.capacity {
            self.next = 0;
            self.filled = true;
        }
    }

    /// Returns the buffered scores in storage order.
    pub fn as_slice(&self) -> &[f64] {
        &self.scores
    }

    /// Returns the number of buffered scores.
    pub fn len(&self) -> usize {
        self.scores.len()
    }

    /// Returns `true` if no score has been buffered.
    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Returns `true` once every slot has been overwritten at least once.
    pub fn is_filled(&self) -> bool {
        self.filled
    }
}

/// Returns the `q`-quantile of a sample, or `None` if the sample is empty.
///
/// `q <= 0` yields the minimum and `q >= 1` the maximum. Otherwise, the value at index
/// `ceil(q * (n - 1))` of the sorted sample is returned.
pub fn quantile(sample: &[f64], q: f64) -> Option<f64> {
    if sample.is_empty() {
        return None;
    }

    if q <= 0.0 {
        return sample.iter().copied().reduce(f64::min);
    }
    if q >= 1.0 {
        return sample.iter().copied().reduce(f64::max);
    }

    let mut sorted = sample.to_vec();
    sorted.sort_by(f64::total_cmp);

    let position = q * (sorted.len() - 1) as f64;
    let index = (position.ceil() as usize).min(sorted.len() - 1);
    Some(sorted[index])
}

fn clamp01(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

/// A point-in-time view of a controller's state.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ControllerSnapshot {
    /// The threshold applied to the next trace.
    pub threshold: f64,
    /// The keep ratio chosen by the last recomputation, `1` before the first.
    pub keep_ratio: f64,
    /// Traces counted in the current window.
    pub window_trace_count: u64,
    /// Errors and SLA violations counted in the current window.
    pub window_violation_count: u64,
    /// Number of buffered scores.
    pub buffered_scores: usize,
}

#[derive(Debug)]
struct ControllerState {
    scores: ScoreBuffer,
    window_start: Option<Instant>,
    window_trace_count: u64,
    window_violation_count: u64,
    last_recompute: Option<Instant>,
    threshold: f64,
    keep_ratio: f64,
    first_recompute_logged: bool,
}

/// The outcome of a threshold recomputation.
#[derive(Debug)]
struct Recomputed {
    keep_ratio: f64,
    incident: bool,
}

/// Samples traces with a linear model and a threshold adapted to the observed traffic.
///
/// The controller state is guarded by a single mutex that is never held while the trace's own
/// lock is taken.
#[derive(Debug)]
pub struct AdaptiveModelSampler {
    model: LinearModel,
    fallback_threshold: f64,
    config: AdaptiveConfig,
    state: Mutex<ControllerState>,
}

impl AdaptiveModelSampler {
    /// Creates a sampler with fresh controller state.
    ///
    /// `fallback_threshold` is used until the first recomputation and whenever no scores are
    /// buffered.
    pub fn new(model: LinearModel, fallback_threshold: f64, config: &AdaptiveConfig) -> Self {
        let mut config = config.clone();
        if config.max_keep_ratio == 0.0 {
            config.max_keep_ratio = 1.0;
        }

        tailscore_log::info!(
            fallback_threshold,
            window_duration = ?config.window_duration,
            recompute_interval = ?config.recompute_interval,
            max_samples = config.max_samples,
            target_traces_per_sec = config.target_traces_per_sec,
            keep_ratio = config.keep_ratio,
            min_keep_ratio = config.min_keep_ratio,
            max_keep_ratio = config.max_keep_ratio,
            always_keep_errors = config.always_keep_errors,
            "adaptive model sampler initialized"
        );

        let state = ControllerState {
            scores: ScoreBuffer::new(config.max_samples),
            window_start: None,
            window_trace_count: 0,
            window_violation_count: 0,
            last_recompute: None,
            threshold: fallback_threshold,
            keep_ratio: 1.0,
            first_recompute_logged: false,
        };

        Self {
            model,
            fallback_threshold,
            config,
            state: Mutex::new(state),
        }
    }

    /// Returns the current controller state.
    pub fn snapshot(&self) -> ControllerSnapshot {
        let state = self.state.lock();
        ControllerSnapshot {
            threshold: state.threshold,
            keep_ratio: state.keep_ratio,
            window_trace_count: state.window_trace_count,
            window_violation_count: state.window_violation_count,
            buffered_scores: state.scores.len(),
        }
    }

    /// Evaluates a trace at the current time.
    pub fn decide(&self, trace_id: TraceId, trace: &TraceData) -> Decision {
        self.evaluate_at(Instant::now(), trace_id, trace)
    }

    /// Evaluates a trace observed at `now`.
    ///
    /// Updates the window statistics and score buffer, and recomputes the threshold if the
    /// recompute interval has passed.
    pub fn evaluate_at(&self, now: Instant, trace_id: TraceId, trace: &TraceData) -> Decision {
        let (features, score) = score_trace(&self.model, trace_id, trace);
        let Some(score) = score else {
            return record_decision("adaptive", Decision::NotSampled);
        };

        let has_error = features.has_error();
        let is_violation = has_error
            || (self.config.sla_duration_ms > 0.0
                && features.duration_ms >= self.config.sla_duration_ms);

        let (threshold, recomputed) = {
            let mut state = self.state.lock();

            let window_start = state.window_start;
            match window_start {
                None => state.window_start = Some(now),
                Some(start)
                    if !self.config.window_duration.is_zero()
                        && now.saturating_duration_since(start)
                            >= self.config.window_duration =>
                {
                    state.window_start = Some(now);
                    state.window_trace_count = 0;
                    state.window_violation_count = 0;
                }
                Some(_) => {}
            }

            state.window_trace_count += 1;
            if is_violation {
                state.window_violation_count += 1;
            }
            state.scores.push(score);

            let due = match state.last_recompute {
                None => true,
                Some(last) => {
                    now.saturating_duration_since(last) >= self.config.recompute_interval
                }
            };

            let recomputed = due.then(|| {
                metric!(timer(SamplingTimers::Recompute), {
                    self.recompute(&mut state, now)
                })
            });

            (state.threshold, recomputed)
        };

        if let Some(recomputed) = recomputed {
            metric!(gauge(SamplingGauges::KeepRatio) = recomputed.keep_ratio);
            if recomputed.incident {
                metric!(counter(SamplingCounters::Incident) += 1);
            }
        }

        let decision = if (self.config.always_keep_errors && has_error) || score >= threshold {
            Decision::Sampled
        } else {
            Decision::NotSampled
        };

        record_decision("adaptive", decision)
    }

    /// Returns the keep ratio derived from the rate target or the fixed keep ratio.
    fn target_keep_ratio(&self, incoming_rate: f64) -> f64 {
        if self.config.target_traces_per_sec > 0.0 {
            if incoming_rate <= 0.0 {
                return 1.0;
            }
            return self.config.target_traces_per_sec / incoming_rate;
        }

        if self.config.keep_ratio > 0.0 {
            return self.config.keep_ratio;
        }

        1.0
    }

    fn recompute(&self, state: &mut ControllerState, now: Instant) -> Recomputed {
        let config = &self.config;

        let elapsed = match state.window_start {
            Some(start) => now.saturating_duration_since(start),
            None => Duration::ZERO,
        }
        .max(Duration::from_millis(1));

        let incoming_rate = state.window_trace_count as f64 / elapsed.as_secs_f64();
        let base_keep_ratio = self.target_keep_ratio(incoming_rate);
        let mut keep_ratio = base_keep_ratio;

        let mut incident = false;
        let mut incident_boosted = false;
        if config.incident_keep_ratio > 0.0 {
            let violation_rate = match state.window_trace_count {
                0 => 0.0,
                count => state.window_violation_count as f64 / count as f64,
            };

            incident = if config.violation_rate_threshold <= 0.0 {
                state.window_violation_count > 0
            } else {
                violation_rate >= config.violation_rate_threshold
            };

            if incident && config.incident_keep_ratio > keep_ratio {
                keep_ratio = config.incident_keep_ratio;
                incident_boosted = true;
            }
        }

        keep_ratio = clamp01(keep_ratio);
        if config.min_keep_ratio > 0.0 {
            keep_ratio = keep_ratio.max(config.min_keep_ratio);
        }
        if config.max_keep_ratio > 0.0 {
            keep_ratio = keep_ratio.min(config.max_keep_ratio);
        }

        let threshold = if keep_ratio >= 1.0 {
            f64::NEG_INFINITY
        } else if keep_ratio <= 0.0 {
            f64::INFINITY
        } else {
            quantile(state.scores.as_slice(), 1.0 - keep_ratio).unwrap_or(self.fallback_threshold)
        };

        state.threshold = threshold;
        state.keep_ratio = keep_ratio;
        state.last_recompute = Some(now);

        if !state.first_recompute_logged {
            state.first_recompute_logged = true;
            tailscore_log::info!(
                incoming_rate,
                window_trace_count = state.window_trace_count,
                window_violation_count = state.window_violation_count,
                target_traces_per_sec = config.target_traces_per_sec,
                base_keep_ratio,
                keep_ratio,
                incident_boosted,
                threshold,
                scores_len = state.scores.len(),
                window_elapsed = ?elapsed,
                "adaptive model sampler first recompute"
            );
        }

        tailscore_log::debug!(
            incoming_rate,
            window_trace_count = state.window_trace_count,
            window_violation_count = state.window_violation_count,
            target_traces_per_sec = config.target_traces_per_sec,
            base_keep_ratio,
            keep_ratio,
            incident_boosted,
            threshold,
            scores_len = state.scores.len(),
            window_elapsed = ?elapsed,
            "adaptive model sampler recompute"
        );

        Recomputed {
            keep_ratio,
            incident,
        }
    }
}

impl PolicyEvaluator for AdaptiveModelSampler {
    type Error = Infallible;

    fn evaluate(&self, trace_id: TraceId, trace: &TraceData) -> Result<Decision, Self::Error> {
        Ok(self.decide(trace_id, trace))
    }
}
