//! Evaluation of model policies against buffered traces.

use std::convert::Infallible;
use std::fmt;

use tailscore_statsd::metric;

use crate::adaptive::AdaptiveModelSampler;
use crate::config::{ModelConfig, ModelConfigError};
use crate::features::FeatureVector;
use crate::model::LinearModel;
use crate::statsd::SamplingCounters;
use crate::trace::{TraceData, TraceId};

/// The outcome of evaluating a policy for a trace.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Decision {
    /// The trace is retained.
    Sampled,
    /// The trace is dropped by this policy.
    NotSampled,
}

impl Decision {
    /// Returns `true` if the trace is retained.
    pub fn is_sampled(self) -> bool {
        self == Self::Sampled
    }

    /// Returns the name of this decision as used in metric tags.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sampled => "sampled",
            Self::NotSampled => "not_sampled",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A policy that decides whether to retain a completed trace.
pub trait PolicyEvaluator {
    /// The error returned when a policy cannot reach a decision.
    type Error: std::error::Error;

    /// Evaluates the policy for one trace.
    fn evaluate(&self, trace_id: TraceId, trace: &TraceData) -> Result<Decision, Self::Error>;
}

/// Scores a trace with a linear model, logging and counting invalid scores.
pub(crate) fn score_trace(
    model: &LinearModel,
    trace_id: TraceId,
    trace: &TraceData,
) -> (FeatureVector, Option<f64>) {
    let features = FeatureVector::extract(trace);
    let score = model.score(&features);

    if score.is_none() {
        tailscore_log::debug!(%trace_id, ?features, "model score invalid; not sampling");
        metric!(counter(SamplingCounters::InvalidScore) += 1);
    }

    (features, score)
}

/// Counts a decision of the given sampler kind and passes it through.
pub(crate) fn record_decision(sampler: &'static str, decision: Decision) -> Decision {
    metric!(
        counter(SamplingCounters::Decision) += 1,
        sampler = sampler,
        decision = decision.as_str(),
    );
    decision
}

/// Samples traces whose score reaches a fixed threshold.
#[derive(Clone, Debug)]
pub struct LinearModelSampler {
    model: LinearModel,
    threshold: f64,
}

impl LinearModelSampler {
    /// Creates a sampler from a model and its threshold.
    pub fn new(model: LinearModel, threshold: f64) -> Self {
        Self { model, threshold }
    }

    /// Evaluates a trace. The boundary is inclusive.
    pub fn decide(&self, trace_id: TraceId, trace: &TraceData) -> Decision {
        let decision = match score_trace(&self.model, trace_id, trace) {
            (_, Some(score)) if score >= self.threshold => Decision::Sampled,
            _ => Decision::NotSampled,
        };

        record_decision("linear", decision)
    }
}

impl PolicyEvaluator for LinearModelSampler {
    type Error = Infallible;

    fn evaluate(&self, trace_id: TraceId, trace: &TraceData) -> Result<Decision, Self::Error> {
        Ok(self.decide(trace_id, trace))
    }
}

/// The evaluator of a `model` policy, chosen from its configuration.
#[derive(Debug)]
pub enum ModelSampler {
    /// A fixed threshold.
    Linear(LinearModelSampler),
    /// A threshold retuned to hit a target keep rate.
    Adaptive(AdaptiveModelSampler),
}

impl ModelSampler {
    /// Validates the configuration and builds the matching sampler.
    ///
    /// Each call creates independent controller state.
    pub fn from_config(config: &ModelConfig) -> Result<Self, ModelConfigError> {
        config.validate()?;
        let model = LinearModel::from_config(config)?;

        Ok(match config.adaptive() {
            Some(adaptive) => {
                Self::Adaptive(AdaptiveModelSampler::new(model, config.threshold, adaptive))
            }
            None => Self::Linear(LinearModelSampler::new(model, config.threshold)),
        })
    }

    /// Returns `"linear"` or `"adaptive"`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Linear(_) => "linear",
            Self::Adaptive(_) => "adaptive",
        }
    }

    /// Evaluates a trace.
    pub fn decide(&self, trace_id: TraceId, trace: &TraceData) -> Decision {
        match self {
            Self::Linear(sampler) => sampler.decide(trace_id, trace),
            Self::Adaptive(sampler) => sampler.decide(trace_id, trace),
        }
    }
}

impl PolicyEvaluator for ModelSampler {
    type Error = Infallible;

    fn evaluate(&self, trace_id: TraceId, trace: &TraceData) -> Result<Decision, Self::Error> {
        Ok(self.decide(trace_id, trace))
    }
}

#[cfg(test)]
mod tests {
    use opentelemetry_proto::tonic::trace::v1::status::StatusCode;

    use crate::config::AdaptiveConfig;
    use crate::features::Feature;
    use crate::features::tests::{span, trace};

    use super::*;

    const TRACE_ID: TraceId =
        TraceId::new([1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16]);

    fn config(threshold: f64, weights: &[(&str, f64)]) -> ModelConfig {
        ModelConfig {
            threshold,
            weights: weights
                .iter()
                .map(|(name, weight)| ((*name).to_owned(), *weight))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_linear_sampler_cases() {
        let sampler = ModelSampler::from_config(&config(
            2.0,
            &[("duration_ms", 0.01), ("has_error", 2.0), ("span_count", 0.1)],
        ))
        .unwrap();
        assert_eq!(sampler.kind(), "linear");

        let cases = [
            (
                "short trace without error",
                span(0, 50, StatusCode::Ok, Some(200)),
                Decision::NotSampled,
            ),
            (
                "longer trace without error but enough score",
                span(0, 400, StatusCode::Ok, Some(200)),
                Decision::Sampled,
            ),
            (
                "error trace",
                span(0, 10, StatusCode::Error, Some(500)),
                Decision::Sampled,
            ),
            (
                "status ok but http.status_code=500",
                span(0, 10, StatusCode::Ok, Some(500)),
                Decision::Sampled,
            ),
        ];

        for (name, span, expected) in cases {
            let decision = sampler.evaluate(TRACE_ID, &trace(vec![span])).unwrap();
            assert_eq!(decision, expected, "{name}");
        }
    }

    #[test]
    fn test_boundary_score_equals_threshold() {
        let model = LinearModel::new(0.0, [(Feature::DurationMs, 1.0)]);
        let sampler = LinearModelSampler::new(model, 100.0);
        let trace = trace(vec![span(0, 100, StatusCode::Ok, None)]);

        assert_eq!(sampler.evaluate(TRACE_ID, &trace), Ok(Decision::Sampled));
    }

    #[test]
    fn test_multi_span_duration_uses_earliest_to_latest() {
        let model = LinearModel::new(0.0, [(Feature::DurationMs, 1.0)]);
        let sampler = LinearModelSampler::new(model, 500.0);
        let trace = trace(vec![
            span(0, 100, StatusCode::Ok, None),
            span(200, 300, StatusCode::Ok, None),
        ]);

        assert_eq!(sampler.evaluate(TRACE_ID, &trace), Ok(Decision::Sampled));
    }

    #[test]
    fn test_invalid_score_is_not_sampled() {
        tailscore_log::init_test!();

        let config = config(-1e9, &[("duration_ms", f64::NAN)]);
        let sampler = ModelSampler::from_config(&config).unwrap();
        let trace = trace(vec![span(0, 100, StatusCode::Ok, None)]);

        let captures = tailscore_statsd::with_capturing_test_client(|| {
            assert_eq!(sampler.evaluate(TRACE_ID, &trace), Ok(Decision::NotSampled));
        });

        assert_eq!(
            captures,
            [
                "sampling.model.invalid_score:1|c",
                "sampling.model.decision:1|c|#sampler:linear,decision:not_sampled",
            ]
        );
    }

    #[test]
    fn test_infinite_score_is_not_sampled() {
        let model = LinearModel::new(0.0, [(Feature::DurationMs, f64::INFINITY)]);
        let sampler = LinearModelSampler::new(model, 0.0);
        let trace = trace(vec![span(0, 100, StatusCode::Error, None)]);

        assert_eq!(sampler.decide(TRACE_ID, &trace), Decision::NotSampled);
    }

    #[test]
    fn test_from_config_selects_adaptive() {
        let mut config = config(1.0, &[("duration_ms", 1.0)]);
        config.adaptive = Some(AdaptiveConfig {
            enabled: true,
            keep_ratio: 0.1,
            ..Default::default()
        });
        assert_eq!(ModelSampler::from_config(&config).unwrap().kind(), "adaptive");

        config.adaptive = Some(AdaptiveConfig::default());
        assert_eq!(ModelSampler::from_config(&config).unwrap().kind(), "linear");
    }

    #[test]
    fn test_from_config_rejects_invalid() {
        let error = ModelSampler::from_config(&config(1.0, &[])).unwrap_err();
        assert_eq!(error, ModelConfigError::EmptyWeights);
    }

    #[test]
    fn test_decision_display() {
        assert_eq!(Decision::Sampled.to_string(), "sampled");
        assert_eq!(Decision::NotSampled.to_string(), "not_sampled");
        assert!(Decision::Sampled.is_sampled());
    }
}
