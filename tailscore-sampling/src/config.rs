//! Model policy configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::features::{Feature, UnsupportedFeature};
use crate::utils;

/// The kind of scoring model.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    /// A weighted sum of trace features plus an intercept.
    #[default]
    Linear,
    /// Any model kind this version does not know.
    #[serde(untagged)]
    Unsupported(String),
}

/// Configuration of a `model` policy.
///
/// ```yaml
/// type: linear
/// threshold: 2.0
/// intercept: 0.0
/// weights:
///   duration_ms: 0.01
///   has_error: 2.0
/// ```
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ModelConfig {
    /// The scoring model.
    #[serde(rename = "type")]
    pub ty: ModelType,

    /// Traces with a score at or above this threshold are sampled.
    ///
    /// Adaptive models start with this threshold and fall back to it until scores are buffered.
    pub threshold: f64,

    /// Constant added to every score.
    pub intercept: f64,

    /// Weight per feature name.
    pub weights: BTreeMap<String, f64>,

    /// Adjusts the threshold at runtime to retain a target share of traces.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adaptive: Option<AdaptiveConfig>,
}

impl ModelConfig {
    /// Returns the adaptive configuration if it is enabled.
    pub fn adaptive(&self) -> Option<&AdaptiveConfig> {
        self.adaptive.as_ref().filter(|adaptive| adaptive.enabled)
    }

    /// Returns the configured weights keyed by feature.
    pub fn feature_weights(&self) -> Result<Vec<(Feature, f64)>, UnsupportedFeature> {
        self.weights
            .iter()
            .map(|(name, weight)| name.parse().map(|feature| (feature, *weight)))
            .collect()
    }

    /// Checks this configuration for errors that would prevent building a sampler.
    pub fn validate(&self) -> Result<(), ModelConfigError> {
        if let ModelType::Unsupported(ty) = &self.ty {
            return Err(ModelConfigError::UnsupportedType(ty.clone()));
        }

        if self.weights.is_empty() {
            return Err(ModelConfigError::EmptyWeights);
        }
        self.feature_weights()?;

        if !self.threshold.is_finite() {
            return Err(ModelConfigError::NonFinite("threshold"));
        }
        if !self.intercept.is_finite() {
            return Err(ModelConfigError::NonFinite("intercept"));
        }

        match self.adaptive() {
            Some(adaptive) => adaptive.validate(),
            None => Ok(()),
        }
    }
}

/// Settings of the adaptive threshold controller.
///
/// The target share of retained traces is derived from `target_traces_per_sec` if set, otherwise
/// from `keep_ratio`.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    /// Enables the controller. When `false`, the model uses its fixed threshold.
    pub enabled: bool,

    /// Length of the window in which the incoming trace rate is measured. `0` never rotates.
    #[serde(with = "utils::duration")]
    pub window_duration: Duration,

    /// Minimum time between two threshold recomputations.
    #[serde(with = "utils::duration")]
    pub recompute_interval: Duration,

    /// Number of most recent scores used to compute the threshold quantile.
    pub max_samples: usize,

    /// Desired number of retained traces per second.
    #[serde(skip_serializing_if = "utils::is_default")]
    pub target_traces_per_sec: f64,

    /// Desired share of retained traces, used when no rate target is set.
    #[serde(skip_serializing_if = "utils::is_default")]
    pub keep_ratio: f64,

    /// Lower bound of the effective keep ratio. Ignored if `0`.
    #[serde(skip_serializing_if = "utils::is_default")]
    pub min_keep_ratio: f64,

    /// Upper bound of the effective keep ratio. `0` means `1`.
    #[serde(skip_serializing_if = "utils::is_default")]
    pub max_keep_ratio: f64,

    /// Samples every trace with an error regardless of its score.
    pub always_keep_errors: bool,

    /// Traces at least this long count as SLA violations. Ignored if `0`.
    #[serde(skip_serializing_if = "utils::is_default")]
    pub sla_duration_ms: f64,

    /// Share of violating traces in the window that declares an incident.
    ///
    /// If `0`, a single violation declares an incident.
    #[serde(skip_serializing_if = "utils::is_default")]
    pub violation_rate_threshold: f64,

    /// Keep ratio applied during an incident. Disables incident detection if `0`.
    #[serde(skip_serializing_if = "utils::is_default")]
    pub incident_keep_ratio: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window_duration: Duration::from_secs(30),
            recompute_interval: Duration::from_secs(5),
            max_samples: 2048,
            target_traces_per_sec: 0.0,
            keep_ratio: 0.0,
            min_keep_ratio: 0.0,
            max_keep_ratio: 0.0,
            always_keep_errors: false,
            sla_duration_ms: 0.0,
            violation_rate_threshold: 0.0,
            incident_keep_ratio: 0.0,
        }
    }
}

impl AdaptiveConfig {
    fn validate(&self) -> Result<(), ModelConfigError> {
        if !(self.target_traces_per_sec > 0.0 || self.keep_ratio > 0.0) {
            return Err(ModelConfigError::MissingTarget);
        }

        if self.max_samples == 0 {
            return Err(ModelConfigError::NoSamples);
        }

        let ratios = [
            ("keep_ratio", self.keep_ratio),
            ("min_keep_ratio", self.min_keep_ratio),
            ("max_keep_ratio", self.max_keep_ratio),
            ("incident_keep_ratio", self.incident_keep_ratio),
        ];
        for (name, ratio) in ratios {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(ModelConfigError::RatioOutOfRange(name));
            }
        }

        if self.max_keep_ratio > 0.0 && self.min_keep_ratio > self.max_keep_ratio {
            return Err(ModelConfigError::InvertedKeepRatios);
        }

        Ok(())
    }
}

/// An invalid [`ModelConfig`].
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ModelConfigError {
    /// The model type is unknown.
    #[error("model.type {0:?} is not supported")]
    UnsupportedType(String),
    /// No weights are configured.
    #[error("model.weights must not be empty")]
    EmptyWeights,
    /// A weight refers to an unknown feature.
    #[error("model.weights: {0}")]
    UnsupportedFeature(#[from] UnsupportedFeature),
    /// The threshold or intercept is NaN or infinite.
    #[error("model.{0} must be a finite number")]
    NonFinite(&'static str),
    /// Neither a rate target nor a keep ratio is configured.
    #[error("model.adaptive requires target_traces_per_sec > 0 or keep_ratio > 0")]
    MissingTarget,
    /// The score buffer has no capacity.
    #[error("model.adaptive.max_samples must be greater than 0")]
    NoSamples,
    /// A ratio lies outside `[0, 1]`.
    #[error("model.adaptive.{0} must be between 0 and 1")]
    RatioOutOfRange(&'static str),
    /// The keep ratio bounds are inverted.
    #[error("model.adaptive.min_keep_ratio must not exceed max_keep_ratio")]
    InvertedKeepRatios,
}
