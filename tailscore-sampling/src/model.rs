//! Linear scoring of feature vectors.

use crate::config::ModelConfig;
use crate::features::{Feature, FeatureVector, UnsupportedFeature};

/// A linear scoring function: `intercept + sum(weight * feature)`.
///
/// Features without a weight contribute nothing.
#[derive(Clone, Debug, PartialEq)]
pub struct LinearModel {
    intercept: f64,
    weights: Vec<(Feature, f64)>,
}

impl LinearModel {
    /// Creates a model from an intercept and per-feature weights.
    pub fn new(intercept: f64, weights: impl IntoIterator<Item = (Feature, f64)>) -> Self {
        Self {
            intercept,
            weights: weights.into_iter().collect(),
        }
    }

    /// Creates a model from the intercept and weights of a model policy.
    pub fn from_config(config: &ModelConfig) -> Result<Self, UnsupportedFeature> {
        Ok(Self::new(config.intercept, config.feature_weights()?))
    }

    /// Scores a trace.
    ///
    /// Returns `None` if the score is NaN or infinite.
    pub fn score(&self, features: &FeatureVector) -> Option<f64> {
        let score = self
            .weights
            .iter()
            .fold(self.intercept, |score, &(feature, weight)| {
                score + weight * features.get(feature)
            });

        score.is_finite().then_some(score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(duration_ms: f64, span_count: f64, has_error: f64) -> FeatureVector {
        FeatureVector {
            duration_ms,
            span_count,
            has_error,
        }
    }

    #[test]
    fn test_weighted_sum() {
        let model = LinearModel::new(
            0.5,
            [
                (Feature::DurationMs, 0.01),
                (Feature::HasError, 2.0),
                (Feature::SpanCount, 0.1),
            ],
        );

        assert_eq!(model.score(&features(400.0, 0.0, 0.0)), Some(4.5));
        assert_eq!(model.score(&features(0.0, 10.0, 1.0)), Some(3.5));
    }

    #[test]
    fn test_unweighted_features_are_ignored() {
        let model = LinearModel::new(1.0, [(Feature::HasError, 3.0)]);
        assert_eq!(model.score(&features(1e9, 1e9, 0.0)), Some(1.0));
    }

    #[test]
    fn test_invalid_scores() {
        let nan = LinearModel::new(0.0, [(Feature::DurationMs, f64::NAN)]);
        assert_eq!(nan.score(&features(100.0, 1.0, 0.0)), None);

        let inf = LinearModel::new(f64::INFINITY, []);
        assert_eq!(inf.score(&FeatureVector::default()), None);

        let overflow = LinearModel::new(0.0, [(Feature::DurationMs, f64::MAX)]);
        assert_eq!(overflow.score(&features(10.0, 0.0, 0.0)), None);
    }

    #[test]
    fn test_from_config() {
        let config = ModelConfig {
            intercept: -1.0,
            weights: [("span_count".to_owned(), 2.0)].into(),
            ..Default::default()
        };

        let model = LinearModel::from_config(&config).unwrap();
        assert_eq!(model.score(&features(0.0, 3.0, 0.0)), Some(5.0));
    }
}
