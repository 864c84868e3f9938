use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tailscore_log::LogConfig;
use tailscore_sampling::{ModelConfig, ModelConfigError};

/// Defines the source of a config error
#[derive(Debug)]
enum ConfigErrorSource {
    /// An error occurring independently.
    None,
    /// An error originating from a configuration file.
    File(PathBuf),
}

/// Indicates config related errors.
#[derive(Debug)]
pub struct ConfigError {
    source: ConfigErrorSource,
    kind: ConfigErrorKind,
    inner: Option<Box<dyn Error + Send + Sync + 'static>>,
}

impl ConfigError {
    #[inline]
    fn wrap<E>(inner: E, kind: ConfigErrorKind) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self {
            source: ConfigErrorSource::None,
            kind,
            inner: Some(Box::new(inner)),
        }
    }

    #[inline]
    fn file<P: AsRef<Path>>(mut self, p: P) -> Self {
        self.source = ConfigErrorSource::File(p.as_ref().to_path_buf());
        self
    }

    /// Returns the error kind of the error.
    pub fn kind(&self) -> ConfigErrorKind {
        self.kind
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            ConfigErrorSource::None => write!(f, "{}", self.kind),
            ConfigErrorSource::File(file_name) => {
                write!(f, "{} (file {})", self.kind, file_name.display())
            }
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.inner
            .as_deref()
            .map(|inner| inner as &(dyn Error + 'static))
    }
}

/// Indicates config related errors.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, thiserror::Error)]
pub enum ConfigErrorKind {
    /// Failed to open the file.
    #[error("could not open config file")]
    CouldNotOpenFile,
    /// Parsing YAML failed.
    #[error("could not parse yaml config file")]
    BadYaml,
    /// A policy failed validation.
    #[error("invalid policy")]
    InvalidPolicy,
}

/// A policy that fails validation, identified by its path in the policy tree.
///
/// Top-level policies are identified by their name, sub-policies by `<group>/<name>`.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum PolicyError {
    /// A `model` policy without a `model` section.
    #[error("policy {path:?}: model config is required")]
    MissingModel {
        /// Path of the policy.
        path: String,
    },
    /// A policy with a priority of zero or less.
    #[error("policy {path:?}: priority must be greater than 0")]
    InvalidPriority {
        /// Path of the policy.
        path: String,
    },
    /// A `model` policy with an invalid model configuration.
    #[error("policy {path:?}: {error}")]
    InvalidModel {
        /// Path of the policy.
        path: String,
        /// The validation error of the model.
        error: ModelConfigError,
    },
}

impl PolicyError {
    /// Returns the path of the failing policy.
    pub fn path(&self) -> &str {
        match self {
            Self::MissingModel { path }
            | Self::InvalidPriority { path }
            | Self::InvalidModel { path, .. } => path,
        }
    }
}

/// The kind of a sampling policy.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyType {
    /// Scores traces with a model, see [`ModelConfig`].
    Model,
    /// Combines its sub-policies.
    PolicyGroup,
    /// Any other policy kind, which is only checked for its priority.
    #[serde(untagged)]
    Unsupported(String),
}

/// A single sampling policy.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct PolicyConfig {
    /// Name of the policy, used in logs and error messages.
    pub name: String,

    /// The kind of policy.
    #[serde(rename = "type")]
    pub ty: PolicyType,

    /// Order in which policies are evaluated. Must be greater than `0`.
    #[serde(default)]
    pub priority: i32,

    /// Model settings, required for `model` policies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelConfig>,
}

impl PolicyConfig {
    fn validate(&self, path: &str) -> Result<(), PolicyError> {
        if self.ty == PolicyType::Model {
            let model = self.model.as_ref().ok_or_else(|| PolicyError::MissingModel {
                path: path.to_owned(),
            })?;

            model
                .validate()
                .map_err(|error| PolicyError::InvalidModel {
                    path: path.to_owned(),
                    error,
                })?;
        }

        if self.priority <= 0 {
            return Err(PolicyError::InvalidPriority {
                path: path.to_owned(),
            });
        }

        Ok(())
    }
}

/// A top-level policy with optional sub-policies.
///
/// The fields of the policy itself are declared inline next to `sub_policies`.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct PolicyGroupConfig {
    /// The top-level policy.
    #[serde(flatten)]
    pub base: PolicyConfig,

    /// Policies nested in this group.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_policies: Vec<PolicyConfig>,
}

impl PolicyGroupConfig {
    /// Returns the top-level policy followed by its sub-policies, each with its path.
    pub fn policies(&self) -> impl Iterator<Item = (String, &PolicyConfig)> {
        let base = &self.base;
        let subs = self
            .sub_policies
            .iter()
            .map(move |sub| (format!("{}/{}", base.name, sub.name), sub));

        std::iter::once((base.name.clone(), base)).chain(subs)
    }
}

/// Controls internal reporting to statsd.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Hostname and port of the statsd server. Metrics are disabled if not set.
    pub statsd: Option<String>,

    /// Common prefix that should be added to all metrics.
    pub prefix: String,

    /// Default tags to apply to all metrics.
    pub default_tags: BTreeMap<String, String>,

    /// Global sample rate for all emitted metrics between `0.0` and `1.0`.
    pub sample_rate: f64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig {
            statsd: None,
            prefix: "tailscore".to_owned(),
            default_tags: BTreeMap::new(),
            sample_rate: 1.0,
        }
    }
}

/// The complete tailscore configuration.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Logging settings.
    pub logging: LogConfig,

    /// Metrics settings.
    pub metrics: MetricsConfig,

    /// The sampling policies.
    pub policies: Vec<PolicyGroupConfig>,
}

impl Config {
    /// Loads and validates the configuration file at the given path.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let path = path.as_ref();

        let f = fs::File::open(path)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotOpenFile).file(path))?;

        let config: Config = serde_yaml::from_reader(io::BufReader::new(f))
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadYaml).file(path))?;

        config
            .validate()
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::InvalidPolicy).file(path))?;

        Ok(config)
    }

    /// Parses and validates a configuration from a YAML string.
    pub fn from_yaml_str(yaml: &str) -> Result<Config, ConfigError> {
        let config: Config = serde_yaml::from_str(yaml)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadYaml))?;

        config
            .validate()
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::InvalidPolicy))?;

        Ok(config)
    }

    /// Serializes the configuration, including defaults, back to YAML.
    pub fn to_yaml_string(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Checks every policy including sub-policies and returns the first error.
    pub fn validate(&self) -> Result<(), PolicyError> {
        for group in &self.policies {
            for (path, policy) in group.policies() {
                policy.validate(&path)?;
            }
        }

        Ok(())
    }

    /// Returns all `model` policies of the tree with their paths.
    pub fn model_policies(&self) -> Vec<(String, &ModelConfig)> {
        self.policies
            .iter()
            .flat_map(|group| group.policies())
            .filter(|(_, policy)| policy.ty == PolicyType::Model)
            .filter_map(|(path, policy)| Some((path, policy.model.as_ref()?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use tailscore_sampling::ModelType;

    use super::*;

    fn parse(yaml: &str) -> Config {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse("{}");

        assert!(config.policies.is_empty());
        assert_eq!(config.metrics, MetricsConfig::default());
        assert_eq!(config.metrics.prefix, "tailscore");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_valid_model_policy() {
        let config = parse(
            r#"
policies:
  - name: model-policy
    type: model
    priority: 1
    model:
      type: linear
      threshold: 0.5
      intercept: 0.1
      weights:
        duration_ms: 1.0
        span_count: 0.25
        has_error: 10.0
"#,
        );

        assert!(config.validate().is_ok());

        let policies = config.model_policies();
        assert_eq!(policies.len(), 1);
        assert_eq!(policies[0].0, "model-policy");
        assert_eq!(policies[0].1.ty, ModelType::Linear);
        assert_eq!(policies[0].1.weights.len(), 3);
    }

    #[test]
    fn test_valid_adaptive_policy() {
        let config = parse(
            r#"
policies:
  - name: model-policy
    type: model
    priority: 1
    model:
      weights:
        duration_ms: 1.0
      adaptive:
        enabled: true
        window_duration: 30s
        recompute_interval: 5s
        max_samples: 2048
        target_traces_per_sec: 10
        always_keep_errors: true
"#,
        );

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_adaptive_missing_target() {
        let config = parse(
            r#"
policies:
  - name: model-policy
    type: model
    priority: 1
    model:
      weights:
        duration_ms: 1.0
      adaptive:
        enabled: true
        max_samples: 100
"#,
        );

        let error = config.validate().unwrap_err();
        insta::assert_snapshot!(error, @r#"policy "model-policy": model.adaptive requires target_traces_per_sec > 0 or keep_ratio > 0"#);
    }

    #[test]
    fn test_missing_model() {
        let config = parse(
            r#"
policies:
  - name: model-policy
    type: model
    priority: 1
"#,
        );

        let error = config.validate().unwrap_err();
        insta::assert_snapshot!(error, @r#"policy "model-policy": model config is required"#);
    }

    #[test]
    fn test_empty_weights() {
        let config = parse(
            r#"
policies:
  - name: model-policy
    type: model
    priority: 1
    model:
      weights: {}
"#,
        );

        let error = config.validate().unwrap_err();
        assert!(error.to_string().contains("model.weights must not be empty"));
    }

    #[test]
    fn test_unknown_feature() {
        let config = parse(
            r#"
policies:
  - name: model-policy
    type: model
    priority: 1
    model:
      weights:
        unknown: 1.0
"#,
        );

        let error = config.validate().unwrap_err();
        insta::assert_snapshot!(error, @r#"policy "model-policy": model.weights: unsupported feature "unknown""#);
    }

    #[test]
    fn test_nan_threshold() {
        let mut config = parse(
            r#"
policies:
  - name: model-policy
    type: model
    priority: 1
    model:
      weights:
        duration_ms: 1.0
"#,
        );

        if let Some(model) = &mut config.policies[0].base.model {
            model.threshold = f64::NAN;
        }

        let error = config.validate().unwrap_err();
        assert!(error.to_string().contains("model.threshold must be a finite number"));
    }

    #[test]
    fn test_sub_policy_path() {
        let config = parse(
            r#"
policies:
  - name: group
    type: policy_group
    priority: 1
    sub_policies:
      - name: sub
        type: model
        priority: 1
        model:
          weights: {}
"#,
        );

        let error = config.validate().unwrap_err();
        assert_eq!(error.path(), "group/sub");
        insta::assert_snapshot!(error, @r#"policy "group/sub": model.weights must not be empty"#);
    }

    #[test]
    fn test_priority_must_be_set() {
        let config = parse(
            r#"
policies:
  - name: missing-priority
    type: policy_group
"#,
        );

        let error = config.validate().unwrap_err();
        assert_eq!(
            error,
            PolicyError::InvalidPriority {
                path: "missing-priority".to_owned()
            }
        );
        assert!(error.to_string().contains("priority must be greater than 0"));
    }

    #[test]
    fn test_negative_priority() {
        let config = parse(
            r#"
policies:
  - name: latency
    type: latency
    priority: -3
"#,
        );

        let error = config.validate().unwrap_err();
        assert!(error.to_string().contains("priority must be greater than 0"));
    }

    #[test]
    fn test_unsupported_policy_type_is_kept() {
        let config = parse(
            r#"
policies:
  - name: errors
    type: status_code
    priority: 2
"#,
        );

        assert!(config.validate().is_ok());
        assert_eq!(
            config.policies[0].base.ty,
            PolicyType::Unsupported("status_code".to_owned())
        );
        assert!(config.model_policies().is_empty());
    }

    #[test]
    fn test_model_policies_in_groups() {
        let config = parse(
            r#"
policies:
  - name: group
    type: policy_group
    priority: 1
    sub_policies:
      - name: fast
        type: model
        priority: 1
        model:
          weights: { duration_ms: 1.0 }
      - name: errors
        type: status_code
        priority: 2
      - name: slow
        type: model
        priority: 3
        model:
          weights: { span_count: 1.0 }
  - name: top
    type: model
    priority: 2
    model:
      weights: { has_error: 1.0 }
"#,
        );

        let paths: Vec<_> = config
            .model_policies()
            .into_iter()
            .map(|(path, _)| path)
            .collect();

        similar_asserts::assert_eq!(paths, vec!["group/fast", "group/slow", "top"]);
    }

    #[test]
    fn test_from_yaml_str_reports_kind() {
        let error = Config::from_yaml_str("policies: 42").unwrap_err();
        assert_eq!(error.kind(), ConfigErrorKind::BadYaml);
        assert!(error.source().is_some());

        let error = Config::from_yaml_str(
            r#"
policies:
  - name: model-policy
    type: model
    priority: 1
"#,
        )
        .unwrap_err();

        assert_eq!(error.kind(), ConfigErrorKind::InvalidPolicy);
        insta::assert_snapshot!(error, @"invalid policy");
        insta::assert_snapshot!(
            error.source().unwrap(),
            @r#"policy "model-policy": model config is required"#
        );
    }

    #[test]
    fn test_yaml_dump_reloads() {
        let config = Config::from_yaml_str(
            r#"
metrics:
  statsd: 127.0.0.1:8125
policies:
  - name: adaptive
    type: model
    priority: 1
    model:
      threshold: 1.5
      weights: { duration_ms: 0.01 }
      adaptive:
        enabled: true
        keep_ratio: 0.1
        window_duration: 1m
"#,
        )
        .unwrap();

        let dumped = config.to_yaml_string().unwrap();
        let reloaded = Config::from_yaml_str(&dumped).unwrap();

        similar_asserts::assert_eq!(reloaded.policies, config.policies);
        similar_asserts::assert_eq!(reloaded.metrics, config.metrics);
    }
}
