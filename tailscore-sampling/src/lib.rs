//! Score-based sampling decisions for completed traces.
//!
//! Instead of retaining a fixed share of traces or matching static rules, a model policy scores
//! every trace from a handful of features and keeps the traces that score highest.
//!
//! # Components
//!
//! - [`TraceData`]: the span batches buffered for one trace, shared with the ingestion layer.
//! - [`FeatureVector`]: the features extracted from a trace: `duration_ms`, `span_count` and
//!   `has_error`.
//! - [`LinearModel`]: computes `intercept + sum(weight * feature)`.
//! - [`LinearModelSampler`]: samples traces whose score reaches a fixed threshold.
//! - [`AdaptiveModelSampler`]: retunes the threshold to a quantile of recent scores so that a
//!   target share or rate of traces is retained, with an override for traces with errors and an
//!   incident boost while many traces fail or exceed their SLA.
//! - [`ModelSampler`]: selects one of the above from a validated [`ModelConfig`].
//!
//! All samplers implement [`PolicyEvaluator`] and can be shared across threads.
//!
//! # Example
//!
//! ```
//! use tailscore_sampling::{ModelConfig, ModelSampler, PolicyEvaluator, TraceData, TraceId};
//!
//! let config: ModelConfig = serde_yaml::from_str(
//!     r#"
//! type: linear
//! threshold: 2.0
//! weights:
//!   duration_ms: 0.01
//!   has_error: 2.0
//! "#,
//! )
//! .unwrap();
//!
//! let sampler = ModelSampler::from_config(&config).unwrap();
//! let decision = sampler.evaluate(TraceId::new([1; 16]), &TraceData::new()).unwrap();
//! assert!(!decision.is_sampled());
//! ```
#![warn(missing_docs)]

mod adaptive;
mod config;
mod evaluation;
mod features;
mod model;
mod statsd;
mod trace;
mod utils;

pub use self::adaptive::*;
pub use self::config::*;
pub use self::evaluation::*;
pub use self::features::*;
pub use self::model::*;
pub use self::trace::*;
pub use self::utils::{DurationParseError, format_duration, parse_duration};
