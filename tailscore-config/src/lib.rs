//! Configuration for the tailscore CLI.
//!
//! The configuration is a YAML file with three top-level sections:
//!
//! ```yaml
//! logging:
//!   level: debug
//! metrics:
//!   statsd: 127.0.0.1:8125
//!   prefix: tailscore
//! policies:
//!   - name: slow-or-failing
//!     type: model
//!     priority: 1
//!     model:
//!       type: linear
//!       threshold: 2.0
//!       weights:
//!         duration_ms: 0.01
//!         has_error: 2.0
//! ```
//!
//! Use [`Config::from_path`] to load and validate a file. All sections are optional, but every
//! declared policy must pass validation.
#![warn(missing_docs)]

mod config;

pub use self::config::*;
