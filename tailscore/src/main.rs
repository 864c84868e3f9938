//! Score-based tail sampling for trace pipelines.
//!
//! A model policy scores every completed trace from a small set of features and keeps the traces
//! that score highest, either against a fixed threshold or against a threshold that is retuned at
//! runtime to retain a target share of traces. This binary validates sampler configurations and
//! replays recorded traces through them.
//!
//! # Commands
//!
//!  - `tailscore validate`: loads and validates the configuration and lists its model policies.
//!  - `tailscore analyze`: scores line-delimited OTLP JSON traces with every model policy and
//!    reports keep counts, score percentiles and threshold suggestions.
//!
//! # Workspace Crates
//!
//! tailscore is split into the following workspace crates:
//!
//!  - `tailscore`: Main entry point and command line interface.
//!  - [`tailscore-config`]: Configuration for the CLI.
//!  - [`tailscore-log`]: Logging facade.
//!  - [`tailscore-sampling`]: Feature extraction, scoring and sampling decisions.
//!  - [`tailscore-statsd`]: High-level StatsD metric client for internal measurements.
//!
//! [`tailscore-config`]: ../tailscore_config/index.html
//! [`tailscore-log`]: ../tailscore_log/index.html
//! [`tailscore-sampling`]: ../tailscore_sampling/index.html
//! [`tailscore-statsd`]: ../tailscore_statsd/index.html

mod analyze;
mod cli;
mod setup;

use std::process;

pub fn main() {
    let exit_code = match cli::execute() {
        Ok(()) => 0,
        Err(err) => {
            tailscore_log::ensure_error(&err);
            1
        }
    };

    process::exit(exit_code);
}
