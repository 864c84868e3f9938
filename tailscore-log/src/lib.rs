//! Logging facade for tailscore.
//!
//! # Setup
//!
//! Binaries call `init` once with a `LogConfig` deserialized from the `logging` section of the
//! configuration file. Both are behind the `init` feature so that library crates only pull in the
//! macros.
//!
//! # Logging
//!
//! Use the re-exported [`error!`], [`warn!`], [`info!`], [`debug!`] and [`trace!`] macros. They
//! take a format string plus optional structured fields.
//!
//! Messages are lowercase without trailing punctuation. Numbers, identifiers and paths go into
//! fields rather than into the message. Levels are used as follows:
//!
//! - [`error!`]: a sampling decision or startup step failed.
//! - [`warn!`]: a trace or policy was skipped but processing continues.
//! - [`info!`]: lifecycle events such as loaded configuration.
//! - [`debug!`]: per-policy details such as threshold recomputations.
//! - [`trace!`]: per-trace scores and features.
//!
//! ```
//! tailscore_log::info!("startup complete");
//! tailscore_log::debug!(threshold = 4.2, keep_ratio = 0.1, "threshold recomputed");
//! ```
//!
//! Errors are logged through [`LogError`], which appends every `source()` in the chain:
//!
//! ```
//! use std::io::{Error, ErrorKind};
//! use tailscore_log::LogError;
//!
//! let error = Error::new(ErrorKind::NotFound, "policies.yml");
//! tailscore_log::error!("cannot load policies: {}", LogError(&error));
//! ```
//!
//! # Testing
//!
//! With the `test` feature, `init_test!()` routes `trace` level output of the calling crate to
//! the test harness.

#![warn(missing_docs)]

#[cfg(feature = "init")]
mod setup;
#[cfg(feature = "init")]
pub use setup::*;

#[cfg(feature = "test")]
mod test;
#[cfg(feature = "test")]
pub use test::*;

mod utils;
pub use utils::*;

#[doc(inline)]
pub use tracing::{debug, error, info, trace, warn};
