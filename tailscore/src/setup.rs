use std::path::Path;

use anyhow::{Context, Result};
use tailscore_config::Config;
use tailscore_statsd::MetricsClientConfig;

/// Initialize the logging system.
pub fn init_logging(config: &Config) {
    tailscore_log::init(&config.logging);
}

/// Print spawn infos to the log.
pub fn dump_spawn_infos(path: &Path, config: &Config) {
    tailscore_log::info!(
        path = %path.display(),
        log_level = %config.logging.level,
        statsd = config.metrics.statsd.as_deref().unwrap_or("-"),
        model_policies = config.model_policies().len(),
        "loaded config",
    );
}

/// Initialize the metric system.
pub fn init_metrics(config: &Config) -> Result<()> {
    let Some(host) = config.metrics.statsd.as_deref() else {
        return Ok(());
    };

    tailscore_statsd::init(MetricsClientConfig {
        prefix: &config.metrics.prefix,
        host,
        default_tags: config.metrics.default_tags.clone(),
        default_sample_rate: config.metrics.sample_rate.into(),
    })
    .with_context(|| format!("failed to set up metrics reporting to {host}"))?;

    Ok(())
}
