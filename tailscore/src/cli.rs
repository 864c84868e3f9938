use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tailscore_config::Config;
use tailscore_sampling::{ModelConfig, format_duration};

use crate::analyze::{self, AnalyzeArgs};
use crate::setup;

/// Score-based tail sampling for trace pipelines.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Path to the configuration file.
    #[arg(
        short,
        long,
        global = true,
        env = "TAILSCORE_CONFIG",
        default_value = "tailscore.yml"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validates the configuration and lists its model policies.
    Validate,
    /// Replays recorded traces through the model policies and reports their decisions.
    Analyze(AnalyzeArgs),
}

/// Runs the command line application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_path(&cli.config)?;

    setup::init_logging(&config);
    setup::dump_spawn_infos(&cli.config, &config);
    setup::init_metrics(&config)?;

    match cli.command {
        Command::Validate => validate(&config, &mut io::stdout().lock()),
        Command::Analyze(args) => analyze::run(&config, &args),
    }
}

/// Prints a summary of every model policy of a validated configuration.
fn validate<W: Write>(config: &Config, out: &mut W) -> Result<()> {
    let policies = config.model_policies();
    writeln!(out, "config is valid: {} model policies", policies.len())?;

    for (path, model) in policies {
        writeln!(out, "  {path}: {}", describe_model(model))?;
    }

    Ok(())
}

fn describe_model(model: &ModelConfig) -> String {
    let weights = model
        .weights
        .iter()
        .map(|(feature, weight)| format!("{feature}={weight}"))
        .collect::<Vec<_>>()
        .join(", ");

    let mut description = format!(
        "linear model, intercept {}, weights [{weights}], ",
        model.intercept
    );

    match model.adaptive() {
        None => description.push_str(&format!("fixed threshold {}", model.threshold)),
        Some(adaptive) => {
            let target = if adaptive.target_traces_per_sec > 0.0 {
                format!("{} traces/s", adaptive.target_traces_per_sec)
            } else {
                format!("keep ratio {}", adaptive.keep_ratio)
            };

            description.push_str(&format!(
                "adaptive threshold from {} targeting {target}, window {}, recompute every {}, {} samples",
                model.threshold,
                format_duration(adaptive.window_duration),
                format_duration(adaptive.recompute_interval),
                adaptive.max_samples,
            ));
        }
    }

    description
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_analyze_args() {
        let cli = Cli::try_parse_from([
            "tailscore",
            "analyze",
            "--config",
            "sampler.yml",
            "--input",
            "traces.jsonl",
            "--suggest-keep",
            "0.3,0.05",
        ])
        .unwrap();

        assert_eq!(cli.config, PathBuf::from("sampler.yml"));
        let Command::Analyze(args) = cli.command else {
            panic!("expected analyze command");
        };
        assert_eq!(args.input, Some(PathBuf::from("traces.jsonl")));
        assert_eq!(args.suggest_keep, vec![0.3, 0.05]);
    }

    #[test]
    fn test_suggest_keep_defaults() {
        let cli = Cli::try_parse_from(["tailscore", "analyze"]).unwrap();
        let Command::Analyze(args) = cli.command else {
            panic!("expected analyze command");
        };

        assert_eq!(args.input, None);
        assert_eq!(args.policy, None);
        assert_eq!(args.suggest_keep, vec![0.5, 0.2, 0.1]);
    }

    #[test]
    fn test_suggest_keep_out_of_range() {
        let result = Cli::try_parse_from(["tailscore", "analyze", "--suggest-keep", "1.5"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_output() {
        let config = Config::from_yaml_str(
            r#"
policies:
  - name: fixed
    type: model
    priority: 1
    model:
      threshold: 2.0
      weights:
        duration_ms: 0.01
        has_error: 2.0
  - name: group
    type: policy_group
    priority: 2
    sub_policies:
      - name: adaptive
        type: model
        priority: 1
        model:
          threshold: 1.0
          intercept: -1.0
          weights:
            span_count: 0.5
          adaptive:
            enabled: true
            keep_ratio: 0.1
            window_duration: 1m
            recompute_interval: 500ms
            max_samples: 100
"#,
        )
        .unwrap();

        let mut out = Vec::new();
        validate(&config, &mut out).unwrap();

        insta::assert_snapshot!(String::from_utf8(out).unwrap(), @r"
        config is valid: 2 model policies
          fixed: linear model, intercept 0, weights [duration_ms=0.01, has_error=2], fixed threshold 2
          group/adaptive: linear model, intercept -1, weights [span_count=0.5], adaptive threshold from 1 targeting keep ratio 0.1, window 1m, recompute every 500ms, 100 samples
        ");
    }
}
