use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use opentelemetry_proto::tonic::trace::v1::TracesData;
use tailscore_config::Config;
use tailscore_sampling::{
    FeatureVector, LinearModel, ModelConfig, ModelSampler, TraceData, TraceId, split_by_trace,
};

/// Percentiles reported for features and scores.
const PERCENTILES: [f64; 4] = [0.50, 0.90, 0.95, 0.99];

#[derive(Debug, clap::Args)]
pub struct AnalyzeArgs {
    /// Line-delimited OTLP JSON with one `TracesData` object per line.
    ///
    /// Reads from stdin if omitted or `-`.
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// Only analyze the model policy at this path, such as `group/sub`.
    #[arg(short, long)]
    pub policy: Option<String>,

    /// Keep rates between 0 and 1 to suggest thresholds for.
    #[arg(
        long,
        value_delimiter = ',',
        value_parser = parse_keep_rate,
        default_values_t = [0.5, 0.2, 0.1]
    )]
    pub suggest_keep: Vec<f64>,
}

fn parse_keep_rate(s: &str) -> Result<f64, String> {
    let rate: f64 = s.parse().map_err(|_| format!("{s:?} is not a number"))?;
    if rate > 0.0 && rate < 1.0 {
        Ok(rate)
    } else {
        Err(format!("keep rate {rate} must be between 0 and 1"))
    }
}

/// A trace assembled from a recording.
#[derive(Debug)]
struct RecordedTrace {
    id: TraceId,
    data: TraceData,
}

impl RecordedTrace {
    /// Returns the earliest span start in nanoseconds since the epoch.
    fn start_time(&self) -> Option<u64> {
        self.data
            .batches()
            .iter()
            .flat_map(|batch| &batch.scope_spans)
            .flat_map(|scope_spans| &scope_spans.spans)
            .map(|span| span.start_time_unix_nano)
            .filter(|start| *start != 0)
            .min()
    }
}

/// Reads line-delimited OTLP JSON and groups all spans by trace id.
///
/// Traces are returned in order of their first span in the recording.
fn read_traces<R: BufRead>(reader: R) -> Result<Vec<RecordedTrace>> {
    let mut traces: Vec<RecordedTrace> = Vec::new();
    let mut positions: HashMap<TraceId, usize> = HashMap::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line.context("failed to read recorded traces")?;
        if line.trim().is_empty() {
            continue;
        }

        let data: TracesData = serde_json::from_str(&line)
            .with_context(|| format!("invalid OTLP JSON on line {}", index + 1))?;

        for batch in data.resource_spans {
            for (id, batch) in split_by_trace(batch) {
                let position = *positions.entry(id).or_insert_with(|| {
                    traces.push(RecordedTrace {
                        id,
                        data: TraceData::new(),
                    });
                    traces.len() - 1
                });

                traces[position].data.append(batch);
            }
        }
    }

    Ok(traces)
}

/// Returns the nearest-rank percentile of an ascending sample, `p` in `[0, 1]`.
fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }

    let rank = (p.clamp(0.0, 1.0) * sorted.len() as f64).ceil() as usize;
    Some(sorted[rank.clamp(1, sorted.len()) - 1])
}

/// The final state of a policy's threshold after the replay.
#[derive(Debug, PartialEq)]
enum ThresholdState {
    Fixed(f64),
    Adaptive { threshold: f64, keep_ratio: f64 },
}

/// Decisions and score statistics of one model policy over a recording.
#[derive(Debug)]
struct PolicyReport {
    path: String,
    intercept: f64,
    weights: Vec<(String, f64)>,
    threshold: ThresholdState,
    traces: usize,
    kept: usize,
    error_traces: usize,
    invalid_scores: usize,
    durations: Vec<f64>,
    span_counts: Vec<f64>,
    scores: Vec<f64>,
}

impl PolicyReport {
    /// Replays the traces in order through a fresh sampler for the policy.
    ///
    /// Adaptive samplers observe each trace at the offset of its first span from the start of
    /// the recording, so windows and recompute intervals follow recorded time.
    fn replay(path: &str, config: &ModelConfig, traces: &[RecordedTrace]) -> Result<Self> {
        let sampler = ModelSampler::from_config(config)
            .with_context(|| format!("invalid model policy {path:?}"))?;
        let model = LinearModel::from_config(config)?;

        let mut report = PolicyReport {
            path: path.to_owned(),
            intercept: config.intercept,
            weights: config
                .weights
                .iter()
                .map(|(name, weight)| (name.clone(), *weight))
                .collect(),
            threshold: ThresholdState::Fixed(config.threshold),
            traces: traces.len(),
            kept: 0,
            error_traces: 0,
            invalid_scores: 0,
            durations: Vec::new(),
            span_counts: Vec::new(),
            scores: Vec::new(),
        };

        let origin = Instant::now();
        let first_start = traces.iter().filter_map(RecordedTrace::start_time).min();
        let mut elapsed = Duration::ZERO;

        for trace in traces {
            let decision = match &sampler {
                ModelSampler::Linear(sampler) => sampler.decide(trace.id, &trace.data),
                ModelSampler::Adaptive(sampler) => {
                    if let (Some(first), Some(start)) = (first_start, trace.start_time()) {
                        // Out-of-order traces must not move the clock backwards.
                        elapsed = elapsed.max(Duration::from_nanos(start.saturating_sub(first)));
                    }
                    sampler.evaluate_at(origin + elapsed, trace.id, &trace.data)
                }
            };

            if decision.is_sampled() {
                report.kept += 1;
            }

            let features = FeatureVector::extract(&trace.data);
            let Some(score) = model.score(&features) else {
                report.invalid_scores += 1;
                continue;
            };

            if features.has_error() {
                report.error_traces += 1;
            }
            report.durations.push(features.duration_ms);
            report.span_counts.push(features.span_count);
            report.scores.push(score);
        }

        report.durations.sort_by(f64::total_cmp);
        report.span_counts.sort_by(f64::total_cmp);
        report.scores.sort_by(f64::total_cmp);

        if let ModelSampler::Adaptive(sampler) = &sampler {
            let snapshot = sampler.snapshot();
            report.threshold = ThresholdState::Adaptive {
                threshold: snapshot.threshold,
                keep_ratio: snapshot.keep_ratio,
            };
        }

        Ok(report)
    }

    /// Returns the number of scored traces.
    fn scored(&self) -> usize {
        self.scores.len()
    }

    /// Returns the threshold that keeps approximately `keep_rate` of the scored traces.
    fn suggest_threshold(&self, keep_rate: f64) -> Option<f64> {
        percentile(&self.scores, 1.0 - keep_rate)
    }

    /// Returns the share of scored traces at or above `threshold`.
    fn keep_rate_at(&self, threshold: f64) -> f64 {
        let kept = self.scores.len() - self.scores.partition_point(|score| *score < threshold);
        ratio(kept, self.scored())
    }

    fn write<W: Write>(&self, out: &mut W, suggest_keep: &[f64]) -> io::Result<()> {
        writeln!(out, "policy {:?}", self.path)?;

        let weights = self
            .weights
            .iter()
            .map(|(name, weight)| format!("{name}={weight}"))
            .collect::<Vec<_>>()
            .join(", ");
        writeln!(
            out,
            "  model: intercept {}, weights [{weights}]",
            self.intercept
        )?;

        match self.threshold {
            ThresholdState::Fixed(threshold) => writeln!(out, "  threshold: {threshold} (fixed)")?,
            ThresholdState::Adaptive {
                threshold,
                keep_ratio,
            } => writeln!(
                out,
                "  threshold: {threshold:.4} (adaptive, keep ratio {keep_ratio:.4})"
            )?,
        }

        writeln!(
            out,
            "  traces: {}, scored: {}, invalid scores: {}",
            self.traces,
            self.scored(),
            self.invalid_scores
        )?;

        if self.scores.is_empty() {
            return writeln!(out, "  no traces scored");
        }

        writeln!(
            out,
            "  error traces: {} ({:.2}%)",
            self.error_traces,
            percent(self.error_traces, self.scored())
        )?;
        writeln!(
            out,
            "  kept: {}/{} ({:.2}%)",
            self.kept,
            self.traces,
            percent(self.kept, self.traces)
        )?;

        for (label, sample, precision) in [
            ("duration_ms", &self.durations, 2),
            ("span_count", &self.span_counts, 2),
            ("score", &self.scores, 4),
        ] {
            let values = PERCENTILES
                .iter()
                .filter_map(|p| {
                    let value = percentile(sample, *p)?;
                    Some(format!("p{:.0}={value:.precision$}", p * 100.0))
                })
                .collect::<Vec<_>>()
                .join(" ");
            writeln!(out, "  {label}: {values}")?;
        }

        if !suggest_keep.is_empty() {
            writeln!(out, "  suggested thresholds:")?;
        }
        for keep_rate in suggest_keep {
            if let Some(threshold) = self.suggest_threshold(*keep_rate) {
                writeln!(
                    out,
                    "    keep {:.2}: threshold {threshold:.4} (keeps {:.2}%)",
                    keep_rate,
                    100.0 * self.keep_rate_at(threshold)
                )?;
            }
        }

        Ok(())
    }
}

fn ratio(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

fn percent(part: usize, total: usize) -> f64 {
    100.0 * ratio(part, total)
}

/// Returns the model policies to analyze, optionally restricted to a single path.
fn select_policies<'a>(
    config: &'a Config,
    policy: Option<&str>,
) -> Result<Vec<(String, &'a ModelConfig)>> {
    let mut policies = config.model_policies();
    if policies.is_empty() {
        bail!("the config does not declare any model policies");
    }

    if let Some(policy) = policy {
        policies.retain(|(path, _)| path == policy);
        if policies.is_empty() {
            bail!("no model policy at path {policy:?}");
        }
    }

    Ok(policies)
}

/// Replays a recording through every selected model policy and prints a report per policy.
pub fn run(config: &Config, args: &AnalyzeArgs) -> Result<()> {
    let policies = select_policies(config, args.policy.as_deref())?;

    let traces = match &args.input {
        Some(path) if path.as_os_str() != "-" => {
            let file = File::open(path)
                .with_context(|| format!("could not open recording {}", path.display()))?;
            read_traces(BufReader::new(file))?
        }
        _ => read_traces(io::stdin().lock())?,
    };

    tailscore_log::info!(
        traces = traces.len(),
        policies = policies.len(),
        "replaying recorded traces"
    );

    let mut out = io::stdout().lock();
    for (index, (path, model)) in policies.into_iter().enumerate() {
        if index > 0 {
            writeln!(out)?;
        }

        let report = PolicyReport::replay(&path, model, &traces)?;
        report.write(&mut out, &args.suggest_keep)?;
    }

    Ok(())
}
