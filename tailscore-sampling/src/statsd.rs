use tailscore_statsd::{CounterMetric, GaugeMetric, TimerMetric};

pub enum SamplingCounters {
    /// Number of sampling decisions made by model policies.
    ///
    /// This metric is tagged with:
    ///  - `sampler`: `linear` or `adaptive`.
    ///  - `decision`: `sampled` or `not_sampled`.
    Decision,
    /// Number of traces whose score was NaN or infinite.
    InvalidScore,
    /// Number of threshold recomputations that declared an SLA incident.
    Incident,
}

impl CounterMetric for SamplingCounters {
    fn name(&self) -> &'static str {
        match self {
            Self::Decision => "sampling.model.decision",
            Self::InvalidScore => "sampling.model.invalid_score",
            Self::Incident => "sampling.adaptive.incident",
        }
    }
}

pub enum SamplingGauges {
    /// The keep ratio chosen by the last threshold recomputation.
    KeepRatio,
}

impl GaugeMetric for SamplingGauges {
    fn name(&self) -> &'static str {
        match self {
            Self::KeepRatio => "sampling.adaptive.keep_ratio",
        }
    }
}

pub enum SamplingTimers {
    /// Time it took to recompute the adaptive threshold, including the quantile sort.
    Recompute,
}

impl TimerMetric for SamplingTimers {
    fn name(&self) -> &'static str {
        match self {
            Self::Recompute => "sampling.adaptive.recompute",
        }
    }
}
