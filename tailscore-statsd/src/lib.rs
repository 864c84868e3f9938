//! StatsD reporting for the sampler's internal measurements.
//!
//! Metric names are declared as enums implementing one of [`CounterMetric`], [`GaugeMetric`] or
//! [`TimerMetric`], so that a name declared as a counter cannot be reported as a gauge. Values
//! are emitted with the [`metric!`] macro.
//!
//! Until a client is installed with [`init`] or [`set_client`], [`metric!`] does nothing. Tests
//! capture the emitted lines with [`with_capturing_test_client`].
//!
//! ```no_run
//! # use std::collections::BTreeMap;
//! use tailscore_statsd::{CounterMetric, MetricsClientConfig, metric};
//!
//! enum SamplerCounters {
//!     Decision,
//! }
//!
//! impl CounterMetric for SamplerCounters {
//!     fn name(&self) -> &'static str {
//!         match self {
//!             Self::Decision => "sampler.decision",
//!         }
//!     }
//! }
//!
//! tailscore_statsd::init(MetricsClientConfig {
//!     prefix: "tailscore",
//!     host: "localhost:8125",
//!     default_tags: BTreeMap::new(),
//!     default_sample_rate: 1.0.into(),
//! })
//! .ok();
//!
//! metric!(counter(SamplerCounters::Decision) += 1, decision = "sampled");
//! ```

use std::collections::BTreeMap;
use std::io;
use std::net::{ToSocketAddrs, UdpSocket};
use std::ops::Deref;
use std::sync::Arc;

use cadence::{BufferedUdpMetricSink, Metric, MetricBuilder, QueuingMetricSink, StatsdClient};
use parking_lot::RwLock;
use rand::Rng;
use rand::distr::StandardUniform;

pub use cadence::MetricError;

/// Maximum number of metric events that can be queued before we start dropping them.
const METRICS_MAX_QUEUE_SIZE: usize = 100_000;

/// Share of metric events that are reported, clamped to `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleRate(f64);

impl SampleRate {
    /// Returns the rate as a float.
    pub fn get(self) -> f64 {
        self.0
    }

    /// Draws whether a single event is reported.
    fn admits(self) -> bool {
        match self.0 {
            rate if rate <= 0.0 => false,
            rate if rate >= 1.0 => true,
            rate => rand::rng().sample::<f64, _>(StandardUniform) <= rate,
        }
    }
}

impl From<f64> for SampleRate {
    fn from(value: f64) -> Self {
        Self(value.clamp(0.0, 1.0))
    }
}

/// The installed statsd client with the tags and sample rate applied to every metric.
#[derive(Debug)]
pub struct MetricsClient {
    /// The underlying cadence client.
    pub statsd_client: StatsdClient,
    /// Tags added to every metric.
    pub default_tags: BTreeMap<String, String>,
    /// Share of metric events that are reported.
    pub default_sample_rate: SampleRate,
}

/// Arguments of [`init`].
#[derive(Debug)]
pub struct MetricsClientConfig<'a, A> {
    /// Prepended to every metric name, separated by a dot.
    pub prefix: &'a str,
    /// Address of the statsd server.
    pub host: A,
    /// Tags added to every metric.
    pub default_tags: BTreeMap<String, String>,
    /// Share of metric events that are reported.
    pub default_sample_rate: SampleRate,
}

impl Deref for MetricsClient {
    type Target = StatsdClient;

    fn deref(&self) -> &StatsdClient {
        &self.statsd_client
    }
}

impl MetricsClient {
    /// Adds the default tags and sends the metric, subject to the default sample rate.
    #[inline(always)]
    pub fn send_metric<'a, T>(&'a self, metric: MetricBuilder<'a, '_, T>)
    where
        T: Metric + From<String>,
    {
        if !self.default_sample_rate.admits() {
            return;
        }

        let mut metric = self
            .default_tags
            .iter()
            .fold(metric, |metric, (key, value)| metric.with_tag(key, value));

        let sample_rate = self.default_sample_rate.get();
        if sample_rate < 1.0 {
            metric = metric.with_sampling_rate(sample_rate);
        }

        if let Err(error) = metric.try_send() {
            tailscore_log::error!(
                error = &error as &dyn std::error::Error,
                maximum_capacity = METRICS_MAX_QUEUE_SIZE,
                "error sending a metric",
            );
        }
    }
}

static METRICS_CLIENT: RwLock<Option<Arc<MetricsClient>>> = RwLock::new(None);

thread_local! {
    static CURRENT_CLIENT: std::cell::RefCell<Option<Arc<MetricsClient>>> = METRICS_CLIENT.read().clone().into();
}

#[doc(hidden)]
pub mod _pred {
    pub use cadence::prelude::*;
}

/// Installs a client for all threads.
pub fn set_client(client: MetricsClient) {
    *METRICS_CLIENT.write() = Some(Arc::new(client));
    CURRENT_CLIENT.with(|cell| cell.replace(METRICS_CLIENT.read().clone()));
}

/// Runs `f` with a client that records metrics on the current thread, and returns the recorded
/// lines in statsd format.
pub fn with_capturing_test_client(f: impl FnOnce()) -> Vec<String> {
    let (rx, sink) = cadence::SpyMetricSink::new();
    let test_client = MetricsClient {
        statsd_client: StatsdClient::from_sink("", sink),
        default_tags: Default::default(),
        default_sample_rate: 1.0.into(),
    };

    CURRENT_CLIENT.with(|cell| {
        let old_client = cell.replace(Some(Arc::new(test_client)));
        f();
        cell.replace(old_client);
    });

    rx.iter()
        .map(|line| String::from_utf8_lossy(&line).into_owned())
        .collect()
}

/// Installs a client that reports to the statsd server at `config.host`.
///
/// Metrics are buffered into UDP packets and flushed from a background thread. Returns an error
/// if the host cannot be resolved or the local socket cannot be bound.
pub fn init<A: ToSocketAddrs>(config: MetricsClientConfig<'_, A>) -> Result<(), MetricError> {
    let addr = config.host.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "statsd host has no address")
    })?;
    tailscore_log::info!(%addr, "reporting metrics to statsd");

    let sample_rate = config.default_sample_rate.get();
    tailscore_log::debug!(
        "metrics sample rate is set to {sample_rate}{}",
        if sample_rate == 0.0 {
            ", no metrics will be reported"
        } else {
            ""
        }
    );

    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_nonblocking(true)?;

    let udp_sink = BufferedUdpMetricSink::from(addr, socket)?;
    let queuing_sink = QueuingMetricSink::with_capacity(udp_sink, METRICS_MAX_QUEUE_SIZE);
    let statsd_client = StatsdClient::from_sink(config.prefix, queuing_sink);

    set_client(MetricsClient {
        statsd_client,
        default_tags: config.default_tags,
        default_sample_rate: config.default_sample_rate,
    });

    Ok(())
}

/// Calls `f` with the client of the current thread, or returns `R::default()` without one.
#[inline(always)]
pub fn with_client<F, R>(f: F) -> R
where
    F: FnOnce(&MetricsClient) -> R,
    R: Default,
{
    CURRENT_CLIENT.with(|client| {
        if let Some(client) = client.borrow().as_deref() {
            f(client)
        } else {
            R::default()
        }
    })
}

/// A duration, reported as a distribution in milliseconds.
///
/// ```
/// use std::time::Duration;
/// use tailscore_statsd::{TimerMetric, metric};
///
/// struct Recompute;
///
/// impl TimerMetric for Recompute {
///     fn name(&self) -> &'static str {
///         "recompute"
///     }
/// }
///
/// metric!(timer(Recompute) = Duration::from_millis(3), sampler = "adaptive");
///
/// // Times the block and evaluates to its value.
/// let sum = metric!(timer(Recompute), { 1 + 1 });
/// assert_eq!(sum, 2);
/// ```
pub trait TimerMetric {
    /// The metric name without prefix.
    fn name(&self) -> &'static str;
}

/// A count of events, aggregated by the statsd server.
pub trait CounterMetric {
    /// The metric name without prefix.
    fn name(&self) -> &'static str;
}

/// A value that holds until it is set again.
///
/// ```
/// use tailscore_statsd::{GaugeMetric, metric};
///
/// struct KeepRatio;
///
/// impl GaugeMetric for KeepRatio {
///     fn name(&self) -> &'static str {
///         "keep_ratio"
///     }
/// }
///
/// metric!(gauge(KeepRatio) = 0.25);
/// ```
pub trait GaugeMetric {
    /// The metric name without prefix.
    fn name(&self) -> &'static str;
}

/// Emits a metric.
///
/// See [crate-level documentation](self) for examples.
#[macro_export]
macro_rules! metric {
    // counter increment
    (counter($id:expr) += $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {
        $crate::metric!(@count $id, $value $(, $($k).* = $v)*)
    };

    // counter decrement
    (counter($id:expr) -= $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {
        $crate::metric!(@count $id, -($value) $(, $($k).* = $v)*)
    };

    // zero deltas are not sent
    (@count $id:expr, $value:expr $(, $($k:ident).* = $v:expr)*) => {{
        let value = $value;
        if value != 0 {
            $crate::with_client(|client| {
                use $crate::_pred::*;
                client.send_metric(
                    client.count_with_tags(&$crate::CounterMetric::name(&$id), value)
                        $(.with_tag(stringify!($($k).*), $v))*
                )
            });
        }
    }};

    // gauge set
    (gauge($id:expr) = $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {
        $crate::with_client(|client| {
            use $crate::_pred::*;
            client.send_metric(
                client.gauge_with_tags(&$crate::GaugeMetric::name(&$id), $value)
                    $(.with_tag(stringify!($($k).*), $v))*
            )
        })
    };

    // timer value
    (timer($id:expr) = $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {
        $crate::with_client(|client| {
            use $crate::_pred::*;
            client.send_metric(
                client.distribution_with_tags(
                    &$crate::TimerMetric::name(&$id),
                    $value.as_nanos() as f64 / 1e6,
                )
                    $(.with_tag(stringify!($($k).*), $v))*
            )
        })
    };

    // timed block
    (timer($id:expr), $($($k:ident).* = $v:expr,)* $block:block) => {{
        let started = std::time::Instant::now();
        let result = {$block};
        $crate::metric!(timer($id) = started.elapsed() $(, $($k).* = $v)*);
        result
    }};
}
