//! Statistics Module
//!
//! Rolling per-interval statistics over two sample series. Each series is a
//! constant-size `RangeStat`; latency samples are additionally recorded in an
//! HdrHistogram so the interval summary can carry percentiles. Everything is
//! reset on every `tick()`, so memory never grows with the message rate.

use hdrhistogram::{CreationError, Histogram};
use serde::Serialize;

/// Upper histogram bound: one hour in microseconds
const HISTOGRAM_MAX_US: u64 = 3_600_000_000;

/// Sample series tracked by the aggregator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Series {
    /// Payload size in bytes, standing in for a price since payloads are not parsed
    PriceProxy,
    /// Microseconds between consecutive messages
    Latency,
}

/// Running min/max/sum/count over a sample stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeStat {
    lowest: u64,
    highest: u64,
    /// Wide enough that `u32::MAX` samples of `u64::MAX` cannot overflow
    sum: u128,
    samples: u32,
}

impl Default for RangeStat {
    fn default() -> Self {
        Self::new()
    }
}

impl RangeStat {
    /// An empty range; `lowest` holds `u64::MAX` until the first sample.
    pub fn new() -> Self {
        Self {
            lowest: u64::MAX,
            highest: 0,
            sum: 0,
            samples: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn add(&mut self, value: u64) {
        if self.samples == 0 {
            self.lowest = value;
            self.highest = value;
        } else {
            self.lowest = self.lowest.min(value);
            self.highest = self.highest.max(value);
        }
        self.sum += u128::from(value);
        self.samples = self.samples.saturating_add(1);
    }

    pub fn is_empty(&self) -> bool {
        self.samples == 0
    }

    pub fn samples(&self) -> u32 {
        self.samples
    }

    pub fn lowest(&self) -> u64 {
        self.lowest
    }

    pub fn highest(&self) -> u64 {
        self.highest
    }

    /// Snapshot of the range, `None` when no samples were recorded
    pub fn summary(&self) -> Option<RangeSummary> {
        if self.is_empty() {
            return None;
        }
        // Once `samples` saturates the quotient drifts, so keep it inside the range
        let avg = self.sum / u128::from(self.samples);
        let avg = u64::try_from(avg)
            .unwrap_or(u64::MAX)
            .clamp(self.lowest, self.highest);
        Some(RangeSummary {
            min: self.lowest,
            max: self.highest,
            avg,
            count: self.samples,
        })
    }
}

/// Emitted form of a `RangeStat`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RangeSummary {
    pub min: u64,
    pub max: u64,
    /// Truncating integer average
    pub avg: u64,
    pub count: u32,
}

impl RangeSummary {
    /// Convert a microsecond summary to milliseconds (truncating).
    pub fn to_millis(self) -> Self {
        Self {
            min: self.min / 1000,
            max: self.max / 1000,
            avg: self.avg / 1000,
            count: self.count,
        }
    }
}

/// Latency percentiles in microseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Percentiles {
    pub p50: u64,
    pub p99: u64,
}

/// Everything emitted by one `tick()`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntervalSummary {
    pub price: Option<RangeSummary>,
    /// Microseconds
    pub latency: Option<RangeSummary>,
    pub latency_percentiles: Option<Percentiles>,
}

impl IntervalSummary {
    pub fn is_empty(&self) -> bool {
        self.price.is_none() && self.latency.is_none()
    }

    /// Log the summary in the human-readable form: price proxy as-is,
    /// latency in milliseconds.
    pub fn log(&self) {
        if let Some(price) = &self.price {
            log::info!(
                "price: min: {}, max: {}, avg: {}, samples: {}",
                price.min,
                price.max,
                price.avg,
                price.count
            );
        }

        if let Some(latency) = &self.latency {
            let ms = latency.to_millis();
            match &self.latency_percentiles {
                Some(p) => log::info!(
                    "elatency: min: {}ms, max: {}ms, avg: {}ms, p50: {}ms, p99: {}ms, ({} msg/s)",
                    ms.min,
                    ms.max,
                    ms.avg,
                    p.p50 / 1000,
                    p.p99 / 1000,
                    ms.count
                ),
                None => log::info!(
                    "elatency: min: {}ms, max: {}ms, avg: {}ms, ({} msg/s)",
                    ms.min,
                    ms.max,
                    ms.avg,
                    ms.count
                ),
            }
        }
    }
}

/// Per-interval aggregator for the price proxy and latency series
pub struct StatsAggregator {
    price: RangeStat,
    latency: RangeStat,
    /// Latency histogram (microseconds), reset with the ranges
    latency_histogram: Histogram<u64>,
}

impl StatsAggregator {
    /// Create an empty aggregator
    ///
    /// Histogram is configured with:
    /// - Minimum value: 1 microsecond
    /// - Maximum value: 1 hour
    /// - 3 significant figures precision
    pub fn new() -> Result<Self, CreationError> {
        Ok(Self {
            price: RangeStat::new(),
            latency: RangeStat::new(),
            latency_histogram: Histogram::new_with_bounds(1, HISTOGRAM_MAX_US, 3)?,
        })
    }

    /// Record one sample in the named series
    pub fn record(&mut self, series: Series, value: u64) {
        match series {
            Series::PriceProxy => self.price.add(value),
            Series::Latency => {
                self.latency.add(value);
                // Clamp value to histogram bounds
                let clamped = value.clamp(1, HISTOGRAM_MAX_US);
                if let Err(e) = self.latency_histogram.record(clamped) {
                    log::warn!("Failed to record latency {}: {}", value, e);
                }
            }
        }
    }

    /// Summarise the interval and start a new one
    pub fn tick(&mut self) -> IntervalSummary {
        let latency_percentiles = if self.latency_histogram.len() == 0 {
            None
        } else {
            Some(Percentiles {
                p50: self.latency_histogram.value_at_quantile(0.50),
                p99: self.latency_histogram.value_at_quantile(0.99),
            })
        };

        let summary = IntervalSummary {
            price: self.price.summary(),
            latency: self.latency.summary(),
            latency_percentiles,
        };

        self.reset();
        summary
    }

    /// Drop all samples of the current interval
    pub fn reset(&mut self) {
        self.price.reset();
        self.latency.reset();
        self.latency_histogram.reset();
    }

    pub fn range(&self, series: Series) -> &RangeStat {
        match series {
            Series::PriceProxy => &self.price,
            Series::Latency => &self.latency,
        }
    }
}
