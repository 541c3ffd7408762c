//! Prometheus metrics for volley scheduler monitoring.
//!
//! Metrics are organized into three categories:
//! - **Gauges**: Point-in-time state (units in flight)
//! - **Counters**: Cumulative totals (units by outcome, batches aggregated)
//! - **Histograms**: Distributions (unit processing duration)
//!
//! Status transitions are additionally counted through the `metrics` facade
//! (`volley_unit_transitions_total`) regardless of this feature.

#[cfg(feature = "metrics")]
use prometheus::{Counter, CounterVec, Gauge, HistogramVec, Opts, Registry};
#[cfg(feature = "metrics")]
use std::time::Duration;

#[cfg(feature = "metrics")]
use crate::error::Result;

/// Prometheus metrics registry for the volley scheduler.
#[cfg(feature = "metrics")]
#[derive(Clone)]
pub struct VolleyMetrics {
    registry: Registry,

    units_in_flight: Gauge,

    units_total: CounterVec,
    batches_aggregated_total: Counter,

    unit_duration_seconds: HistogramVec,
}

#[cfg(feature = "metrics")]
impl VolleyMetrics {
    /// Create a new VolleyMetrics instance with the given registry.
    ///
    /// # Errors
    ///
    /// Returns an error if metrics fail to register (e.g., duplicate registration).
    pub fn new(registry: Registry) -> Result<Self> {
        let units_in_flight = Gauge::new(
            "volley_units_in_flight",
            "Number of units currently being processed",
        )
        .map_err(|e| anyhow::anyhow!("Failed to create units_in_flight gauge: {}", e))?;

        // Outcome is one of completed, failed or not_found
        let units_total = CounterVec::new(
            Opts::new(
                "volley_units_total",
                "Total number of units processed by outcome",
            ),
            &["outcome"],
        )
        .map_err(|e| anyhow::anyhow!("Failed to create units_total counter: {}", e))?;

        let batches_aggregated_total = Counter::new(
            "volley_batches_aggregated_total",
            "Total number of dispatches whose outcomes were aggregated",
        )
        .map_err(|e| anyhow::anyhow!("Failed to create batches_aggregated_total counter: {}", e))?;

        let unit_duration_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "volley_unit_duration_seconds",
                "Unit processing duration in seconds",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
            &["outcome"],
        )
        .map_err(|e| anyhow::anyhow!("Failed to create unit_duration_seconds histogram: {}", e))?;

        registry
            .register(Box::new(units_in_flight.clone()))
            .map_err(|e| anyhow::anyhow!("Failed to register units_in_flight: {}", e))?;
        registry
            .register(Box::new(units_total.clone()))
            .map_err(|e| anyhow::anyhow!("Failed to register units_total: {}", e))?;
        registry
            .register(Box::new(batches_aggregated_total.clone()))
            .map_err(|e| anyhow::anyhow!("Failed to register batches_aggregated_total: {}", e))?;
        registry
            .register(Box::new(unit_duration_seconds.clone()))
            .map_err(|e| anyhow::anyhow!("Failed to register unit_duration_seconds: {}", e))?;

        Ok(Self {
            registry,
            units_in_flight,
            units_total,
            batches_aggregated_total,
            unit_duration_seconds,
        })
    }

    /// Get the underlying Prometheus registry.
    ///
    /// Useful for exporting metrics via HTTP endpoint.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn set_units_in_flight(&self, count: usize) {
        self.units_in_flight.set(count as f64);
    }

    /// Record a processed unit.
    ///
    /// Updates both the units_total counter and the duration histogram.
    pub fn record_unit(&self, outcome: &str, duration: Duration) {
        self.units_total.with_label_values(&[outcome]).inc();
        self.unit_duration_seconds
            .with_label_values(&[outcome])
            .observe(duration.as_secs_f64());
    }

    pub fn record_batch_aggregated(&self) {
        self.batches_aggregated_total.inc();
    }
}
