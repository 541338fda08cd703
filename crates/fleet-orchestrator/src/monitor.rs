//! Per-node performance tracking.
//!
//! Keeps a bounded sample history per worker, classifies short-term trends
//! with a least-squares slope, and raises threshold alerts that feed back
//! into routing decisions.

use std::collections::{HashMap, VecDeque};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::events::{EventBus, OrchestratorEvent};

const SAMPLE_WINDOW: usize = 100;
const TREND_WINDOW: usize = 10;
const ALERT_WINDOW: usize = 3;
const SLOPE_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceSample {
    pub timestamp_ms: i64,
    pub cpu: f64,
    pub memory: f64,
    pub latency_ms: f64,
    pub error_rate: f64,
    pub throughput: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricField {
    Cpu,
    Memory,
    Latency,
    ErrorRate,
    Throughput,
}

impl MetricField {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricField::Cpu => "cpu",
            MetricField::Memory => "memory",
            MetricField::Latency => "latency",
            MetricField::ErrorRate => "error_rate",
            MetricField::Throughput => "throughput",
        }
    }

    fn extract(&self, sample: &PerformanceSample) -> f64 {
        match self {
            MetricField::Cpu => sample.cpu,
            MetricField::Memory => sample.memory,
            MetricField::Latency => sample.latency_ms,
            MetricField::ErrorRate => sample.error_rate,
            MetricField::Throughput => sample.throughput,
        }
    }

    /// Whether a rising value of this field is an improvement.
    fn rising_is_better(&self) -> bool {
        matches!(self, MetricField::Throughput)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Degrading,
    Stable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// Fleet-wide aggregate over each node's most recent sample.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetSummary {
    pub node_count: usize,
    pub average_cpu: f64,
    pub average_memory: f64,
    pub total_throughput: f64,
    pub average_error_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertThresholds {
    pub cpu_warning: f64,
    pub cpu_critical: f64,
    pub memory_warning: f64,
    pub memory_critical: f64,
    pub error_rate_warning: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            cpu_warning: 75.0,
            cpu_critical: 90.0,
            memory_warning: 75.0,
            memory_critical: 90.0,
            error_rate_warning: 5.0,
        }
    }
}

#[derive(Default)]
struct NodeHistory {
    samples: VecDeque<PerformanceSample>,
    // metric name -> currently in alert, used to re-arm only after the
    // metric falls back under its threshold
    alerting: HashMap<&'static str, bool>,
}

pub struct PerformanceMonitor {
    histories: DashMap<String, NodeHistory>,
    thresholds: AlertThresholds,
    events: EventBus,
}

impl PerformanceMonitor {
    pub fn new(thresholds: AlertThresholds, events: EventBus) -> Self {
        Self {
            histories: DashMap::new(),
            thresholds,
            events,
        }
    }

    /// Ingest one sample for a node, evicting beyond the window, and
    /// evaluate alert conditions.
    pub fn record(&self, node_id: &str, sample: PerformanceSample) {
        let mut history = self.histories.entry(node_id.to_string()).or_default();
        history.samples.push_back(sample);
        if history.samples.len() > SAMPLE_WINDOW {
            history.samples.pop_front();
        }

        tracing::trace!(
            node_id = %node_id,
            samples = %history.samples.len(),
            "Recorded performance sample"
        );

        self.evaluate_alerts(node_id, &mut history);
    }

    pub fn metrics(&self, node_id: &str) -> Vec<PerformanceSample> {
        self.histories
            .get(node_id)
            .map(|h| h.samples.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn latest(&self, node_id: &str) -> Option<PerformanceSample> {
        self.histories
            .get(node_id)
            .and_then(|h| h.samples.back().cloned())
    }

    /// Classify the short-term trend of one metric for one node.
    ///
    /// The slope of a least-squares fit over the last ten samples decides
    /// the direction; whether that direction is an improvement depends on
    /// the metric.
    pub fn trend(&self, node_id: &str, field: MetricField) -> Trend {
        let history = match self.histories.get(node_id) {
            Some(h) => h,
            None => return Trend::Stable,
        };
        let samples = &history.samples;
        if samples.len() < 3 {
            return Trend::Stable;
        }

        let window: Vec<f64> = samples
            .iter()
            .rev()
            .take(TREND_WINDOW)
            .map(|s| field.extract(s))
            .collect();
        // Reversed above; restore chronological order for the fit.
        let values: Vec<f64> = window.into_iter().rev().collect();

        let slope = least_squares_slope(&values);
        if slope.abs() < SLOPE_EPSILON {
            return Trend::Stable;
        }

        let rising = slope > 0.0;
        if rising == field.rising_is_better() {
            Trend::Improving
        } else {
            Trend::Degrading
        }
    }

    /// Fleet aggregate over each node's latest sample.
    pub fn summary(&self) -> FleetSummary {
        let mut summary = FleetSummary::default();
        for entry in self.histories.iter() {
            if let Some(latest) = entry.value().samples.back() {
                summary.node_count += 1;
                summary.average_cpu += latest.cpu;
                summary.average_memory += latest.memory;
                summary.total_throughput += latest.throughput;
                summary.average_error_rate += latest.error_rate;
            }
        }
        if summary.node_count > 0 {
            let n = summary.node_count as f64;
            summary.average_cpu /= n;
            summary.average_memory /= n;
            summary.average_error_rate /= n;
        }
        summary
    }

    pub fn forget(&self, node_id: &str) {
        self.histories.remove(node_id);
    }

    fn evaluate_alerts(&self, node_id: &str, history: &mut NodeHistory) {
        if history.samples.len() < ALERT_WINDOW {
            return;
        }
        let recent: Vec<&PerformanceSample> =
            history.samples.iter().rev().take(ALERT_WINDOW).collect();
        let mean = |f: fn(&PerformanceSample) -> f64| {
            recent.iter().map(|s| f(s)).sum::<f64>() / recent.len() as f64
        };

        let cpu = mean(|s| s.cpu);
        let memory = mean(|s| s.memory);
        let error_rate = mean(|s| s.error_rate);

        self.check_threshold(node_id, history, "cpu", cpu, self.thresholds.cpu_warning, self.thresholds.cpu_critical);
        self.check_threshold(node_id, history, "memory", memory, self.thresholds.memory_warning, self.thresholds.memory_critical);

        let error_alerting = history.alerting.entry("error_rate").or_insert(false);
        if error_rate > self.thresholds.error_rate_warning {
            if !*error_alerting {
                *error_alerting = true;
                self.emit_alert(node_id, AlertSeverity::Warning, "error_rate", error_rate);
            }
        } else {
            *error_alerting = false;
        }
    }

    fn check_threshold(
        &self,
        node_id: &str,
        history: &mut NodeHistory,
        metric: &'static str,
        value: f64,
        warning: f64,
        critical: f64,
    ) {
        let alerting = history.alerting.entry(metric).or_insert(false);
        if value > critical {
            if !*alerting {
                *alerting = true;
                self.emit_alert(node_id, AlertSeverity::Critical, metric, value);
                self.events.publish(OrchestratorEvent::SystemFailover {
                    node_id: node_id.to_string(),
                    metric: metric.to_string(),
                });
            }
        } else if value > warning {
            if !*alerting {
                *alerting = true;
                self.emit_alert(node_id, AlertSeverity::Warning, metric, value);
            }
        } else {
            *alerting = false;
        }
    }

    fn emit_alert(&self, node_id: &str, severity: AlertSeverity, metric: &str, value: f64) {
        tracing::warn!(
            node_id = %node_id,
            metric = %metric,
            value = %value,
            ?severity,
            "Performance alert raised"
        );
        self.events.publish(OrchestratorEvent::PerformanceAlert {
            node_id: node_id.to_string(),
            severity,
            metric: metric.to_string(),
            value,
        });
    }
}

fn least_squares_slope(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    if values.len() < 2 {
        return 0.0;
    }
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = values.iter().sum::<f64>() / n;
    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (i, y) in values.iter().enumerate() {
        let dx = i as f64 - mean_x;
        numerator += dx * (y - mean_y);
        denominator += dx * dx;
    }
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}
