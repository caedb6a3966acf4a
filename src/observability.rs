use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use crate::pipeline::StepStatus;

#[cfg(feature = "otel")]
pub mod otel;
#[cfg(feature = "metrics-server")]
pub mod server;

#[derive(Debug, Default, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub steps: BTreeMap<String, StepMetrics>,
    pub total_duration_ms: f64,
    pub steps_succeeded: u64,
    pub steps_failed: u64,
    pub steps_skipped: u64,
    /// Reported model metrics keyed by artifact, then metric name.
    pub model_metrics: BTreeMap<String, BTreeMap<String, f64>>,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct StepMetrics {
    pub calls: u64,
    pub failures: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_step(&self, step: &str) -> StepTimer {
        StepTimer {
            step: step.to_string(),
            started_at: Instant::now(),
            collector: self.inner.clone(),
            recorded: false,
        }
    }

    pub fn record_step_status(&self, step: &str, status: &StepStatus) {
        if let Ok(mut guard) = self.inner.lock() {
            match status {
                StepStatus::Succeeded => guard.steps_succeeded += 1,
                StepStatus::Failed { .. } => {
                    guard.steps_failed += 1;
                    guard.steps.entry(step.to_string()).or_default().failures += 1;
                }
                StepStatus::Skipped { .. } => guard.steps_skipped += 1,
            }
        }
    }

    pub fn record_model_metric(&self, artifact: &str, metric: &str, value: f64) {
        if let Ok(mut guard) = self.inner.lock() {
            guard
                .model_metrics
                .entry(artifact.to_string())
                .or_default()
                .insert(metric.to_string(), value);
        }
    }

    pub fn record_total_duration(&self, duration: Duration) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.total_duration_ms = duration.as_secs_f64() * 1_000.0;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn reset(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            *guard = MetricsSnapshot::default();
        }
    }
}

/// Records the step's wall time when dropped.
pub struct StepTimer {
    step: String,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
    recorded: bool,
}

impl StepTimer {
    fn record(&mut self) {
        if self.recorded {
            return;
        }
        let duration_ms = self.started_at.elapsed().as_secs_f64() * 1_000.0;
        if let Ok(mut guard) = self.collector.lock() {
            let metrics = guard.steps.entry(self.step.clone()).or_default();
            metrics.calls += 1;
            metrics.total_duration_ms += duration_ms;
            if duration_ms > metrics.max_duration_ms {
                metrics.max_duration_ms = duration_ms;
            }
        }
        debug!(
            step = self.step.as_str(),
            duration_ms, "Step duration recorded"
        );
        self.recorded = true;
    }
}

impl Drop for StepTimer {
    fn drop(&mut self) {
        self.record();
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        total_duration_ms = snapshot.total_duration_ms,
        succeeded = snapshot.steps_succeeded,
        failed = snapshot.steps_failed,
        skipped = snapshot.steps_skipped,
        "Pipeline metrics summary"
    );
    for (step, metrics) in &snapshot.steps {
        info!(
            step = step.as_str(),
            calls = metrics.calls,
            failures = metrics.failures,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "Step metrics"
        );
    }
    for (artifact, metrics) in &snapshot.model_metrics {
        for (metric, value) in metrics {
            info!(
                artifact = artifact.as_str(),
                metric = metric.as_str(),
                value,
                "Model metric"
            );
        }
    }
}

impl MetricsSnapshot {
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        output.push_str("# HELP spaceflights_steps_total Steps by final status in the last run\n");
        output.push_str("# TYPE spaceflights_steps_total gauge\n");
        for (status, count) in [
            ("succeeded", self.steps_succeeded),
            ("failed", self.steps_failed),
            ("skipped", self.steps_skipped),
        ] {
            output.push_str(&format!(
                "spaceflights_steps_total{{status=\"{status}\"}} {count}\n"
            ));
        }
        output.push_str("# HELP spaceflights_step_calls_total Step invocation count\n");
        output.push_str("# TYPE spaceflights_step_calls_total counter\n");
        output.push_str("# HELP spaceflights_step_failures_total Step failure count\n");
        output.push_str("# TYPE spaceflights_step_failures_total counter\n");
        output.push_str(
            "# HELP spaceflights_step_duration_seconds_total Accumulated step duration in seconds\n",
        );
        output.push_str("# TYPE spaceflights_step_duration_seconds_total counter\n");
        output.push_str(
            "# HELP spaceflights_step_duration_seconds_max Maximum step duration in seconds\n",
        );
        output.push_str("# TYPE spaceflights_step_duration_seconds_max gauge\n");
        for (step, metrics) in &self.steps {
            output.push_str(&format!(
                "spaceflights_step_calls_total{{step=\"{}\"}} {}\n",
                step, metrics.calls
            ));
            output.push_str(&format!(
                "spaceflights_step_failures_total{{step=\"{}\"}} {}\n",
                step, metrics.failures
            ));
            output.push_str(&format!(
                "spaceflights_step_duration_seconds_total{{step=\"{}\"}} {:.6}\n",
                step,
                metrics.total_duration_ms / 1_000.0
            ));
            output.push_str(&format!(
                "spaceflights_step_duration_seconds_max{{step=\"{}\"}} {:.6}\n",
                step,
                metrics.max_duration_ms / 1_000.0
            ));
        }
        output.push_str("# HELP spaceflights_model_metric Latest reported model metric\n");
        output.push_str("# TYPE spaceflights_model_metric gauge\n");
        for (artifact, metrics) in &self.model_metrics {
            for (metric, value) in metrics {
                output.push_str(&format!(
                    "spaceflights_model_metric{{artifact=\"{artifact}\",metric=\"{metric}\"}} {value}\n"
                ));
            }
        }
        output.push_str("# HELP spaceflights_pipeline_duration_seconds Total pipeline duration\n");
        output.push_str("# TYPE spaceflights_pipeline_duration_seconds gauge\n");
        output.push_str(&format!(
            "spaceflights_pipeline_duration_seconds {:.6}\n",
            self.total_duration_ms / 1_000.0
        ));
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_and_statuses_are_recorded() {
        let collector = MetricsCollector::new();
        drop(collector.start_step("train_model"));
        collector.record_step_status("train_model", &StepStatus::Succeeded);
        collector.record_step_status(
            "evaluate_model",
            &StepStatus::Failed {
                error: "boom".into(),
            },
        );
        collector.record_step_status(
            "deploy",
            &StepStatus::Skipped {
                blocked_by: "evaluate_model".into(),
            },
        );

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.steps["train_model"].calls, 1);
        assert_eq!(snapshot.steps["evaluate_model"].failures, 1);
        assert_eq!(
            (snapshot.steps_succeeded, snapshot.steps_failed, snapshot.steps_skipped),
            (1, 1, 1)
        );
    }

    #[test]
    fn prometheus_exposition_includes_model_metrics() {
        let collector = MetricsCollector::new();
        collector.record_model_metric("metrics", "r2", 0.5);
        let text = collector.snapshot().to_prometheus();
        assert!(text.contains("spaceflights_model_metric{artifact=\"metrics\",metric=\"r2\"} 0.5"));
        assert!(text.contains("spaceflights_steps_total{status=\"failed\"} 0"));
    }
}
