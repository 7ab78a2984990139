//! Post-upgrade validation: snapshot capture, validator registry, verdict.
//!
//! The orchestrator captures baseline and post-upgrade metric snapshots and
//! runs registered validators over them. A failed metric query is carried as
//! `None` through the snapshot and fails any comparison that needs it; it is
//! never zero-filled, so a monitoring outage can not masquerade as a healthy
//! upgrade.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::error::{GuardError, Result};
use crate::providers::{Aggregation, MetricsProvider};
use crate::types::{ClusterRecord, MetricsSnapshot, ValidationResult, ValidationThresholds};

/// A post-upgrade validator comparing baseline and current telemetry.
#[async_trait]
pub trait Validator: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Whether a failure of this validator triggers rollback.
    fn is_critical(&self) -> bool {
        true
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(60)
    }

    /// Metric names this validator needs in both snapshots.
    fn required_metrics(&self) -> Vec<String>;

    async fn validate(
        &self,
        cluster: &ClusterRecord,
        baseline: &MetricsSnapshot,
        current: &MetricsSnapshot,
        thresholds: &ValidationThresholds,
    ) -> Result<ValidationResult>;
}

/// Ordered collection of registered validators.
#[derive(Default)]
pub struct ValidatorRegistry {
    validators: Vec<Arc<dyn Validator>>,
}

impl ValidatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a validator. Duplicate names are rejected.
    pub fn register(&mut self, validator: Arc<dyn Validator>) -> Result<()> {
        if self.validators.iter().any(|v| v.name() == validator.name()) {
            return Err(GuardError::invalid_input(format!(
                "validator '{}' is already registered",
                validator.name()
            )));
        }
        debug!(validator_name = validator.name(), "validator_registered");
        self.validators.push(validator);
        Ok(())
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        let before = self.validators.len();
        self.validators.retain(|v| v.name() != name);
        before != self.validators.len()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Validator>> {
        self.validators.iter().find(|v| v.name() == name)
    }

    pub fn all(&self) -> &[Arc<dyn Validator>] {
        &self.validators
    }

    pub fn critical(&self) -> Vec<&Arc<dyn Validator>> {
        self.validators.iter().filter(|v| v.is_critical()).collect()
    }

    /// Union of every validator's required metrics, deduplicated.
    pub fn required_metrics(&self) -> Vec<String> {
        let mut names = BTreeSet::new();
        for validator in &self.validators {
            names.extend(validator.required_metrics());
        }
        names.into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }
}

/// Outcome of one validation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationRun {
    pub results: Vec<ValidationResult>,
    /// True iff every critical validator passed. Non-critical failures are
    /// recorded in `results` but do not flip the verdict.
    pub passed: bool,
}

impl ValidationRun {
    /// All violations from failing results, for history and MR bodies.
    pub fn violations(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|r| !r.passed)
            .flat_map(|r| {
                r.violations
                    .iter()
                    .map(|v| format!("{}: {v}", r.validator_name))
            })
            .collect()
    }

    /// Metric values observed by failing validators, for rollback MRs.
    pub fn failed_metrics(&self) -> BTreeMap<String, Option<f64>> {
        let mut merged = BTreeMap::new();
        for result in self.results.iter().filter(|r| !r.passed) {
            merged.extend(result.metrics.clone());
        }
        merged
    }
}

/// Aggregation to use when collapsing a metric to a scalar.
///
/// Counters are summed over the window; gauges and rates are averaged.
fn metric_aggregation(name: &str) -> Aggregation {
    if name.ends_with(".count") || name.ends_with(".total") {
        Aggregation::Sum
    } else {
        Aggregation::Avg
    }
}

/// Captures snapshots and drives validators to a verdict.
pub struct ValidationOrchestrator {
    metrics: Arc<dyn MetricsProvider>,
    fail_fast: bool,
}

impl ValidationOrchestrator {
    /// `fail_fast` is off by default: the full verdict picture is worth more
    /// than an early exit here.
    pub fn new(metrics: Arc<dyn MetricsProvider>) -> Self {
        Self {
            metrics,
            fail_fast: false,
        }
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Capture the union of required metrics over `[now - window, now]`,
    /// querying concurrently. Failed queries become `None` entries.
    pub async fn capture_snapshot(
        &self,
        registry: &ValidatorRegistry,
        cluster: &ClusterRecord,
        window: Duration,
    ) -> MetricsSnapshot {
        let end = Utc::now();
        let start = end
            - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::minutes(10));
        let tags = cluster.metric_tags.as_map();
        let names = registry.required_metrics();

        info!(
            cluster_id = %cluster.cluster_id,
            metric_count = names.len(),
            window_secs = window.as_secs(),
            "capturing_metrics_snapshot"
        );

        let queries = names.iter().map(|name| {
            let tags = &tags;
            async move {
                let value = self
                    .metrics
                    .query_scalar(name, start, end, tags, metric_aggregation(name))
                    .await;
                (name.clone(), value)
            }
        });

        let mut metrics = BTreeMap::new();
        let mut failed = Vec::new();
        for (name, value) in join_all(queries).await {
            match value {
                Ok(v) => {
                    metrics.insert(name, Some(v));
                }
                Err(err) => {
                    warn!(metric_name = %name, error = %err, "metric_capture_failed");
                    failed.push(name.clone());
                    metrics.insert(name, None);
                }
            }
        }

        if !failed.is_empty() {
            warn!(
                cluster_id = %cluster.cluster_id,
                failed_count = failed.len(),
                failed_metrics = ?failed,
                "metrics_missing_in_snapshot"
            );
        }

        MetricsSnapshot {
            timestamp: end,
            metrics,
            tags,
        }
    }

    /// Run every registered validator and produce the verdict.
    pub async fn validate(
        &self,
        registry: &ValidatorRegistry,
        cluster: &ClusterRecord,
        baseline: &MetricsSnapshot,
        current: &MetricsSnapshot,
        thresholds: &ValidationThresholds,
    ) -> ValidationRun {
        info!(
            cluster_id = %cluster.cluster_id,
            validators = registry.len(),
            "validating_upgrade"
        );

        let mut results = Vec::with_capacity(registry.len());
        let mut passed = true;

        for validator in registry.all() {
            let result = self
                .run_one(validator.as_ref(), cluster, baseline, current, thresholds)
                .await;
            let failed = !result.passed;
            results.push(result);

            if failed && validator.is_critical() {
                passed = false;
                if self.fail_fast {
                    warn!(
                        cluster_id = %cluster.cluster_id,
                        validator_name = validator.name(),
                        "validator_failed_stopping"
                    );
                    break;
                }
            }
        }

        info!(
            cluster_id = %cluster.cluster_id,
            total = results.len(),
            passed_count = results.iter().filter(|r| r.passed).count(),
            passed,
            "validation_completed"
        );

        ValidationRun { results, passed }
    }

    async fn run_one(
        &self,
        validator: &dyn Validator,
        cluster: &ClusterRecord,
        baseline: &MetricsSnapshot,
        current: &MetricsSnapshot,
        thresholds: &ValidationThresholds,
    ) -> ValidationResult {
        let timeout = validator.timeout();
        let outcome = tokio::time::timeout(
            timeout,
            validator.validate(cluster, baseline, current, thresholds),
        )
        .await;

        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                warn!(validator_name = validator.name(), error = %err, "validator_execution_failed");
                failure_result(
                    cluster,
                    validator.name(),
                    format!("validator failed ({}): {err}", err.kind()),
                )
            }
            Err(_elapsed) => {
                warn!(
                    validator_name = validator.name(),
                    timeout_secs = timeout.as_secs(),
                    "validator_timeout"
                );
                failure_result(
                    cluster,
                    validator.name(),
                    format!("timed out after {}s", timeout.as_secs()),
                )
            }
        }
    }
}

fn failure_result(cluster: &ClusterRecord, validator_name: &str, violation: String) -> ValidationResult {
    ValidationResult {
        cluster_id: cluster.cluster_id.clone(),
        validator_name: validator_name.to_string(),
        passed: false,
        violations: vec![violation],
        metrics: BTreeMap::new(),
        timestamp: Utc::now(),
    }
}

pub const LATENCY_P95: &str = "istio.request.latency.p95";
pub const LATENCY_P99: &str = "istio.request.latency.p99";
pub const ERROR_RATE_5XX: &str = "istio.request.error.5xx.rate";
pub const REQUEST_RATE: &str = "istio.request.total.rate";

/// Request latency must not regress beyond the configured percentage.
#[derive(Debug, Default)]
pub struct LatencyValidator;

impl LatencyValidator {
    fn compare(
        label: &str,
        baseline: Option<f64>,
        current: Option<f64>,
        threshold_percent: f64,
        violations: &mut Vec<String>,
        failures: &mut usize,
    ) {
        let Some(baseline) = baseline else {
            violations.push(format!("baseline {label} latency is unavailable"));
            *failures += 1;
            return;
        };
        if baseline == 0.0 {
            // Nothing to compare against; note it and move on.
            violations.push(format!("info: baseline {label} latency is zero, comparison skipped"));
            return;
        }
        let Some(current) = current else {
            violations.push(format!("current {label} latency is unavailable"));
            *failures += 1;
            return;
        };

        let increase_percent = ((current - baseline) / baseline) * 100.0;
        if increase_percent > threshold_percent {
            violations.push(format!(
                "{label} latency increased {increase_percent:.1}% \
                 (threshold: {threshold_percent}%): {baseline:.2}ms -> {current:.2}ms"
            ));
            *failures += 1;
        }
    }
}

#[async_trait]
impl Validator for LatencyValidator {
    fn name(&self) -> &str {
        "latency"
    }

    fn description(&self) -> &str {
        "Request latency (p95/p99) has not regressed beyond thresholds"
    }

    fn required_metrics(&self) -> Vec<String> {
        vec![LATENCY_P95.to_string(), LATENCY_P99.to_string()]
    }

    async fn validate(
        &self,
        cluster: &ClusterRecord,
        baseline: &MetricsSnapshot,
        current: &MetricsSnapshot,
        thresholds: &ValidationThresholds,
    ) -> Result<ValidationResult> {
        let mut violations = Vec::new();
        let mut failures = 0;

        Self::compare(
            "p95",
            baseline.value(LATENCY_P95),
            current.value(LATENCY_P95),
            thresholds.latency_p95_increase_percent,
            &mut violations,
            &mut failures,
        );
        Self::compare(
            "p99",
            baseline.value(LATENCY_P99),
            current.value(LATENCY_P99),
            thresholds.latency_p99_increase_percent,
            &mut violations,
            &mut failures,
        );

        let metrics: BTreeMap<String, Option<f64>> = [LATENCY_P95, LATENCY_P99]
            .into_iter()
            .map(|name| (name.to_string(), current.value(name)))
            .collect();

        Ok(ValidationResult {
            cluster_id: cluster.cluster_id.clone(),
            validator_name: self.name().to_string(),
            passed: failures == 0,
            violations,
            metrics,
            timestamp: Utc::now(),
        })
    }
}

/// 5xx rate must stay under the absolute ceiling, must not multiply past the
/// configured ratio, and request volume must not crater.
#[derive(Debug, Default)]
pub struct ErrorRateValidator;

#[async_trait]
impl Validator for ErrorRateValidator {
    fn name(&self) -> &str {
        "error-rate"
    }

    fn description(&self) -> &str {
        "5xx error rate and request volume are within post-upgrade bounds"
    }

    fn required_metrics(&self) -> Vec<String> {
        vec![ERROR_RATE_5XX.to_string(), REQUEST_RATE.to_string()]
    }

    async fn validate(
        &self,
        cluster: &ClusterRecord,
        baseline: &MetricsSnapshot,
        current: &MetricsSnapshot,
        thresholds: &ValidationThresholds,
    ) -> Result<ValidationResult> {
        let mut violations = Vec::new();
        let mut failures = 0;

        match current.value(ERROR_RATE_5XX) {
            None => {
                violations.push("current 5xx rate is unavailable".to_string());
                failures += 1;
            }
            Some(current_errors) => {
                if current_errors > thresholds.error_rate_max {
                    violations.push(format!(
                        "5xx rate {current_errors:.4} exceeds maximum {:.4}",
                        thresholds.error_rate_max
                    ));
                    failures += 1;
                }

                match baseline.value(ERROR_RATE_5XX) {
                    None => {
                        violations.push("baseline 5xx rate is unavailable".to_string());
                        failures += 1;
                    }
                    Some(baseline_errors) if baseline_errors > 0.0 => {
                        let ratio = current_errors / baseline_errors;
                        if ratio > thresholds.error_rate_increase_ratio {
                            violations.push(format!(
                                "5xx rate increased {ratio:.1}x: \
                                 {baseline_errors:.4} -> {current_errors:.4}"
                            ));
                            failures += 1;
                        }
                    }
                    // A zero baseline leaves only the absolute ceiling.
                    Some(_) => {}
                }
            }
        }

        let baseline_requests = baseline.value(REQUEST_RATE);
        let current_requests = current.value(REQUEST_RATE);
        match (baseline_requests, current_requests) {
            (None, _) | (_, None) => {
                violations.push("request volume is unavailable".to_string());
                failures += 1;
            }
            (Some(before), Some(after)) if before > 0.0 => {
                if before < thresholds.min_request_volume as f64 {
                    violations.push(format!(
                        "info: baseline volume {before:.0} below {} req floor, \
                         drop comparison skipped",
                        thresholds.min_request_volume
                    ));
                } else {
                    let drop_percent = ((before - after) / before) * 100.0;
                    if drop_percent > thresholds.request_drop_percent {
                        violations.push(format!(
                            "request rate dropped {drop_percent:.1}%: \
                             {before:.0} -> {after:.0} req/s"
                        ));
                        failures += 1;
                    }
                }
            }
            (Some(_), Some(_)) => {}
        }

        let metrics: BTreeMap<String, Option<f64>> = [ERROR_RATE_5XX, REQUEST_RATE]
            .into_iter()
            .map(|name| (name.to_string(), current.value(name)))
            .collect();

        Ok(ValidationResult {
            cluster_id: cluster.cluster_id.clone(),
            validator_name: self.name().to_string(),
            passed: failures == 0,
            violations,
            metrics,
            timestamp: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{ScriptedMetrics, sample_record};

    fn snapshot(entries: &[(&str, Option<f64>)]) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: Utc::now(),
            metrics: entries
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            tags: BTreeMap::new(),
        }
    }

    fn registry_with_defaults() -> ValidatorRegistry {
        let mut registry = ValidatorRegistry::new();
        registry.register(Arc::new(LatencyValidator)).expect("latency");
        registry.register(Arc::new(ErrorRateValidator)).expect("error-rate");
        registry
    }

    #[test]
    fn duplicate_validator_registration_is_rejected() {
        let mut registry = ValidatorRegistry::new();
        registry.register(Arc::new(LatencyValidator)).expect("first");
        let err = registry
            .register(Arc::new(LatencyValidator))
            .expect_err("duplicate");
        assert!(matches!(err, GuardError::InvalidInput(_)));
    }

    #[test]
    fn required_metrics_union_is_deduplicated() {
        let registry = registry_with_defaults();
        let names = registry.required_metrics();
        assert_eq!(
            names,
            vec![
                ERROR_RATE_5XX.to_string(),
                LATENCY_P95.to_string(),
                LATENCY_P99.to_string(),
                REQUEST_RATE.to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn latency_within_threshold_passes() {
        let baseline = snapshot(&[(LATENCY_P95, Some(100.0)), (LATENCY_P99, Some(180.0))]);
        let current = snapshot(&[(LATENCY_P95, Some(105.0)), (LATENCY_P99, Some(185.0))]);

        let result = LatencyValidator
            .validate(
                &sample_record("c1", "wave-1"),
                &baseline,
                &current,
                &ValidationThresholds::default(),
            )
            .await
            .expect("validate");
        assert!(result.passed, "violations: {:?}", result.violations);
    }

    #[tokio::test]
    async fn latency_regression_past_threshold_fails() {
        let baseline = snapshot(&[(LATENCY_P95, Some(100.0)), (LATENCY_P99, Some(180.0))]);
        let current = snapshot(&[(LATENCY_P95, Some(130.0)), (LATENCY_P99, Some(182.0))]);

        let result = LatencyValidator
            .validate(
                &sample_record("c1", "wave-1"),
                &baseline,
                &current,
                &ValidationThresholds::default(),
            )
            .await
            .expect("validate");
        assert!(!result.passed);
        assert!(result.violations[0].contains("p95 latency increased 30.0%"));
    }

    #[tokio::test]
    async fn zero_baseline_is_skipped_with_an_info_violation() {
        let baseline = snapshot(&[(LATENCY_P95, Some(0.0)), (LATENCY_P99, Some(180.0))]);
        let current = snapshot(&[(LATENCY_P95, Some(50.0)), (LATENCY_P99, Some(181.0))]);

        let result = LatencyValidator
            .validate(
                &sample_record("c1", "wave-1"),
                &baseline,
                &current,
                &ValidationThresholds::default(),
            )
            .await
            .expect("validate");
        assert!(result.passed, "zero baseline must not fail the validator");
        assert!(result.violations.iter().any(|v| v.starts_with("info:")));
    }

    #[tokio::test]
    async fn missing_current_value_fails_the_comparison() {
        let baseline = snapshot(&[(LATENCY_P95, Some(100.0)), (LATENCY_P99, Some(180.0))]);
        let current = snapshot(&[(LATENCY_P95, None), (LATENCY_P99, Some(181.0))]);

        let result = LatencyValidator
            .validate(
                &sample_record("c1", "wave-1"),
                &baseline,
                &current,
                &ValidationThresholds::default(),
            )
            .await
            .expect("validate");
        assert!(!result.passed, "unknown must fail, never default to zero");
        assert!(result.violations[0].contains("unavailable"));
    }

    #[tokio::test]
    async fn error_rate_over_absolute_ceiling_fails() {
        let baseline = snapshot(&[(ERROR_RATE_5XX, Some(0.0002)), (REQUEST_RATE, Some(2000.0))]);
        let current = snapshot(&[(ERROR_RATE_5XX, Some(0.002)), (REQUEST_RATE, Some(1900.0))]);

        let result = ErrorRateValidator
            .validate(
                &sample_record("c1", "wave-1"),
                &baseline,
                &current,
                &ValidationThresholds::default(),
            )
            .await
            .expect("validate");
        assert!(!result.passed);
        assert!(result.violations.iter().any(|v| v.contains("exceeds maximum")));
    }

    #[tokio::test]
    async fn error_rate_doubling_fails_even_under_ceiling() {
        let baseline = snapshot(&[(ERROR_RATE_5XX, Some(0.0002)), (REQUEST_RATE, Some(2000.0))]);
        let current = snapshot(&[(ERROR_RATE_5XX, Some(0.0008)), (REQUEST_RATE, Some(2000.0))]);

        let result = ErrorRateValidator
            .validate(
                &sample_record("c1", "wave-1"),
                &baseline,
                &current,
                &ValidationThresholds::default(),
            )
            .await
            .expect("validate");
        assert!(!result.passed);
        assert!(result.violations.iter().any(|v| v.contains("increased 4.0x")));
    }

    #[tokio::test]
    async fn request_volume_drop_fails() {
        let baseline = snapshot(&[(ERROR_RATE_5XX, Some(0.0001)), (REQUEST_RATE, Some(2000.0))]);
        let current = snapshot(&[(ERROR_RATE_5XX, Some(0.0001)), (REQUEST_RATE, Some(1200.0))]);

        let result = ErrorRateValidator
            .validate(
                &sample_record("c1", "wave-1"),
                &baseline,
                &current,
                &ValidationThresholds::default(),
            )
            .await
            .expect("validate");
        assert!(!result.passed);
        assert!(result.violations.iter().any(|v| v.contains("dropped 40.0%")));
    }

    #[tokio::test]
    async fn low_volume_baseline_skips_drop_comparison() {
        let thresholds = ValidationThresholds::default();
        let baseline = snapshot(&[(ERROR_RATE_5XX, Some(0.0001)), (REQUEST_RATE, Some(100.0))]);
        let current = snapshot(&[(ERROR_RATE_5XX, Some(0.0001)), (REQUEST_RATE, Some(10.0))]);

        let result = ErrorRateValidator
            .validate(&sample_record("c1", "wave-1"), &baseline, &current, &thresholds)
            .await
            .expect("validate");
        assert!(result.passed);
        assert!(result.violations.iter().any(|v| v.starts_with("info:")));
    }

    #[tokio::test]
    async fn snapshot_capture_preserves_query_failures_as_none() {
        let metrics = ScriptedMetrics {
            failing: vec![ERROR_RATE_5XX.to_string()],
            ..ScriptedMetrics::with_scalars(&[
                (LATENCY_P95, 100.0),
                (LATENCY_P99, 180.0),
                (REQUEST_RATE, 2000.0),
            ])
        };
        let orchestrator = ValidationOrchestrator::new(Arc::new(metrics));
        let registry = registry_with_defaults();

        let snapshot = orchestrator
            .capture_snapshot(
                &registry,
                &sample_record("c1", "wave-1"),
                Duration::from_secs(600),
            )
            .await;

        assert_eq!(snapshot.value(LATENCY_P95), Some(100.0));
        assert_eq!(snapshot.metrics.get(ERROR_RATE_5XX), Some(&None));
        assert_eq!(snapshot.missing(), vec![ERROR_RATE_5XX]);
    }

    #[tokio::test]
    async fn verdict_fails_on_any_critical_failure_without_fail_fast() {
        let orchestrator =
            ValidationOrchestrator::new(Arc::new(ScriptedMetrics::default()));
        let registry = registry_with_defaults();

        let baseline = snapshot(&[
            (LATENCY_P95, Some(100.0)),
            (LATENCY_P99, Some(180.0)),
            (ERROR_RATE_5XX, Some(0.0001)),
            (REQUEST_RATE, Some(2000.0)),
        ]);
        let current = snapshot(&[
            (LATENCY_P95, Some(130.0)),
            (LATENCY_P99, Some(181.0)),
            (ERROR_RATE_5XX, Some(0.0001)),
            (REQUEST_RATE, Some(2000.0)),
        ]);

        let run = orchestrator
            .validate(
                &registry,
                &sample_record("c1", "wave-1"),
                &baseline,
                &current,
                &ValidationThresholds::default(),
            )
            .await;

        assert!(!run.passed);
        // fail_fast is off: the error-rate validator still ran.
        assert_eq!(run.results.len(), 2);
        assert!(run.violations().iter().any(|v| v.contains("p95")));
    }

    struct NeverPassesValidator;

    #[async_trait]
    impl Validator for NeverPassesValidator {
        fn name(&self) -> &str {
            "never-passes"
        }

        fn description(&self) -> &str {
            "always fails, non-critical"
        }

        fn is_critical(&self) -> bool {
            false
        }

        fn required_metrics(&self) -> Vec<String> {
            Vec::new()
        }

        async fn validate(
            &self,
            cluster: &ClusterRecord,
            _baseline: &MetricsSnapshot,
            _current: &MetricsSnapshot,
            _thresholds: &ValidationThresholds,
        ) -> Result<ValidationResult> {
            Ok(failure_result(cluster, "never-passes", "advisory only".to_string()))
        }
    }

    #[tokio::test]
    async fn non_critical_failure_does_not_flip_the_verdict() {
        let orchestrator =
            ValidationOrchestrator::new(Arc::new(ScriptedMetrics::default()));
        let mut registry = ValidatorRegistry::new();
        registry
            .register(Arc::new(NeverPassesValidator))
            .expect("register");

        let empty = snapshot(&[]);
        let run = orchestrator
            .validate(
                &registry,
                &sample_record("c1", "wave-1"),
                &empty,
                &empty,
                &ValidationThresholds::default(),
            )
            .await;

        assert!(run.passed, "non-critical failures are advisory");
        assert_eq!(run.violations().len(), 1);
    }

    struct StuckValidator;

    #[async_trait]
    impl Validator for StuckValidator {
        fn name(&self) -> &str {
            "stuck"
        }

        fn description(&self) -> &str {
            "sleeps past its own timeout"
        }

        fn timeout(&self) -> Duration {
            Duration::from_millis(50)
        }

        fn required_metrics(&self) -> Vec<String> {
            Vec::new()
        }

        async fn validate(
            &self,
            _cluster: &ClusterRecord,
            _baseline: &MetricsSnapshot,
            _current: &MetricsSnapshot,
            _thresholds: &ValidationThresholds,
        ) -> Result<ValidationResult> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            unreachable!("timeout fires first")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn validator_timeout_becomes_a_failing_result() {
        let orchestrator =
            ValidationOrchestrator::new(Arc::new(ScriptedMetrics::default()));
        let mut registry = ValidatorRegistry::new();
        registry.register(Arc::new(StuckValidator)).expect("register");

        let empty = snapshot(&[]);
        let run = orchestrator
            .validate(
                &registry,
                &sample_record("c1", "wave-1"),
                &empty,
                &empty,
                &ValidationThresholds::default(),
            )
            .await;

        assert!(!run.passed);
        assert!(run.results[0].violations[0].contains("timed out"));
    }
}
