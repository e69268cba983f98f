//! Coordinator tests
//!
//! These tests register fake collectors so the concurrency and
//! all-or-nothing behavior can be checked without touching the host.

#[cfg(test)]
mod coordinator_tests {
    use crate::collector::{
        CollectError, Collector, CollectorRegistry, CoordinatorConfig, LocalCollector,
    };
    use crate::deadline::{CancelScope, Deadline};
    use crate::models::{metadata_keys, Measurement, MeasurementType, Subtype};
    use crate::observability::SnapshotMetrics;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    /// Fake collector with a fixed delay and outcome
    struct FakeCollector {
        category: MeasurementType,
        reports_as: MeasurementType,
        delay: Duration,
        fail: bool,
        finished: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Collector for FakeCollector {
        async fn collect(&self, _deadline: &Deadline) -> Result<Measurement> {
            // Deliberately ignores the deadline; the coordinator must bound it
            tokio::time::sleep(self.delay).await;
            if self.fail {
                anyhow::bail!("{} source unavailable", self.category);
            }
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(Measurement::new(self.reports_as)
                .with_subtype(Subtype::new("fake").with("ok", true)))
        }
    }

    struct PanickingCollector;

    #[async_trait]
    impl Collector for PanickingCollector {
        async fn collect(&self, _deadline: &Deadline) -> Result<Measurement> {
            panic!("collector bug");
        }
    }

    fn register_fake(
        registry: &mut CollectorRegistry,
        category: MeasurementType,
        delay: Duration,
        fail: bool,
        finished: &Arc<AtomicUsize>,
    ) {
        let finished = Arc::clone(finished);
        registry.register(category, move || {
            Arc::new(FakeCollector {
                category,
                reports_as: category,
                delay,
                fail,
                finished: Arc::clone(&finished),
            })
        });
    }

    fn all_fakes(delay: Duration, finished: &Arc<AtomicUsize>) -> CollectorRegistry {
        let mut registry = CollectorRegistry::new();
        for category in MeasurementType::ALL {
            register_fake(&mut registry, category, delay, false, finished);
        }
        registry
    }

    fn coordinator(registry: CollectorRegistry, timeout: Duration) -> LocalCollector {
        LocalCollector::new(
            registry,
            SnapshotMetrics::new().unwrap(),
            CoordinatorConfig {
                timeout,
                node_name: "test-node".to_string(),
            },
        )
    }

    fn metric_value(metrics: &SnapshotMetrics, name: &str) -> f64 {
        metrics
            .registry()
            .gather()
            .iter()
            .filter(|family| family.get_name() == name)
            .flat_map(|family| family.get_metric())
            .map(|metric| {
                if metric.has_histogram() {
                    metric.get_histogram().get_sample_sum()
                } else if metric.has_counter() {
                    metric.get_counter().get_value()
                } else {
                    metric.get_gauge().get_value()
                }
            })
            .sum()
    }

    #[tokio::test]
    async fn test_all_collectors_succeed() {
        let finished = Arc::new(AtomicUsize::new(0));
        let local = coordinator(
            all_fakes(Duration::from_millis(50), &finished),
            Duration::from_secs(2),
        );

        let snapshot = local.measure(None).await.unwrap();

        assert_eq!(snapshot.measurements.len(), 4);
        for category in MeasurementType::ALL {
            let count = snapshot
                .measurements
                .iter()
                .filter(|m| m.measurement_type == category)
                .count();
            assert_eq!(count, 1, "expected exactly one {} measurement", category);
        }
        assert_eq!(
            snapshot.metadata.get(metadata_keys::SOURCE_NODE).map(String::as_str),
            Some("test-node")
        );
        assert!(snapshot.metadata.contains_key(metadata_keys::TIMESTAMP));
        assert_eq!(finished.load(Ordering::SeqCst), 4);

        let metrics = local.metrics();
        assert!(metric_value(metrics, "nodesnap_collection_duration_seconds") > 0.0);
        assert!(metric_value(metrics, "nodesnap_collector_duration_seconds") > 0.0);
        assert_eq!(metric_value(metrics, "nodesnap_snapshot_measurements"), 4.0);
        assert_eq!(metric_value(metrics, "nodesnap_collection_attempts_total"), 1.0);
    }

    #[tokio::test]
    async fn test_single_failure_returns_no_snapshot() {
        let finished = Arc::new(AtomicUsize::new(0));
        let mut registry = all_fakes(Duration::from_millis(20), &finished);
        register_fake(
            &mut registry,
            MeasurementType::GPU,
            Duration::from_millis(5),
            true,
            &finished,
        );

        let result = coordinator(registry, Duration::from_secs(2))
            .measure(None)
            .await;

        match result {
            Err(CollectError::Collector { category, source }) => {
                assert_eq!(category, "GPU");
                assert!(source.to_string().contains("unavailable"));
            }
            other => panic!("expected collector failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failure_cancels_slow_siblings() {
        let finished = Arc::new(AtomicUsize::new(0));
        let mut registry = all_fakes(Duration::from_secs(10), &finished);
        register_fake(
            &mut registry,
            MeasurementType::K8s,
            Duration::from_secs(1),
            true,
            &finished,
        );

        let start = Instant::now();
        let result = coordinator(registry, Duration::from_secs(30))
            .measure(None)
            .await;
        let elapsed = start.elapsed();

        assert!(matches!(
            result,
            Err(CollectError::Collector { ref category, .. }) if category == "K8s"
        ));
        assert!(elapsed >= Duration::from_millis(900));
        assert!(
            elapsed < Duration::from_secs(3),
            "collection should fail fast, took {:?}",
            elapsed
        );
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_parent_cancellation_stops_collectors() {
        let finished = Arc::new(AtomicUsize::new(0));
        let local = coordinator(
            all_fakes(Duration::from_secs(30), &finished),
            Duration::from_secs(60),
        );

        let scope = CancelScope::new();
        let parent = scope.deadline(Duration::from_secs(60));

        let start = Instant::now();
        let (result, _) = tokio::join!(local.measure(Some(&parent)), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            scope.cancel();
        });

        assert!(matches!(result, Err(CollectError::Cancelled { .. })));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_parent_expiry_bounds_collection() {
        let finished = Arc::new(AtomicUsize::new(0));
        let local = coordinator(
            all_fakes(Duration::from_secs(30), &finished),
            Duration::from_secs(60),
        );

        let parent = Deadline::after(Duration::from_millis(100));
        let start = Instant::now();
        let result = local.measure(Some(&parent)).await;

        assert!(matches!(result, Err(CollectError::DeadlineExceeded { .. })));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_own_timeout_bounds_collection() {
        let finished = Arc::new(AtomicUsize::new(0));
        let local = coordinator(
            all_fakes(Duration::from_secs(30), &finished),
            Duration::from_millis(100),
        );

        let result = local.measure(None).await;
        assert!(matches!(result, Err(CollectError::DeadlineExceeded { .. })));
    }

    #[tokio::test]
    async fn test_mismatched_measurement_type_is_rejected() {
        let finished = Arc::new(AtomicUsize::new(0));
        let mut registry = CollectorRegistry::new();
        let counter = Arc::clone(&finished);
        registry.register(MeasurementType::OS, move || {
            Arc::new(FakeCollector {
                category: MeasurementType::OS,
                reports_as: MeasurementType::GPU,
                delay: Duration::from_millis(1),
                fail: false,
                finished: Arc::clone(&counter),
            })
        });

        let result = coordinator(registry, Duration::from_secs(2))
            .measure(None)
            .await;
        assert!(matches!(result, Err(CollectError::Collector { .. })));
    }

    #[tokio::test]
    async fn test_panicking_collector_fails_collection() {
        let finished = Arc::new(AtomicUsize::new(0));
        let mut registry = all_fakes(Duration::from_millis(10), &finished);
        registry.register(MeasurementType::SystemD, || Arc::new(PanickingCollector));

        let result = coordinator(registry, Duration::from_secs(2))
            .measure(None)
            .await;
        assert!(matches!(result, Err(CollectError::Panicked(_))));
    }

    #[tokio::test]
    async fn test_empty_registry_yields_header_only() {
        let snapshot = coordinator(CollectorRegistry::new(), Duration::from_secs(1))
            .measure(None)
            .await
            .unwrap();

        assert!(snapshot.measurements.is_empty());
        assert!(snapshot.metadata.contains_key(metadata_keys::VERSION));
    }
}
