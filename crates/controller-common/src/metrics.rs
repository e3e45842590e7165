//! Prometheus metrics shared by the controllers

use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Metrics for reconciliation and cloud API health
#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,

    /// Reconcile outcomes by controller and result ("ok", "requeue", "error")
    pub reconcile_total: IntCounterVec,

    /// Failed cloud API calls by error kind
    pub cloud_errors_total: IntCounterVec,

    /// Services currently holding a floating IP
    pub bound_services: IntGauge,
}

impl Metrics {
    /// Create and register the metrics in a fresh registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let reconcile_total = IntCounterVec::new(
            Opts::new("reconcile_total", "Reconciliations by controller and result"),
            &["controller", "result"],
        )?;
        registry.register(Box::new(reconcile_total.clone()))?;

        let cloud_errors_total = IntCounterVec::new(
            Opts::new("cloud_errors_total", "Failed CloudSigma API calls by error kind"),
            &["kind"],
        )?;
        registry.register(Box::new(cloud_errors_total.clone()))?;

        let bound_services = IntGauge::new("bound_services", "Services holding a floating IP")?;
        registry.register(Box::new(bound_services.clone()))?;

        Ok(Self {
            registry,
            reconcile_total,
            cloud_errors_total,
            bound_services,
        })
    }

    /// Count one reconcile outcome
    pub fn reconciled(&self, controller: &str, result: &str) {
        self.reconcile_total.with_label_values(&[controller, result]).inc();
    }

    /// Count one failed cloud call
    pub fn cloud_error(&self, kind: &str) {
        self.cloud_errors_total.with_label_values(&[kind]).inc();
    }

    /// Text exposition of every registered metric
    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_contains_recorded_series() {
        let metrics = Metrics::new().unwrap();
        metrics.reconciled("machine", "ok");
        metrics.cloud_error("permission_denied");
        metrics.bound_services.set(3);

        let text = metrics.encode();
        assert!(text.contains(r#"reconcile_total{controller="machine",result="ok"} 1"#));
        assert!(text.contains(r#"cloud_errors_total{kind="permission_denied"} 1"#));
        assert!(text.contains("bound_services 3"));
    }
}
