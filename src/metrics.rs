use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

use crate::error::Result;

/// Prometheus series owned by the gateway.
///
/// Pushkins hold an `Arc<Metrics>` and record per-device outcomes with their
/// app pattern as the label, so one noisy app is visible in isolation.
pub struct Metrics {
    registry: Registry,

    pub notifications_received: IntCounter,
    pub devices_dispatched: IntCounterVec,
    pub device_outcomes: IntCounterVec,

    /// Admission-control drops, one per upstream call refused because the
    /// pushkin's in-flight limit was reached.
    pub inflight_request_limit_drop: IntCounterVec,

    /// Unix timestamp at which an APNs provider certificate expires.
    pub apns_certificate_expiry: IntGaugeVec,

    pub notify_duration: Histogram,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let notifications_received = IntCounter::new(
            "notifications_received_total",
            "Inbound notify requests accepted for dispatch",
        )?;
        let devices_dispatched = IntCounterVec::new(
            Opts::new("devices_dispatched_total", "Devices handed to a pushkin"),
            &["app"],
        )?;
        let device_outcomes = IntCounterVec::new(
            Opts::new(
                "device_outcomes_total",
                "Per-device dispatch outcomes by app",
            ),
            &["app", "outcome"],
        )?;
        let inflight_request_limit_drop = IntCounterVec::new(
            Opts::new(
                "inflight_request_limit_drop",
                "Upstream calls dropped because the in-flight limit was reached",
            ),
            &["app"],
        )?;
        let apns_certificate_expiry = IntGaugeVec::new(
            Opts::new(
                "apns_certificate_expiry_seconds",
                "Expiry time of the APNs provider certificate, seconds since epoch",
            ),
            &["app"],
        )?;
        let notify_duration = Histogram::with_opts(HistogramOpts::new(
            "notify_request_duration_seconds",
            "Wall-clock time spent handling a notify request",
        ))?;

        registry.register(Box::new(notifications_received.clone()))?;
        registry.register(Box::new(devices_dispatched.clone()))?;
        registry.register(Box::new(device_outcomes.clone()))?;
        registry.register(Box::new(inflight_request_limit_drop.clone()))?;
        registry.register(Box::new(apns_certificate_expiry.clone()))?;
        registry.register(Box::new(notify_duration.clone()))?;

        Ok(Self {
            registry,
            notifications_received,
            devices_dispatched,
            device_outcomes,
            inflight_request_limit_drop,
            apns_certificate_expiry,
            notify_duration,
        })
    }

    /// Renders the registry in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn render_includes_registered_series() {
        let metrics = Metrics::new().unwrap();
        metrics.notifications_received.inc();
        metrics
            .inflight_request_limit_drop
            .with_label_values(&["com.example.app"])
            .inc();

        let rendered = metrics.render().unwrap();
        assert!(rendered.contains("notifications_received_total 1"));
        assert!(rendered.contains("inflight_request_limit_drop{app=\"com.example.app\"} 1"));
    }
}
