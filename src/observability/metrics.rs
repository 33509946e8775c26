use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub offers_sent_total: IntCounterVec,
    pub requests_expired_total: IntCounterVec,
    pub ride_transitions_total: IntCounterVec,
    pub active_connections: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let offers_sent_total = IntCounterVec::new(
            Opts::new("offers_sent_total", "Ride offers delivered, by batch"),
            &["batch"],
        )
        .expect("valid offers_sent_total metric");

        let requests_expired_total = IntCounterVec::new(
            Opts::new(
                "requests_expired_total",
                "Ride requests expired, by reason",
            ),
            &["reason"],
        )
        .expect("valid requests_expired_total metric");

        let ride_transitions_total = IntCounterVec::new(
            Opts::new(
                "ride_transitions_total",
                "Ride lifecycle transitions, by target state",
            ),
            &["to"],
        )
        .expect("valid ride_transitions_total metric");

        let active_connections =
            IntGauge::new("active_connections", "Currently open socket connections")
                .expect("valid active_connections metric");

        registry
            .register(Box::new(offers_sent_total.clone()))
            .expect("register offers_sent_total");
        registry
            .register(Box::new(requests_expired_total.clone()))
            .expect("register requests_expired_total");
        registry
            .register(Box::new(ride_transitions_total.clone()))
            .expect("register ride_transitions_total");
        registry
            .register(Box::new(active_connections.clone()))
            .expect("register active_connections");

        Self {
            registry,
            offers_sent_total,
            requests_expired_total,
            ride_transitions_total,
            active_connections,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
