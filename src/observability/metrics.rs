use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub assignments_total: IntCounterVec,
    pub assignment_latency_seconds: HistogramVec,
    pub transitions_total: IntCounterVec,
    pub loads_created_total: IntCounter,
    pub feed_events_total: IntCounter,
    pub subscribers_connected: IntGauge,
    pub subscriber_drops_total: IntCounterVec,
    pub store_retries_total: IntCounterVec,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let assignments_total = IntCounterVec::new(
            Opts::new("assignments_total", "Assignment attempts by outcome"),
            &["outcome"],
        )
        .expect("valid assignments_total metric");

        let assignment_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "assignment_latency_seconds",
                "Latency of assignment requests in seconds",
            ),
            &["outcome"],
        )
        .expect("valid assignment_latency_seconds metric");

        let transitions_total = IntCounterVec::new(
            Opts::new(
                "transitions_total",
                "Completion and cancellation attempts by kind and outcome",
            ),
            &["kind", "outcome"],
        )
        .expect("valid transitions_total metric");

        let loads_created_total =
            IntCounter::new("loads_created_total", "Loads accepted through intake")
                .expect("valid loads_created_total metric");

        let feed_events_total =
            IntCounter::new("feed_events_total", "Events appended to the change feed")
                .expect("valid feed_events_total metric");

        let subscribers_connected = IntGauge::new(
            "subscribers_connected",
            "Clients currently registered with the subscription hub",
        )
        .expect("valid subscribers_connected metric");

        let subscriber_drops_total = IntCounterVec::new(
            Opts::new(
                "subscriber_drops_total",
                "Subscriptions ended by the hub, by reason",
            ),
            &["reason"],
        )
        .expect("valid subscriber_drops_total metric");

        let store_retries_total = IntCounterVec::new(
            Opts::new(
                "store_retries_total",
                "Retries after transient store failures, by operation",
            ),
            &["operation"],
        )
        .expect("valid store_retries_total metric");

        registry
            .register(Box::new(assignments_total.clone()))
            .expect("register assignments_total");
        registry
            .register(Box::new(assignment_latency_seconds.clone()))
            .expect("register assignment_latency_seconds");
        registry
            .register(Box::new(transitions_total.clone()))
            .expect("register transitions_total");
        registry
            .register(Box::new(loads_created_total.clone()))
            .expect("register loads_created_total");
        registry
            .register(Box::new(feed_events_total.clone()))
            .expect("register feed_events_total");
        registry
            .register(Box::new(subscribers_connected.clone()))
            .expect("register subscribers_connected");
        registry
            .register(Box::new(subscriber_drops_total.clone()))
            .expect("register subscriber_drops_total");
        registry
            .register(Box::new(store_retries_total.clone()))
            .expect("register store_retries_total");

        Self {
            registry,
            assignments_total,
            assignment_latency_seconds,
            transitions_total,
            loads_created_total,
            feed_events_total,
            subscribers_connected,
            subscriber_drops_total,
            store_retries_total,
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
