use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub offers_total: IntCounterVec,
    pub matching_cycles_total: IntCounterVec,
    pub candidate_search_seconds: HistogramVec,
    pub active_offers: IntGauge,
    pub unpublished_events: IntGauge,
    pub events_published_total: IntCounterVec,
    pub events_consumed_total: IntCounterVec,
    pub broker_reconnects_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let offers_total = IntCounterVec::new(
            Opts::new("offers_total", "Driver offers by outcome"),
            &["outcome"],
        )
        .expect("valid offers_total metric");

        let matching_cycles_total = IntCounterVec::new(
            Opts::new("matching_cycles_total", "Finished matching cycles by outcome"),
            &["outcome"],
        )
        .expect("valid matching_cycles_total metric");

        let candidate_search_seconds = HistogramVec::new(
            HistogramOpts::new(
                "candidate_search_seconds",
                "Latency of candidate lookup against the vehicle directory",
            ),
            &["outcome"],
        )
        .expect("valid candidate_search_seconds metric");

        let active_offers = IntGauge::new("active_offers", "Offers currently awaiting a driver")
            .expect("valid active_offers metric");

        let unpublished_events = IntGauge::new(
            "unpublished_events",
            "Outbound events held back while the broker refuses them",
        )
        .expect("valid unpublished_events metric");

        let events_published_total = IntCounterVec::new(
            Opts::new("events_published_total", "Outbound events by topic and outcome"),
            &["topic", "outcome"],
        )
        .expect("valid events_published_total metric");

        let events_consumed_total = IntCounterVec::new(
            Opts::new("events_consumed_total", "Inbound events by topic and outcome"),
            &["topic", "outcome"],
        )
        .expect("valid events_consumed_total metric");

        let broker_reconnects_total = IntCounterVec::new(
            Opts::new("broker_reconnects_total", "Broker reconnect attempts by outcome"),
            &["outcome"],
        )
        .expect("valid broker_reconnects_total metric");

        registry
            .register(Box::new(offers_total.clone()))
            .expect("register offers_total");
        registry
            .register(Box::new(matching_cycles_total.clone()))
            .expect("register matching_cycles_total");
        registry
            .register(Box::new(candidate_search_seconds.clone()))
            .expect("register candidate_search_seconds");
        registry
            .register(Box::new(active_offers.clone()))
            .expect("register active_offers");
        registry
            .register(Box::new(unpublished_events.clone()))
            .expect("register unpublished_events");
        registry
            .register(Box::new(events_published_total.clone()))
            .expect("register events_published_total");
        registry
            .register(Box::new(events_consumed_total.clone()))
            .expect("register events_consumed_total");
        registry
            .register(Box::new(broker_reconnects_total.clone()))
            .expect("register broker_reconnects_total");

        Self {
            registry,
            offers_total,
            matching_cycles_total,
            candidate_search_seconds,
            active_offers,
            unpublished_events,
            events_published_total,
            events_consumed_total,
            broker_reconnects_total,
        }
    }

    pub fn offer(&self, outcome: &str) {
        self.offers_total.with_label_values(&[outcome]).inc();
    }

    pub fn cycle(&self, outcome: &str) {
        self.matching_cycles_total.with_label_values(&[outcome]).inc();
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
