use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
struct OutcomeLabels {
    outcome: String,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
struct PaymentLabels {
    method: String,
    status: String,
}

pub struct Metrics {
    registry: Registry,
    idempotency_outcomes: Family<OutcomeLabels, Counter>,
    reaped_records: Counter,
    payments: Family<PaymentLabels, Counter>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let idempotency_outcomes = Family::<OutcomeLabels, Counter>::default();
        let reaped_records = Counter::default();
        let payments = Family::<PaymentLabels, Counter>::default();

        let mut registry = Registry::default();
        registry.register(
            // prometheus-client appends "_total" to Counter names, so avoid duplicating it here.
            "idempotency_outcomes",
            "Idempotency acquisition and release outcomes",
            idempotency_outcomes.clone(),
        );
        registry.register(
            "idempotency_reaped_records",
            "Idempotency records deleted by the TTL reaper",
            reaped_records.clone(),
        );
        registry.register(
            "payments_created",
            "Payments created, by method and resulting status",
            payments.clone(),
        );

        Self {
            registry,
            idempotency_outcomes,
            reaped_records,
            payments,
        }
    }

    pub fn idempotency_outcome(&self, outcome: &str) {
        self.idempotency_outcomes
            .get_or_create(&OutcomeLabels {
                outcome: outcome.to_string(),
            })
            .inc();
    }

    pub fn idempotency_outcome_count(&self, outcome: &str) -> u64 {
        self.idempotency_outcomes
            .get_or_create(&OutcomeLabels {
                outcome: outcome.to_string(),
            })
            .get()
    }

    pub fn reaped(&self, count: u64) {
        self.reaped_records.inc_by(count);
    }

    pub fn payment_created(&self, method: &str, status: &str) {
        self.payments
            .get_or_create(&PaymentLabels {
                method: method.to_string(),
                status: status.to_string(),
            })
            .inc();
    }

    pub fn render(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}
