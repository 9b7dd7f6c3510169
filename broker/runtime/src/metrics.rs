use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

/// Counts OSB requests by action, and failed requests by action and status.
#[derive(Clone, Debug, Default)]
pub struct OsbMetrics {
    actions: Family<ActionLabels, Counter>,
    errors: Family<ErrorLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ActionLabels {
    action: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ErrorLabels {
    action: &'static str,
    status: u16,
}

// === impl OsbMetrics ===

impl OsbMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let actions = Family::<ActionLabels, Counter>::default();
        reg.register("actions", "Total number of OSB requests", actions.clone());

        let errors = Family::<ErrorLabels, Counter>::default();
        reg.register(
            "errors",
            "Total number of OSB requests that failed",
            errors.clone(),
        );

        Self { actions, errors }
    }

    pub(crate) fn action(&self, action: &'static str) {
        self.actions.get_or_create(&ActionLabels { action }).inc();
    }

    pub(crate) fn error(&self, action: &'static str, status: http::StatusCode) {
        self.errors
            .get_or_create(&ErrorLabels {
                action,
                status: status.as_u16(),
            })
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_counters() {
        let mut prom = Registry::default();
        let metrics = OsbMetrics::register(prom.sub_registry_with_prefix("osb"));
        metrics.action("provision");
        metrics.action("provision");
        metrics.error("provision", http::StatusCode::CONFLICT);

        let mut text = String::new();
        prometheus_client::encoding::text::encode(&mut text, &prom).expect("metrics must encode");
        assert!(
            text.contains("osb_actions_total{action=\"provision\"} 2"),
            "{text}"
        );
        assert!(
            text.contains("osb_errors_total{action=\"provision\",status=\"409\"} 1"),
            "{text}"
        );
    }
}
