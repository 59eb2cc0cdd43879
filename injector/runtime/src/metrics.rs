use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

/// Counts admission requests by how they were answered.
#[derive(Clone, Debug)]
pub struct AdmissionMetrics {
    requests: Family<Labels, Counter>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// The pod was patched with the sidecar.
    Injected,
    /// The pod was allowed unchanged.
    Skipped,
    /// An admission response with `allowed: false` was returned.
    Denied,
    /// The request was refused with an HTTP error status.
    Rejected,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct Labels {
    outcome: &'static str,
}

// === impl AdmissionMetrics ===

impl AdmissionMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let requests = Family::<Labels, Counter>::default();
        reg.register(
            "requests",
            "Total number of admission requests handled, by outcome",
            requests.clone(),
        );

        // Pre-register every outcome so that all series are exported from the
        // start.
        for outcome in [
            Outcome::Injected,
            Outcome::Skipped,
            Outcome::Denied,
            Outcome::Rejected,
        ] {
            let _ = requests.get_or_create(&Labels {
                outcome: outcome.as_str(),
            });
        }

        Self { requests }
    }

    pub(crate) fn observe(&self, outcome: Outcome) {
        self.requests
            .get_or_create(&Labels {
                outcome: outcome.as_str(),
            })
            .inc();
    }
}

// === impl Outcome ===

impl Outcome {
    fn as_str(self) -> &'static str {
        match self {
            Self::Injected => "injected",
            Self::Skipped => "skipped",
            Self::Denied => "denied",
            Self::Rejected => "rejected",
        }
    }
}
