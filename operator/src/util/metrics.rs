use prometheus::{
    HistogramVec, IntCounterVec, register_histogram_vec, register_int_counter_vec,
};

/// Per-controller reconciliation metrics, registered on the default
/// prometheus registry and scraped by the server in `crate::metrics`.
pub struct ControllerMetrics {
    /// Total number of reconciliations per resource.
    pub reconcile_counter: IntCounterVec,

    /// Reconciliation outcomes by action.
    pub action_counter: IntCounterVec,

    /// Duration of the read phase (deciding what to do).
    pub read_histogram: HistogramVec,

    /// Duration of the write phase (doing it).
    pub write_histogram: HistogramVec,
}

impl ControllerMetrics {
    /// Must be called at most once per controller name; prometheus
    /// rejects duplicate registrations.
    pub fn new(controller: &str) -> Self {
        ControllerMetrics {
            reconcile_counter: register_int_counter_vec!(
                format!("vidra_{controller}_reconcile_total"),
                "Total number of reconciliations per resource.",
                &["name"]
            )
            .unwrap(),
            action_counter: register_int_counter_vec!(
                format!("vidra_{controller}_action_total"),
                "Reconciliation outcomes by action.",
                &["name", "action"]
            )
            .unwrap(),
            read_histogram: register_histogram_vec!(
                format!("vidra_{controller}_read_seconds"),
                "Duration of the read phase of reconciliation.",
                &["name", "action"]
            )
            .unwrap(),
            write_histogram: register_histogram_vec!(
                format!("vidra_{controller}_write_seconds"),
                "Duration of the write phase of reconciliation.",
                &["name", "action"]
            )
            .unwrap(),
        }
    }
}
