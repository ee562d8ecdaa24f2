use crate::service::State;

pub(crate) const METRIC_SERVICE_TRANSITIONS: &str = "lifecycle_service_transitions_total";
pub(crate) const METRIC_FANOUT_VERDICT: &str = "lifecycle_fanout_verdict_total";
pub(crate) const METRIC_FANOUT_DURATION: &str = "lifecycle_fanout_duration_seconds";

pub(crate) fn emit_transition(service: &str, from: State, to: State) {
    metrics::counter!(
        METRIC_SERVICE_TRANSITIONS,
        "service" => service.to_string(),
        "from" => from.as_str(),
        "to" => to.as_str()
    )
    .increment(1);
}

pub(crate) fn emit_fanout_verdict(action: &'static str, success: bool, duration_secs: f64) {
    let verdict = if success { "success" } else { "failure" };
    metrics::counter!(
        METRIC_FANOUT_VERDICT,
        "action" => action,
        "verdict" => verdict
    )
    .increment(1);
    metrics::histogram!(
        METRIC_FANOUT_DURATION,
        "action" => action,
        "verdict" => verdict
    )
    .record(duration_secs);
}
