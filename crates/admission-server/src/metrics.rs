use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec, TextEncoder,
};

lazy_static! {
    static ref ADMISSIONS_RECEIVED: IntCounter = register_int_counter!(
        "requests_total",
        "The total number of admission requests received"
    )
    .unwrap();
    static ref ADMISSIONS_ADMITTED: IntCounter = register_int_counter!(
        "admissions_admitted_total",
        "The total number of admission requests that were admitted"
    )
    .unwrap();
    static ref ADMISSIONS_DENIED: IntCounterVec = register_int_counter_vec!(
        "admissions_denied_total",
        "The total number of admission requests that were denied",
        &["timeout"]
    )
    .unwrap();
    static ref VALIDATIONS: IntCounterVec = register_int_counter_vec!(
        "validations_total",
        "The total number of image validations performed",
        &["type", "validator_name", "result"]
    )
    .unwrap();
    static ref VALIDATIONS_SUCCESSFUL: IntCounterVec = register_int_counter_vec!(
        "validations_successful_total",
        "The total number of image validations that were successful",
        &["type", "validator_name"]
    )
    .unwrap();
    static ref VALIDATIONS_FAILED: IntCounterVec = register_int_counter_vec!(
        "validations_failed_total",
        "The total number of image validations that failed",
        &["type", "validator_name"]
    )
    .unwrap();
    static ref VALIDATIONS_SKIPPED: IntCounterVec = register_int_counter_vec!(
        "validations_skipped_total",
        "The total number of image validations that were skipped",
        &["type", "validator_name", "reason"]
    )
    .unwrap();
    static ref VALIDATIONS_TIMEOUTED: IntCounterVec = register_int_counter_vec!(
        "validations_timeouted_total",
        "The total number of image validations that timed out",
        &["type", "validator_name"]
    )
    .unwrap();
}

pub fn inc_admissions_received() {
    ADMISSIONS_RECEIVED.inc();
}

pub fn inc_admissions_admitted() {
    ADMISSIONS_ADMITTED.inc();
}

pub fn inc_admissions_denied(timeout: bool) {
    let label = if timeout { "true" } else { "false" };
    ADMISSIONS_DENIED.with_label_values(&[label]).inc();
}

/// Increments the total and successful validation counters.
pub fn inc_validations_successful(validator_type: &str, validator_name: &str) {
    VALIDATIONS
        .with_label_values(&[validator_type, validator_name, "success"])
        .inc();
    VALIDATIONS_SUCCESSFUL
        .with_label_values(&[validator_type, validator_name])
        .inc();
}

/// Increments the total and failed validation counters.
pub fn inc_validations_failed(validator_type: &str, validator_name: &str) {
    VALIDATIONS
        .with_label_values(&[validator_type, validator_name, "error"])
        .inc();
    VALIDATIONS_FAILED
        .with_label_values(&[validator_type, validator_name])
        .inc();
}

/// Increments the skipped counter, but not the total.
pub fn inc_validations_skipped(validator_type: &str, validator_name: &str, reason: &str) {
    VALIDATIONS_SKIPPED
        .with_label_values(&[validator_type, validator_name, reason])
        .inc();
}

/// Increments the total and timed-out validation counters.
pub fn inc_validations_timeouted(validator_type: &str, validator_name: &str) {
    VALIDATIONS
        .with_label_values(&[validator_type, validator_name, "error"])
        .inc();
    VALIDATIONS_TIMEOUTED
        .with_label_values(&[validator_type, validator_name])
        .inc();
}

/// Text exposition of all registered counters.
pub fn gather() -> String {
    TextEncoder::new()
        .encode_to_string(&prometheus::gather())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_register_and_expose() {
        inc_admissions_received();
        inc_admissions_admitted();
        inc_admissions_denied(true);
        inc_validations_successful("static", "default");
        inc_validations_failed("cosign", "default");
        inc_validations_skipped("cosign", "default", "cache hit");
        inc_validations_timeouted("notaryv1", "default");

        let exposition = gather();
        assert!(exposition.contains("requests_total"));
        assert!(exposition.contains("admissions_denied_total"));
        assert!(exposition.contains("validations_skipped_total"));
        assert!(exposition.contains("reason=\"cache hit\""));
    }
}
