use metrics::counter;

pub const EVENTS_ADMITTED_TOTAL: &str = "beacon_events_admitted_total";
pub const EVENTS_DROPPED_TOTAL: &str = "beacon_events_dropped_total";
pub const EVENTS_DELIVERED_TOTAL: &str = "beacon_events_delivered_total";
pub const BATCHES_SENT_TOTAL: &str = "beacon_batches_sent_total";
pub const BATCHES_FAILED_TOTAL: &str = "beacon_batches_failed_total";
pub const BATCHES_PERSISTED_TOTAL: &str = "beacon_batches_persisted_total";
pub const BATCHES_RECOVERED_TOTAL: &str = "beacon_batches_recovered_total";
pub const DELIVERY_RETRIES_TOTAL: &str = "beacon_delivery_retries_total";

pub fn report_dropped_events(cause: &'static str, quantity: u64) {
    counter!(EVENTS_DROPPED_TOTAL, "cause" => cause).increment(quantity);
}

pub fn report_admitted_events(quantity: u64) {
    counter!(EVENTS_ADMITTED_TOTAL).increment(quantity);
}

pub fn report_batch_sent(backend: &str, events: u64) {
    counter!(BATCHES_SENT_TOTAL, "backend" => backend.to_string()).increment(1);
    counter!(EVENTS_DELIVERED_TOTAL, "backend" => backend.to_string()).increment(events);
}

pub fn report_batch_failed(backend: &str, cause: &'static str) {
    counter!(BATCHES_FAILED_TOTAL, "backend" => backend.to_string(), "cause" => cause).increment(1);
}

pub fn report_batch_persisted(backend: &str) {
    counter!(BATCHES_PERSISTED_TOTAL, "backend" => backend.to_string()).increment(1);
}

pub fn report_batch_recovered(backend: &str) {
    counter!(BATCHES_RECOVERED_TOTAL, "backend" => backend.to_string()).increment(1);
}

pub fn report_delivery_retry(backend: &str) {
    counter!(DELIVERY_RETRIES_TOTAL, "backend" => backend.to_string()).increment(1);
}
