use std::collections::HashMap;

use serde_json::Value;
use tracing::warn;

use crate::event::CapturedEvent;

/// Numbers are snapped to this grid before entering a fingerprint, so
/// near-identical payloads (pointer coordinates, elapsed millis) collapse
/// onto the same key.
const NUMERIC_GRID: f64 = 10.0;
/// Longest string fragment contributing to a fingerprint.
const MAX_FIELD_CHARS: usize = 32;

/// Stable key identifying "the same event fired again". Name plus the
/// top-level payload fields, sorted, with values quantized.
pub fn fingerprint(event: &CapturedEvent) -> String {
    let mut fields: Vec<String> = event
        .properties
        .iter()
        .map(|(key, value)| format!("{}={}", key, quantize(value)))
        .collect();
    fields.sort_unstable();

    format!("{}|{}", event.event, fields.join("|"))
}

fn quantize(value: &Value) -> String {
    match value {
        Value::Number(number) => match number.as_f64() {
            Some(float) => {
                let snapped = (float / NUMERIC_GRID).round() * NUMERIC_GRID;
                format!("{snapped}")
            }
            None => number.to_string(),
        },
        Value::String(text) => text.chars().take(MAX_FIELD_CHARS).collect(),
        Value::Bool(flag) => flag.to_string(),
        Value::Null => "null".to_string(),
        // nested structures contribute arity only; deep contents never make
        // near-duplicates distinct
        Value::Array(items) => format!("[{}]", items.len()),
        Value::Object(entries) => format!("{{{}}}", entries.len()),
    }
}

/// Recently-seen fingerprints with their last-seen time. Bounded by a soft
/// ceiling (prune on insert) and a hard ceiling (full clear).
pub struct FingerprintCache {
    seen: HashMap<String, i64>,
    soft_capacity: usize,
    hard_capacity: usize,
}

pub const SOFT_CAPACITY: usize = 512;
pub const HARD_CAPACITY: usize = 2048;
/// Share of entries evicted, oldest first, when window pruning alone does
/// not get back under the soft ceiling.
const EVICT_FRACTION: f64 = 0.15;

impl FingerprintCache {
    pub fn new(soft_capacity: usize, hard_capacity: usize) -> Self {
        FingerprintCache {
            seen: HashMap::new(),
            soft_capacity,
            hard_capacity,
        }
    }

    /// Returns true when `key` was seen within `window_ms` of `now_ms`. The
    /// entry's timestamp is refreshed either way, so a steady stream of
    /// duplicates stays suppressed.
    pub fn check_and_record(&mut self, key: String, now_ms: i64, window_ms: i64) -> bool {
        let duplicate = match self.seen.get(&key) {
            Some(&last_seen) => now_ms - last_seen < window_ms,
            None => false,
        };

        if self.seen.len() >= self.hard_capacity && !self.seen.contains_key(&key) {
            warn!(
                entries = self.seen.len(),
                "fingerprint cache hit hard ceiling, clearing"
            );
            self.seen.clear();
        } else if self.seen.len() > self.soft_capacity {
            self.prune(now_ms, window_ms);
        }

        self.seen.insert(key, now_ms);
        duplicate
    }

    fn prune(&mut self, now_ms: i64, window_ms: i64) {
        self.seen.retain(|_, last_seen| now_ms - *last_seen < window_ms);

        if self.seen.len() > self.soft_capacity {
            let mut by_age: Vec<(String, i64)> = self
                .seen
                .iter()
                .map(|(key, last_seen)| (key.clone(), *last_seen))
                .collect();
            by_age.sort_unstable_by_key(|(_, last_seen)| *last_seen);

            let evict = (self.seen.len() as f64 * EVICT_FRACTION).ceil() as usize;
            for (key, _) in by_age.into_iter().take(evict) {
                self.seen.remove(&key);
            }
        }
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
